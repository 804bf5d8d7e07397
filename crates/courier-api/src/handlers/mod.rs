//! HTTP request handlers.
//!
//! - `health` - health, readiness and liveness endpoints
//! - `callbacks` - verification of inbound signed callbacks

pub mod callbacks;
pub mod health;

pub use callbacks::receive_callback;
pub use health::{health_check, liveness_check, readiness_check};
