//! Courier HTTP surface: health endpoints and verification of inbound signed
//! callbacks.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod handlers;
pub mod server;
pub mod state;

pub use config::Config;
pub use server::{create_router, shutdown_signal, start_server};
pub use state::{AppState, ReadinessCheck};
