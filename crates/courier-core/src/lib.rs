//! Core domain models and event types.
//!
//! Provides the subscription and delivery record entities, strongly-typed
//! identifiers, the injectable clock, delivery events for operator channels,
//! and the PostgreSQL repositories every other crate builds on.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use events::{
    DeliveryEvent, DeliveryExhaustedEvent, DeliveryFailedEvent, DeliverySucceededEvent,
    EventHandler, MulticastEventHandler, NoOpEventHandler,
};
pub use models::{
    CounterField, DeliveryId, DeliveryRecord, DeliveryStatus, SigningSecret, Subscription,
    SubscriptionId, SubscriptionStatus,
};
pub use time::{Clock, RealClock, TestClock};
