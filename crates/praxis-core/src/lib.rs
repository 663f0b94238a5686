//! # praxis-core
//!
//! Core types, events, and abstractions for praxis.
//!
//! This crate provides the change-event vocabulary, subscription filtering,
//! and the in-process event bus that the other praxis crates build on.

pub mod defaults;
pub mod error;
pub mod events;
pub mod logging;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use events::{Action, ChangeEvent, Entity, EventBus, StreamMessage, SubscriptionFilter};
