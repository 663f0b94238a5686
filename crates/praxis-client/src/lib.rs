//! # praxis-client
//!
//! Client-side stream transport for praxis.
//!
//! This crate keeps one WebSocket per endpoint no matter how many local
//! subscribers want the stream: [`StreamManager::subscribe`] attaches to an
//! existing connection when there is one and dials otherwise, and the
//! connection stays up until the last subscriber leaves. Lost connections
//! are redialed with bounded linear backoff; per-subscriber filters trim
//! the shared stream locally.

pub mod manager;
pub mod subscriber;

// Re-export commonly used types at crate root
pub use manager::{ConnState, ConnStatus, ManagerConfig, StreamManager};
pub use subscriber::{Subscriber, SubscriptionHandle};
