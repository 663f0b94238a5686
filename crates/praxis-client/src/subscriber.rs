//! Subscriber callbacks and handles.
//!
//! A subscriber is a set of callbacks attached to one endpoint's shared
//! connection, plus an optional local filter. Callbacks are `Arc`ed so a
//! subscriber survives the transport being swapped out underneath it on
//! reconnect; the handle stays valid for the life of the subscription.

use std::sync::Arc;

use uuid::Uuid;

use praxis_core::{ChangeEvent, Error, StreamMessage, SubscriptionFilter};

type MessageFn = dyn Fn(StreamMessage) + Send + Sync;
type NotifyFn = dyn Fn() + Send + Sync;
type ErrorFn = dyn Fn(&Error) + Send + Sync;

/// Callback set for one subscription.
///
/// `on_message` is required; the rest are optional lifecycle hooks.
/// `on_open` fires on every successful (re)open, `on_close` whenever the
/// transport stops being open, `on_error` on transport failures including
/// the terminal one after the retry budget runs out.
#[derive(Clone)]
pub struct Subscriber {
    on_message: Arc<MessageFn>,
    on_open: Option<Arc<NotifyFn>>,
    on_close: Option<Arc<NotifyFn>>,
    on_error: Option<Arc<ErrorFn>>,
    filter: Option<SubscriptionFilter>,
}

impl Subscriber {
    pub fn new(on_message: impl Fn(StreamMessage) + Send + Sync + 'static) -> Self {
        Self {
            on_message: Arc::new(on_message),
            on_open: None,
            on_close: None,
            on_error: None,
            filter: None,
        }
    }

    pub fn with_on_open(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_open = Some(Arc::new(f));
        self
    }

    pub fn with_on_close(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(f));
        self
    }

    pub fn with_on_error(mut self, f: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Restrict which change events this subscriber sees, on top of whatever
    /// filter the server applied. System messages always pass.
    pub fn with_filter(mut self, filter: SubscriptionFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Whether this subscriber wants the given change event.
    pub fn wants(&self, event: &ChangeEvent) -> bool {
        self.filter.as_ref().map_or(true, |f| f.matches(event))
    }

    pub(crate) fn deliver(&self, message: StreamMessage) {
        match &message {
            StreamMessage::Change(event) if !self.wants(event) => {}
            _ => (self.on_message)(message),
        }
    }

    pub(crate) fn notify_open(&self) {
        if let Some(f) = &self.on_open {
            f();
        }
    }

    pub(crate) fn notify_close(&self) {
        if let Some(f) = &self.on_close {
            f();
        }
    }

    pub(crate) fn notify_error(&self, error: &Error) {
        if let Some(f) = &self.on_error {
            f(error);
        }
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

/// Proof of a registered subscription; pass it back to unsubscribe.
///
/// Handles are tied to the endpoint entry, not the underlying socket, so
/// they stay valid across reconnects. Unsubscribing twice with the same
/// handle is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub(crate) endpoint: String,
    pub(crate) id: Uuid,
}

impl SubscriptionHandle {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}
