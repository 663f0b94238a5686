//! Stream connection manager: one socket per endpoint, shared by all local
//! subscribers.
//!
//! Every endpoint URL maps to at most one entry, and the entry in the map is
//! itself the in-flight token: N concurrent `subscribe` calls find the entry
//! (whatever state it is in) and attach instead of dialing again. A driver
//! task per entry owns the socket and walks the connection state machine
//!
//! ```text
//! Connecting -> Open -> Closing -> (removed)      manual close
//! Connecting -> Open -> Reconnecting -> Connecting unexpected drop
//! Connecting -> Open -> Closed                    server said goodbye
//! ```
//!
//! with the authoritative state stored in the entry, never in the driver.
//! Reviving a dead entry bumps a generation counter; a stale driver notices
//! its generation is gone and exits without touching the replacement.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::subscriber::{Subscriber, SubscriptionHandle};
use praxis_core::{defaults, Error, StreamMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type EndpointMap = HashMap<String, Endpoint>;

/// Connection state of one endpoint entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// No transport; not trying to get one.
    Closed,
    /// Actively dialing.
    Connecting,
    /// Transport up; messages flow.
    Open,
    /// Graceful close in progress after the last unsubscribe.
    Closing,
    /// Transport lost; waiting out the backoff before redialing.
    Reconnecting,
}

impl ConnState {
    /// Lowercase tag for UI and log output.
    pub fn label(&self) -> &'static str {
        match self {
            ConnState::Closed => "closed",
            ConnState::Connecting => "connecting",
            ConnState::Open => "open",
            ConnState::Closing => "closing",
            ConnState::Reconnecting => "reconnecting",
        }
    }
}

/// Queryable snapshot of an endpoint's connection, for "live vs
/// reconnecting vs disconnected" UI affordances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnStatus {
    pub state: ConnState,
    /// Failed attempts since the last successful open.
    pub attempt: u32,
    /// The retry budget ran out; only a new `subscribe` revives the entry.
    pub exhausted: bool,
}

/// Configuration for the stream manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Reconnect attempts before giving up and reporting a terminal
    /// disconnected state.
    pub max_reconnect_attempts: u32,
    /// Base delay between attempts (attempt N waits N * base).
    pub reconnect_base: Duration,
    /// Outbound send buffer, in messages.
    pub send_buffer: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: defaults::CLIENT_MAX_RECONNECT_ATTEMPTS,
            reconnect_base: Duration::from_millis(defaults::CLIENT_RECONNECT_BASE_MS),
            send_buffer: defaults::CLIENT_SEND_BUFFER,
        }
    }
}

impl ManagerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `PRAXIS_CLIENT_MAX_RECONNECT_ATTEMPTS` | `10` | Retry budget |
    /// | `PRAXIS_CLIENT_RECONNECT_BASE_MS` | `1000` | Linear backoff base |
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(n) = std::env::var("PRAXIS_CLIENT_MAX_RECONNECT_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
        {
            config.max_reconnect_attempts = n;
        }
        if let Some(ms) = std::env::var("PRAXIS_CLIENT_RECONNECT_BASE_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            config.reconnect_base = Duration::from_millis(ms);
        }
        config
    }

    pub fn with_max_reconnect_attempts(mut self, n: u32) -> Self {
        self.max_reconnect_attempts = n;
        self
    }

    pub fn with_reconnect_base(mut self, base: Duration) -> Self {
        self.reconnect_base = base;
        self
    }

    /// Delay before reconnect attempt `attempt` (1-based), linear in the
    /// attempt number. The attempt bound keeps the total wait finite.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.reconnect_base.saturating_mul(attempt)
    }
}

/// One endpoint's entry: the authoritative connection state plus everyone
/// attached to it.
struct Endpoint {
    /// Bumped each time the entry is revived; drivers carry the generation
    /// they were spawned under and stand down when it no longer matches.
    generation: u64,
    state: ConnState,
    attempt: u32,
    exhausted: bool,
    /// Set by the last unsubscribe. Distinguishes "user closed" from
    /// "connection dropped": the driver must not reconnect past it.
    user_closed: bool,
    subscribers: HashMap<Uuid, Subscriber>,
    close: Arc<Notify>,
    out_tx: mpsc::Sender<String>,
}

/// Manager for shared stream connections, one per endpoint URL.
///
/// Cheap to clone; clones share the endpoint map. Must be used inside a
/// tokio runtime (each endpoint spawns a driver task).
#[derive(Clone)]
pub struct StreamManager {
    inner: Arc<Mutex<EndpointMap>>,
    config: ManagerConfig,
}

impl StreamManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Attach a subscriber to `endpoint`, dialing it if this is the first.
    ///
    /// If an entry already exists (even one still connecting or waiting out
    /// a reconnect delay) the subscriber attaches to it; no second socket
    /// is opened. Attaching to an already-open connection fires the
    /// subscriber's `on_open` immediately. A dead entry (user close still
    /// tearing down, or retries exhausted) is revived with a fresh retry
    /// budget.
    pub fn subscribe(
        &self,
        endpoint: impl Into<String>,
        subscriber: Subscriber,
    ) -> SubscriptionHandle {
        let endpoint = endpoint.into();
        let id = Uuid::new_v4();
        let mut fire_open = false;

        {
            let mut map = self.inner.lock().unwrap();
            match map.get_mut(&endpoint) {
                // Closed entries (server goodbye or exhausted retries) have
                // no driver left; they need a revive, not an attach.
                Some(entry) if !entry.user_closed && entry.state != ConnState::Closed => {
                    entry.subscribers.insert(id, subscriber.clone());
                    fire_open = entry.state == ConnState::Open;
                    debug!(
                        endpoint = %endpoint,
                        subscribers = entry.subscribers.len(),
                        state = entry.state.label(),
                        "Subscriber attached to existing connection"
                    );
                }
                Some(entry) => {
                    entry.generation += 1;
                    entry.state = ConnState::Connecting;
                    entry.attempt = 0;
                    entry.exhausted = false;
                    entry.user_closed = false;
                    entry.close = Arc::new(Notify::new());
                    let (out_tx, out_rx) = mpsc::channel(self.config.send_buffer);
                    entry.out_tx = out_tx;
                    entry.subscribers.insert(id, subscriber.clone());
                    info!(endpoint = %endpoint, "Reviving dead stream connection");
                    self.spawn_driver(
                        endpoint.clone(),
                        entry.generation,
                        Arc::clone(&entry.close),
                        out_rx,
                    );
                }
                None => {
                    let close = Arc::new(Notify::new());
                    let (out_tx, out_rx) = mpsc::channel(self.config.send_buffer);
                    let mut subscribers = HashMap::new();
                    subscribers.insert(id, subscriber.clone());
                    map.insert(
                        endpoint.clone(),
                        Endpoint {
                            generation: 0,
                            state: ConnState::Connecting,
                            attempt: 0,
                            exhausted: false,
                            user_closed: false,
                            subscribers,
                            close: Arc::clone(&close),
                            out_tx,
                        },
                    );
                    info!(endpoint = %endpoint, "Opening stream connection");
                    self.spawn_driver(endpoint.clone(), 0, close, out_rx);
                }
            }
        }

        if fire_open {
            subscriber.notify_open();
        }
        SubscriptionHandle { endpoint, id }
    }

    /// Detach a subscriber. Idempotent: unknown handles are ignored.
    ///
    /// When the last subscriber leaves, the entry is marked user-closed and
    /// the driver is told to close the socket gracefully (normal close
    /// code). The flag also cancels any pending reconnect delay.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let mut map = self.inner.lock().unwrap();
        let Some(entry) = map.get_mut(&handle.endpoint) else {
            return;
        };
        if entry.subscribers.remove(&handle.id).is_none() {
            return;
        }
        debug!(
            endpoint = %handle.endpoint,
            subscribers = entry.subscribers.len(),
            "Subscriber detached"
        );
        if entry.subscribers.is_empty() {
            entry.user_closed = true;
            entry.state = ConnState::Closing;
            entry.close.notify_one();
            info!(endpoint = %handle.endpoint, "Last subscriber left; closing stream connection");
        }
    }

    /// Best-effort outbound send; the stream is server-to-client, so this
    /// only exists for the rare client request. Dropped with a warning when
    /// the connection is not open; callers must not assume delivery.
    pub fn send(&self, endpoint: &str, message: impl Into<String>) {
        let map = self.inner.lock().unwrap();
        match map.get(endpoint) {
            Some(entry) if entry.state == ConnState::Open => {
                if entry.out_tx.try_send(message.into()).is_err() {
                    warn!(endpoint, "Dropping outbound message; send buffer unavailable");
                }
            }
            _ => {
                warn!(endpoint, "Dropping outbound message; connection not open");
            }
        }
    }

    /// Connection status for an endpoint, or `None` if nothing ever
    /// subscribed to it (or its teardown completed).
    pub fn status(&self, endpoint: &str) -> Option<ConnStatus> {
        self.inner.lock().unwrap().get(endpoint).map(|e| ConnStatus {
            state: e.state,
            attempt: e.attempt,
            exhausted: e.exhausted,
        })
    }

    /// Number of endpoints with an entry (live or mid-teardown).
    pub fn endpoint_count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    fn spawn_driver(
        &self,
        endpoint: String,
        generation: u64,
        close: Arc<Notify>,
        out_rx: mpsc::Receiver<String>,
    ) {
        let inner = Arc::clone(&self.inner);
        let config = self.config.clone();
        tokio::spawn(drive(inner, config, endpoint, generation, close, out_rx));
    }
}

impl Default for StreamManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

/// Why the pump stopped.
enum PumpOutcome {
    /// The last subscriber left.
    UserClose,
    /// Server sent a normal close: a clean end, no reconnect.
    ServerClosed,
    /// Anything else: error, EOF, abnormal close.
    Broken(Error),
}

/// What to do after a failed attempt.
enum FailurePlan {
    Retry(Duration),
    GiveUp(Vec<Subscriber>),
    /// Entry removed or replaced; stand down.
    Gone,
}

/// Driver task: owns the socket for one endpoint entry and one generation.
async fn drive(
    inner: Arc<Mutex<EndpointMap>>,
    config: ManagerConfig,
    endpoint: String,
    generation: u64,
    close: Arc<Notify>,
    mut out_rx: mpsc::Receiver<String>,
) {
    loop {
        // Dial, abandonable by a user close at any point.
        let dialed = tokio::select! {
            result = tokio_tungstenite::connect_async(&endpoint) => result,
            _ = close.notified() => {
                remove_if_current(&inner, &endpoint, generation);
                return;
            }
        };

        let mut ws = match dialed {
            Ok((ws, _response)) => ws,
            Err(e) => {
                let error = Error::Transport(format!("connect failed: {e}"));
                match register_failure(&inner, &config, &endpoint, generation, &error) {
                    FailurePlan::Retry(delay) => {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => continue,
                            _ = close.notified() => {
                                remove_if_current(&inner, &endpoint, generation);
                                return;
                            }
                        }
                    }
                    FailurePlan::GiveUp(subscribers) => {
                        give_up(&endpoint, &config, &subscribers);
                        return;
                    }
                    FailurePlan::Gone => return,
                }
            }
        };

        let Some(subscribers) = mark_open(&inner, &endpoint, generation) else {
            // Replaced or torn down while dialing.
            let _ = ws.close(None).await;
            return;
        };
        info!(endpoint = %endpoint, "Stream connection open");
        for subscriber in &subscribers {
            subscriber.notify_open();
        }

        match pump(&inner, &endpoint, generation, &close, &mut out_rx, &mut ws).await {
            PumpOutcome::UserClose => {
                let _ = ws
                    .close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "unsubscribed".into(),
                    }))
                    .await;
                remove_if_current(&inner, &endpoint, generation);
                debug!(endpoint = %endpoint, "Stream connection closed by user");
                return;
            }
            PumpOutcome::ServerClosed => {
                let subscribers = settle_closed(&inner, &endpoint, generation);
                info!(endpoint = %endpoint, "Server closed the stream; not reconnecting");
                for subscriber in &subscribers {
                    subscriber.notify_close();
                }
                return;
            }
            PumpOutcome::Broken(error) => {
                let subscribers = snapshot_subscribers(&inner, &endpoint, generation);
                for subscriber in &subscribers {
                    subscriber.notify_close();
                    subscriber.notify_error(&error);
                }
                match register_failure(&inner, &config, &endpoint, generation, &error) {
                    FailurePlan::Retry(delay) => {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = close.notified() => {
                                remove_if_current(&inner, &endpoint, generation);
                                return;
                            }
                        }
                    }
                    FailurePlan::GiveUp(subscribers) => {
                        give_up(&endpoint, &config, &subscribers);
                        return;
                    }
                    FailurePlan::Gone => return,
                }
            }
        }
    }
}

/// Pump one open socket until something ends it.
async fn pump(
    inner: &Arc<Mutex<EndpointMap>>,
    endpoint: &str,
    generation: u64,
    close: &Arc<Notify>,
    out_rx: &mut mpsc::Receiver<String>,
    ws: &mut WsStream,
) -> PumpOutcome {
    loop {
        tokio::select! {
            _ = close.notified() => return PumpOutcome::UserClose,
            outbound = out_rx.recv() => {
                match outbound {
                    Some(text) => {
                        if let Err(e) = ws.send(Message::Text(text)).await {
                            return PumpOutcome::Broken(Error::Transport(format!(
                                "send failed: {e}"
                            )));
                        }
                    }
                    // Sender dropped: the entry is gone or replaced.
                    None => return PumpOutcome::UserClose,
                }
            }
            frame = ws.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    dispatch(inner, endpoint, generation, &text);
                }
                Some(Ok(Message::Ping(payload))) => {
                    if ws.send(Message::Pong(payload)).await.is_err() {
                        return PumpOutcome::Broken(Error::Transport(
                            "pong failed".to_string(),
                        ));
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let normal = frame
                        .as_ref()
                        .map_or(false, |f| f.code == CloseCode::Normal);
                    return if normal {
                        PumpOutcome::ServerClosed
                    } else {
                        PumpOutcome::Broken(Error::Transport(format!(
                            "abnormal close: {frame:?}"
                        )))
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    return PumpOutcome::Broken(Error::Transport(e.to_string()));
                }
                None => {
                    return PumpOutcome::Broken(Error::Transport(
                        "connection ended".to_string(),
                    ));
                }
            }
        }
    }
}

/// Decode one inbound frame and hand it to every attached subscriber.
/// Undecodable frames are logged and dropped.
fn dispatch(inner: &Arc<Mutex<EndpointMap>>, endpoint: &str, generation: u64, text: &str) {
    let message = match serde_json::from_str::<StreamMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(endpoint, error = %e, "Dropping undecodable stream frame");
            return;
        }
    };
    // Snapshot first; callbacks must never run under the lock.
    let subscribers = snapshot_subscribers(inner, endpoint, generation);
    for subscriber in &subscribers {
        subscriber.deliver(message.clone());
    }
}

/// Record a failed attempt; decide between backoff, giving up, and standing
/// down.
fn register_failure(
    inner: &Arc<Mutex<EndpointMap>>,
    config: &ManagerConfig,
    endpoint: &str,
    generation: u64,
    error: &Error,
) -> FailurePlan {
    let mut map = inner.lock().unwrap();
    let Some(entry) = map.get_mut(endpoint) else {
        return FailurePlan::Gone;
    };
    if entry.generation != generation || entry.user_closed {
        return FailurePlan::Gone;
    }

    entry.attempt += 1;
    if entry.attempt > config.max_reconnect_attempts {
        entry.state = ConnState::Closed;
        entry.exhausted = true;
        return FailurePlan::GiveUp(entry.subscribers.values().cloned().collect());
    }

    entry.state = ConnState::Reconnecting;
    let delay = config.backoff_delay(entry.attempt);
    warn!(
        endpoint,
        attempt = entry.attempt,
        delay_ms = delay.as_millis() as u64,
        error = %error,
        "Stream connection lost; reconnecting"
    );
    FailurePlan::Retry(delay)
}

fn give_up(endpoint: &str, config: &ManagerConfig, subscribers: &[Subscriber]) {
    let terminal = Error::Transport(format!(
        "gave up on {endpoint} after {} reconnect attempts",
        config.max_reconnect_attempts
    ));
    warn!(endpoint, error = %terminal, "Stream connection permanently down");
    for subscriber in subscribers {
        subscriber.notify_error(&terminal);
    }
}

/// Transition to Open and reset the attempt counter; `None` if the entry is
/// gone or replaced.
fn mark_open(
    inner: &Arc<Mutex<EndpointMap>>,
    endpoint: &str,
    generation: u64,
) -> Option<Vec<Subscriber>> {
    let mut map = inner.lock().unwrap();
    let entry = map.get_mut(endpoint)?;
    if entry.generation != generation || entry.user_closed {
        return None;
    }
    entry.state = ConnState::Open;
    entry.attempt = 0;
    Some(entry.subscribers.values().cloned().collect())
}

/// Transition to Closed after a server-initiated clean close.
fn settle_closed(
    inner: &Arc<Mutex<EndpointMap>>,
    endpoint: &str,
    generation: u64,
) -> Vec<Subscriber> {
    let mut map = inner.lock().unwrap();
    match map.get_mut(endpoint) {
        Some(entry) if entry.generation == generation => {
            entry.state = ConnState::Closed;
            entry.subscribers.values().cloned().collect()
        }
        _ => Vec::new(),
    }
}

fn snapshot_subscribers(
    inner: &Arc<Mutex<EndpointMap>>,
    endpoint: &str,
    generation: u64,
) -> Vec<Subscriber> {
    let map = inner.lock().unwrap();
    match map.get(endpoint) {
        Some(entry) if entry.generation == generation => {
            entry.subscribers.values().cloned().collect()
        }
        _ => Vec::new(),
    }
}

fn remove_if_current(inner: &Arc<Mutex<EndpointMap>>, endpoint: &str, generation: u64) {
    let mut map = inner.lock().unwrap();
    if map.get(endpoint).is_some_and(|e| e.generation == generation) {
        map.remove(endpoint);
    }
}
