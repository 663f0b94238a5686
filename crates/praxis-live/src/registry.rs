//! Connection registry and fan-out.
//!
//! Tracks every live streaming connection together with its subscription
//! filter and per-connection outbound channel. The fan-out task is the only
//! consumer of the event bus wired to client delivery: it walks the registry
//! once per event, applies each connection's filter, and hands matching
//! frames to the transport tasks over bounded channels. A client that cannot
//! keep up loses frames, never the loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use praxis_core::{ChangeEvent, EventBus, StreamMessage, SubscriptionFilter};

/// Transport a client connection arrived over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    WebSocket,
    Sse,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::WebSocket => "websocket",
            Transport::Sse => "sse",
        }
    }
}

/// One registered client connection.
struct Connection {
    transport: Transport,
    filter: SubscriptionFilter,
    sender: mpsc::Sender<StreamMessage>,
    /// Last proof of life. Refreshed by pong traffic on WebSocket; SSE never
    /// refreshes it and is exempt from pruning.
    last_seen: Instant,
}

/// Live connection counts, grouped by transport.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ConnectionCounts {
    pub websocket: usize,
    pub sse: usize,
}

impl ConnectionCounts {
    pub fn total(&self) -> usize {
        self.websocket + self.sse
    }
}

/// Registry of live streaming connections.
///
/// Shared between the transport handlers (register/remove/touch) and the
/// fan-out and heartbeat tasks (broadcast/prune). All methods take the lock
/// briefly and never hold it across an await on client IO; delivery uses
/// `try_send` so one stalled consumer cannot wedge the map.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<Uuid, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Add a connection under a caller-chosen id.
    ///
    /// The caller generates the id so it can seed the outbound channel with
    /// the connected notice before the fan-out can observe the connection;
    /// the notice is then guaranteed to be the first frame out.
    pub async fn register(
        &self,
        id: Uuid,
        transport: Transport,
        filter: SubscriptionFilter,
        sender: mpsc::Sender<StreamMessage>,
    ) {
        let mut connections = self.connections.write().await;
        connections.insert(
            id,
            Connection {
                transport,
                filter,
                sender,
                last_seen: Instant::now(),
            },
        );
        info!(
            subsystem = "live",
            component = "registry",
            connection_id = %id,
            transport = transport.as_str(),
            total = connections.len(),
            "Client connected"
        );
    }

    /// Remove a connection; returns whether it was present.
    pub async fn remove(&self, id: Uuid) -> bool {
        let mut connections = self.connections.write().await;
        let removed = connections.remove(&id).is_some();
        if removed {
            info!(
                subsystem = "live",
                component = "registry",
                connection_id = %id,
                total = connections.len(),
                "Client disconnected"
            );
        }
        removed
    }

    /// Refresh a connection's liveness stamp.
    pub async fn touch(&self, id: Uuid) {
        if let Some(conn) = self.connections.write().await.get_mut(&id) {
            conn.last_seen = Instant::now();
        }
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }

    pub async fn counts(&self) -> ConnectionCounts {
        let connections = self.connections.read().await;
        let mut counts = ConnectionCounts::default();
        for conn in connections.values() {
            match conn.transport {
                Transport::WebSocket => counts.websocket += 1,
                Transport::Sse => counts.sse += 1,
            }
        }
        counts
    }

    /// Deliver one event to every connection whose filter matches.
    ///
    /// Returns the number of connections the frame was handed to. A full
    /// per-connection buffer drops the frame for that connection only;
    /// a closed one is removed from the registry on the spot.
    pub async fn broadcast(&self, event: &ChangeEvent) -> usize {
        let mut delivered = 0;
        let mut closed: Vec<Uuid> = Vec::new();
        {
            let connections = self.connections.read().await;
            for (id, conn) in connections.iter() {
                if !conn.filter.matches(event) {
                    continue;
                }
                match conn.sender.try_send(StreamMessage::Change(event.clone())) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // Slow consumer: skip it for this event. Whether the
                        // connection is still alive is the heartbeat's call.
                        debug!(
                            subsystem = "live",
                            component = "registry",
                            connection_id = %id,
                            entity = %event.entity,
                            "Client buffer full; dropping event for this connection"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }
        if !closed.is_empty() {
            let mut connections = self.connections.write().await;
            for id in closed {
                if connections.remove(&id).is_some() {
                    debug!(
                        subsystem = "live",
                        component = "registry",
                        connection_id = %id,
                        "Removed connection with closed channel"
                    );
                }
            }
        }
        delivered
    }

    /// Drop WebSocket connections without proof of life within `timeout`.
    ///
    /// Removal drops the outbound sender; the connection's send task observes
    /// the closed channel and tears the socket down. SSE connections carry no
    /// pong signal and are left to socket teardown.
    pub async fn prune_stale(&self, timeout: Duration) -> usize {
        let mut connections = self.connections.write().await;
        let before = connections.len();
        connections.retain(|id, conn| {
            if conn.transport != Transport::WebSocket {
                return true;
            }
            let idle = conn.last_seen.elapsed();
            if idle > timeout {
                warn!(
                    subsystem = "live",
                    component = "registry",
                    connection_id = %id,
                    idle_secs = idle.as_secs(),
                    "Dropping unresponsive connection"
                );
                false
            } else {
                true
            }
        });
        before - connections.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the connection from the registry when dropped.
///
/// SSE teardown is observable only as the response stream being dropped, so
/// the stream closure holds one of these.
pub struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    id: Uuid,
}

impl ConnectionGuard {
    pub fn new(registry: Arc<ConnectionRegistry>, id: Uuid) -> Self {
        Self { registry, id }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let registry = Arc::clone(&self.registry);
        let id = self.id;
        tokio::spawn(async move {
            registry.remove(id).await;
        });
    }
}

/// Spawn the fan-out task: bus events in, registry delivery out.
///
/// Runs until the bus is dropped. Lagging behind the bus (only possible if
/// this task stalls badly) skips events with a warning rather than dying.
pub fn spawn_fanout(
    bus: Arc<EventBus>,
    registry: Arc<ConnectionRegistry>,
) -> tokio::task::JoinHandle<()> {
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let delivered = registry.broadcast(&event).await;
                    debug!(
                        subsystem = "live",
                        component = "fanout",
                        entity = %event.entity,
                        action = %event.action,
                        delivered,
                        "Event fanned out"
                    );
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        subsystem = "live",
                        component = "fanout",
                        skipped,
                        "Fan-out lagged behind the event bus; events skipped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!(
                        subsystem = "live",
                        component = "fanout",
                        "Event bus closed; fan-out stopping"
                    );
                    break;
                }
            }
        }
    })
}

/// Spawn the heartbeat task: prune unresponsive WebSocket connections on a
/// fixed interval.
pub fn spawn_heartbeat(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let pruned = registry.prune_stale(timeout).await;
            if pruned > 0 {
                info!(
                    subsystem = "live",
                    component = "registry",
                    pruned,
                    "Pruned unresponsive connections"
                );
            }
        }
    })
}
