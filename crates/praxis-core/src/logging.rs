//! Structured logging schema and field name constants for praxis.
//!
//! All crates use these constants for consistent structured logging fields.
//! This ensures log aggregation tools (Loki, Elasticsearch) can query by
//! standardized field names across every subsystem.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention (upstream listener down) |
//! | WARN  | Recoverable issue, automatic fallback applied (dropped payload, dead client) |
//! | INFO  | Lifecycle events (startup, shutdown, connection accept/close) |
//! | DEBUG | Decision points, per-event emission, config choices |
//! | TRACE | High-volume data (raw payloads, per-frame delivery) |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Subsystem originating the log event.
/// Values: "live", "db", "client"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "listener", "registry", "pool", "manager"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "accept", "close", "broadcast", "reconnect"
pub const OPERATION: &str = "op";

/// Streaming connection UUID.
pub const CONNECTION_ID: &str = "connection_id";

// ─── Event fields ──────────────────────────────────────────────────────────

/// Entity wire tag of a change event.
pub const ENTITY: &str = "entity";

/// Action wire tag (insert/update/delete).
pub const ACTION: &str = "action";

/// Affected record id.
pub const RECORD_ID: &str = "record_id";

/// Owning project scope of an event or filter.
pub const PROJECT_ID: &str = "project_id";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// Reconnect attempt number (1-based).
pub const ATTEMPT: &str = "attempt";

/// Number of active event bus subscribers.
pub const SUBSCRIBER_COUNT: &str = "subscriber_count";

/// Number of registered streaming connections.
pub const CONNECTION_COUNT: &str = "connection_count";

// ─── Database fields ───────────────────────────────────────────────────────

/// Number of active connections in the pool.
pub const POOL_SIZE: &str = "pool_size";

/// Number of idle connections in the pool.
pub const POOL_IDLE: &str = "pool_idle";

/// Database table affected.
pub const DB_TABLE: &str = "db_table";

/// NOTIFY channel name.
pub const CHANNEL: &str = "channel";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";
