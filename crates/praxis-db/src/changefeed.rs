//! Change feed plumbing: the NOTIFY channel contract, trigger installation,
//! and LISTEN helpers.
//!
//! Every tracked table carries one AFTER ROW trigger that publishes a
//! compact JSON payload on [`CHANGE_CHANNEL`]. Because NOTIFY is
//! transactional in PostgreSQL, a payload is delivered exactly when the
//! producing transaction commits; rollbacks emit nothing. The broadcast
//! server holds one listening connection built from [`connect`] (or
//! [`listen`] when a pool is at hand) and treats its loss as the most
//! important failure in the system.

use sqlx::postgres::{PgListener, PgPool};
use tracing::{debug, info};

use praxis_core::{Entity, Result};

/// The single NOTIFY channel every tracked table publishes on.
pub const CHANGE_CHANNEL: &str = "praxis_changes";

/// Name of the trigger installed on each tracked table.
pub const TRIGGER_NAME: &str = "praxis_notify_change";

// The DDL lives in the migration file; re-running it at startup makes the
// feed self-healing on databases that were migrated externally.
const CHANGEFEED_SQL: &str = include_str!("../../../migrations/0002_changefeed.sql");

/// Tables observed by the change feed, paired with the entity each maps to.
pub fn tracked_tables() -> impl Iterator<Item = (&'static str, Entity)> {
    Entity::ALL.into_iter().map(|e| (e.table(), e))
}

/// Install (or refresh) the trigger function and per-table triggers.
///
/// Idempotent; safe to run at every server start.
pub async fn install(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(CHANGEFEED_SQL).execute(pool).await?;
    info!(
        subsystem = "db",
        component = "changefeed",
        op = "install",
        channel = CHANGE_CHANNEL,
        "Change feed triggers installed"
    );
    Ok(())
}

/// Per-table state reported by [`verify`].
#[derive(Debug, Clone)]
pub struct ChangefeedStatus {
    pub entity: Entity,
    pub table: &'static str,
    pub table_exists: bool,
    pub trigger_installed: bool,
}

impl ChangefeedStatus {
    /// True when the table exists and carries the change trigger.
    pub fn healthy(&self) -> bool {
        self.table_exists && self.trigger_installed
    }
}

/// Report which tracked tables exist and carry the change trigger.
///
/// Resolution follows the connection's search_path, so scratch-schema test
/// databases verify their own copies.
pub async fn verify(pool: &PgPool) -> Result<Vec<ChangefeedStatus>> {
    let mut statuses = Vec::with_capacity(Entity::ALL.len());
    for (table, entity) in tracked_tables() {
        let (table_exists, trigger_installed): (bool, bool) = sqlx::query_as(
            "SELECT to_regclass($1) IS NOT NULL,
                    EXISTS (
                        SELECT 1 FROM pg_trigger
                        WHERE tgrelid = to_regclass($1)
                          AND tgname = $2
                          AND NOT tgisinternal
                    )",
        )
        .bind(table)
        .bind(TRIGGER_NAME)
        .fetch_one(pool)
        .await?;

        statuses.push(ChangefeedStatus {
            entity,
            table,
            table_exists,
            trigger_installed,
        });
    }
    Ok(statuses)
}

/// Open a dedicated listening connection on the change channel, using the
/// pool's connect options.
pub async fn listen(pool: &PgPool) -> Result<PgListener> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(CHANGE_CHANNEL).await?;
    debug!(
        subsystem = "db",
        component = "changefeed",
        op = "listen",
        channel = CHANGE_CHANNEL,
        "Listening on change channel"
    );
    Ok(listener)
}

/// Open a dedicated listening connection on the change channel from a
/// database URL.
///
/// The broadcast server's reconnect loop uses this to build a fresh
/// connection after a drop, without holding a pool.
pub async fn connect(database_url: &str) -> Result<PgListener> {
    let mut listener = PgListener::connect(database_url).await?;
    listener.listen(CHANGE_CHANNEL).await?;
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracked_tables_cover_every_entity() {
        let tables: Vec<_> = tracked_tables().collect();
        assert_eq!(tables.len(), Entity::ALL.len());
        for entity in Entity::ALL {
            assert!(tables.iter().any(|(t, e)| *e == entity && *t == entity.table()));
        }
    }

    #[test]
    fn test_tracked_tables_are_distinct() {
        let mut tables: Vec<_> = tracked_tables().map(|(t, _)| t).collect();
        tables.sort_unstable();
        tables.dedup();
        assert_eq!(tables.len(), Entity::ALL.len());
    }

    #[test]
    fn test_migration_targets_every_tracked_table() {
        // The migration file and this module must agree on the contract.
        assert!(CHANGEFEED_SQL.contains(CHANGE_CHANNEL));
        assert!(CHANGEFEED_SQL.contains(TRIGGER_NAME));
        for (table, _) in tracked_tables() {
            assert!(
                CHANGEFEED_SQL.contains(&format!("ON {table}")),
                "migration is missing a trigger on {table}"
            );
        }
    }

    #[test]
    fn test_migration_emits_canonical_entity_tags() {
        for entity in Entity::ALL {
            assert!(
                CHANGEFEED_SQL.contains(&format!("'{}'", entity.as_str())),
                "migration does not map any table to {entity}"
            );
        }
    }
}
