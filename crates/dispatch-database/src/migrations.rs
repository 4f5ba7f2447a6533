//! Database migrations.
//!
//! Migrations are run in order and tracked in the `migrations` table.
//! Timestamps are INTEGER Unix milliseconds throughout.

use crate::{DatabaseError, DatabaseResult};
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> DatabaseResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
    )?;

    if current_version > CURRENT_VERSION {
        return Err(DatabaseError::Migration(format!(
            "database schema version {current_version} is newer than supported version {CURRENT_VERSION}"
        )));
    }
    if current_version == CURRENT_VERSION {
        debug!(current_version, "Schema up to date");
        return Ok(());
    }

    info!(current_version, target_version = CURRENT_VERSION, "Running migrations");

    if current_version < 1 {
        migrate_v1_outbox_events(conn)?;
    }
    if current_version < 2 {
        migrate_v2_operations(conn)?;
    }
    if current_version < 3 {
        migrate_v3_payload_json_guard(conn)?;
    }

    info!("Migrations complete");
    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: outbox queue.
fn migrate_v1_outbox_events(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v1: outbox_events");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS outbox_events (
            event_id TEXT PRIMARY KEY,
            event_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            published_at INTEGER,
            dead_lettered_at INTEGER,
            attempts INTEGER NOT NULL DEFAULT 0,
            next_attempt_at INTEGER,
            claimed_at INTEGER,
            processing_token TEXT,
            causation_id TEXT,
            correlation_id TEXT,
            reason_code TEXT,
            error_class TEXT,
            error_stack TEXT,
            first_seen_at INTEGER,
            last_seen_at INTEGER,
            CHECK (published_at IS NULL OR dead_lettered_at IS NULL)
        );

        CREATE INDEX IF NOT EXISTS idx_outbox_events_pending
            ON outbox_events(created_at, event_id)
            WHERE published_at IS NULL AND dead_lettered_at IS NULL;
        CREATE INDEX IF NOT EXISTS idx_outbox_events_dead_lettered
            ON outbox_events(dead_lettered_at)
            WHERE dead_lettered_at IS NOT NULL;
        ",
    )?;

    record_migration(conn, 1, "outbox_events")?;
    Ok(())
}

/// V2: operation ledger keyed by dedupe key.
fn migrate_v2_operations(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v2: operations");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS operations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            dedupe_key TEXT NOT NULL,
            operation_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING',
            attempts INTEGER NOT NULL DEFAULT 0,
            payload TEXT NOT NULL,
            last_error TEXT,
            locked_at INTEGER,
            next_retry_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_operations_dedupe_key
            ON operations(dedupe_key);
        CREATE INDEX IF NOT EXISTS idx_operations_status_retry
            ON operations(status, next_retry_at);
        ",
    )?;

    record_migration(conn, 2, "operations")?;
    Ok(())
}

/// V3: reject outbox payloads that are not valid JSON.
///
/// Triggers rather than a CHECK: SQLite re-checks a CHECK on every update
/// of the row, which would block dead-lettering a row written before v3.
fn migrate_v3_payload_json_guard(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v3: payload_json_guard");

    conn.execute_batch(
        "
        CREATE TRIGGER IF NOT EXISTS outbox_events_payload_json_insert
            BEFORE INSERT ON outbox_events
            WHEN NOT json_valid(NEW.payload)
        BEGIN
            SELECT RAISE(ABORT, 'outbox_events.payload must be valid JSON');
        END;

        CREATE TRIGGER IF NOT EXISTS outbox_events_payload_json_update
            BEFORE UPDATE OF payload ON outbox_events
            WHEN NOT json_valid(NEW.payload)
        BEGIN
            SELECT RAISE(ABORT, 'outbox_events.payload must be valid JSON');
        END;
        ",
    )?;

    record_migration(conn, 3, "payload_json_guard")?;
    Ok(())
}
