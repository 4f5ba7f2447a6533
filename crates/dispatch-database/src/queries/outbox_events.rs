use super::{from_millis, json_column, json_id_list, opt_from_millis, opt_to_millis, to_millis};
use crate::{
    ClaimWindow, DatabaseError, DatabaseResult, EventFailure, EventStateCounts, NewOutboxEvent,
    OutboxEvent, RecordedFailure,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, Row, Transaction, TransactionBehavior};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const EVENT_COLUMNS: &str = "event_id, event_type, payload, created_at, published_at, dead_lettered_at, attempts, next_attempt_at, claimed_at, processing_token, causation_id, correlation_id, reason_code, error_class, error_stack, first_seen_at, last_seen_at";

/// Claim eligibility. Binds `?1` = now, `?2` = stale-before.
const ELIGIBLE: &str = "published_at IS NULL AND dead_lettered_at IS NULL
    AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
    AND (claimed_at IS NULL OR claimed_at <= ?2)";

/// Lease ownership. Binds `?1` = event id, `?2` = processing token.
const OWNED: &str = "event_id = ?1 AND processing_token = ?2
    AND published_at IS NULL AND dead_lettered_at IS NULL";

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<OutboxEvent> {
    Ok(OutboxEvent {
        event_id: row.get(0)?,
        event_type: row.get(1)?,
        payload: json_column(2, row.get(2)?)?,
        created_at: from_millis(3, row.get(3)?)?,
        published_at: opt_from_millis(4, row.get(4)?)?,
        dead_lettered_at: opt_from_millis(5, row.get(5)?)?,
        attempts: row.get(6)?,
        next_attempt_at: opt_from_millis(7, row.get(7)?)?,
        claimed_at: opt_from_millis(8, row.get(8)?)?,
        processing_token: row.get(9)?,
        causation_id: row.get(10)?,
        correlation_id: row.get(11)?,
        reason_code: row.get(12)?,
        error_class: row.get(13)?,
        error_stack: row.get(14)?,
        first_seen_at: opt_from_millis(15, row.get(15)?)?,
        last_seen_at: opt_from_millis(16, row.get(16)?)?,
    })
}

// ==========================================
// Enqueue
// ==========================================

/// Insert a new outbox event.
///
/// Pass the connection (or transaction) that performs the domain write so
/// the event commits or rolls back with it. A duplicate `event_id` is an error.
pub fn insert_outbox_event(
    conn: &Connection,
    event: &NewOutboxEvent,
) -> DatabaseResult<OutboxEvent> {
    let payload = serde_json::to_string(&event.payload)?;
    conn.execute(
        "INSERT INTO outbox_events (event_id, event_type, payload, created_at, causation_id, correlation_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            event.event_id,
            event.event_type,
            payload,
            to_millis(event.created_at),
            event.causation_id,
            event.correlation_id,
        ],
    )?;

    info!(
        event_id = %event.event_id,
        event_type = %event.event_type,
        attempts = 0u32,
        correlation_id = event.correlation_id.as_deref().unwrap_or(""),
        "outbox event enqueued"
    );

    get_outbox_event(conn, &event.event_id)?
        .ok_or_else(|| DatabaseError::NotFound("Outbox event not found after insert".to_string()))
}

/// Get an outbox event by id.
pub fn get_outbox_event(conn: &Connection, event_id: &str) -> DatabaseResult<Option<OutboxEvent>> {
    let sql = format!("SELECT {EVENT_COLUMNS} FROM outbox_events WHERE event_id = ?1");
    let mut stmt = conn.prepare_cached(&sql)?;

    match stmt.query_row(params![event_id], row_to_event) {
        Ok(event) => Ok(Some(event)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Current lease token of an event. `None` when the row is missing or unleased.
pub fn processing_token_of(conn: &Connection, event_id: &str) -> DatabaseResult<Option<String>> {
    let result = conn.query_row(
        "SELECT processing_token FROM outbox_events WHERE event_id = ?1",
        params![event_id],
        |row| row.get::<_, Option<String>>(0),
    );

    match result {
        Ok(token) => Ok(token),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// ==========================================
// Claiming
// ==========================================

/// Read up to `window.lookahead` eligible events, oldest first.
///
/// This is a plain read; on its own it does not lease anything. A row
/// that cannot be decoded (malformed payload, out of range timestamp) is
/// dead-lettered with `INVALID_DATA` and left out, so one bad row cannot
/// stall every claim.
pub fn select_claim_candidates(
    conn: &Connection,
    window: &ClaimWindow,
) -> DatabaseResult<Vec<OutboxEvent>> {
    let sql = format!(
        "SELECT {EVENT_COLUMNS} FROM outbox_events
         WHERE {ELIGIBLE}
         ORDER BY created_at ASC, event_id ASC
         LIMIT ?3"
    );
    let (events, undecodable) = {
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query(params![
            to_millis(window.now),
            to_millis(window.stale_before),
            window.lookahead as i64
        ])?;
        decode_events(rows)?
    };

    for (event_id, err) in undecodable {
        quarantine_undecodable_event(conn, window, &event_id, &err)?;
    }
    Ok(events)
}

fn is_decode_error(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::IntegralValueOutOfRange(..)
    )
}

/// Decode rows one at a time. Rows that fail to decode come back as
/// `(event_id, error)` instead of failing the whole read.
fn decode_events(
    mut rows: rusqlite::Rows<'_>,
) -> DatabaseResult<(Vec<OutboxEvent>, Vec<(String, rusqlite::Error)>)> {
    let mut events = Vec::new();
    let mut undecodable = Vec::new();
    while let Some(row) = rows.next()? {
        match row_to_event(row) {
            Ok(event) => events.push(event),
            Err(e) if is_decode_error(&e) => undecodable.push((row.get(0)?, e)),
            Err(e) => return Err(e.into()),
        }
    }
    Ok((events, undecodable))
}

/// Dead-letter an eligible event whose row cannot be decoded.
fn quarantine_undecodable_event(
    conn: &Connection,
    window: &ClaimWindow,
    event_id: &str,
    err: &rusqlite::Error,
) -> DatabaseResult<usize> {
    let sql = format!(
        "UPDATE outbox_events
         SET dead_lettered_at = ?1, next_attempt_at = NULL, claimed_at = NULL, processing_token = NULL,
             reason_code = 'INVALID_DATA', error_class = 'InvalidData', error_stack = ?3,
             first_seen_at = COALESCE(first_seen_at, ?1), last_seen_at = ?1
         WHERE event_id = ?4 AND {ELIGIBLE}"
    );
    let changed = conn.execute(
        &sql,
        params![
            to_millis(window.now),
            to_millis(window.stale_before),
            err.to_string(),
            event_id
        ],
    )?;

    warn!(
        event_id = %event_id,
        reason_code = "INVALID_DATA",
        error = %err,
        "undecodable outbox event dead-lettered"
    );
    Ok(changed)
}

/// SQLite VM instructions between deadline checks.
const DEADLINE_CHECK_OPS: i32 = 1_000;

/// Interrupt any statement on `conn` that is still running at `deadline`.
fn arm_deadline(conn: &Connection, deadline: Instant) {
    conn.progress_handler(DEADLINE_CHECK_OPS, Some(move || Instant::now() >= deadline));
}

fn disarm_deadline(conn: &Connection) {
    conn.progress_handler(DEADLINE_CHECK_OPS, None::<fn() -> bool>);
}

fn is_interrupted(err: &DatabaseError) -> bool {
    matches!(
        err,
        DatabaseError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
            if e.code == ErrorCode::OperationInterrupted
    )
}

/// Lease a batch inside one `BEGIN IMMEDIATE` transaction.
///
/// The write lock is taken before the eligibility read, so concurrent
/// claimers are serialised and never lease the same row. `select` narrows
/// the candidates to the batch.
///
/// `timeout` bounds the whole select-and-mark. SQL statements still
/// running at the deadline are interrupted. `select` runs in Rust and
/// cannot be interrupted, so a slow `select` is caught by the elapsed
/// check before commit. Either way the transaction is rolled back and
/// nothing is leased.
pub fn claim_with_transaction<F>(
    conn: &Connection,
    window: &ClaimWindow,
    processing_token: &str,
    timeout: Duration,
    select: F,
) -> DatabaseResult<Vec<OutboxEvent>>
where
    F: FnOnce(Vec<OutboxEvent>) -> Vec<OutboxEvent>,
{
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
    let started = Instant::now();

    arm_deadline(&tx, started + timeout);
    let leased = lease_selected(&tx, window, processing_token, select);
    disarm_deadline(&tx);

    let timed_out = match &leased {
        Err(e) => is_interrupted(e),
        Ok(_) => started.elapsed() > timeout,
    };
    if timed_out {
        // an interrupted write may already have ended the transaction
        tx.finish()?;
        return Err(DatabaseError::TransactionTimeout(timeout.as_millis() as u64));
    }
    let (candidate_count, mut batch) = leased?;
    tx.commit()?;

    for event in &mut batch {
        event.claimed_at = Some(window.now);
        event.processing_token = Some(processing_token.to_string());
    }

    debug!(
        candidates = candidate_count,
        claimed = batch.len(),
        "claimed outbox batch in transaction"
    );
    Ok(batch)
}

fn lease_selected<F>(
    conn: &Connection,
    window: &ClaimWindow,
    processing_token: &str,
    select: F,
) -> DatabaseResult<(usize, Vec<OutboxEvent>)>
where
    F: FnOnce(Vec<OutboxEvent>) -> Vec<OutboxEvent>,
{
    let candidates = select_claim_candidates(conn, window)?;
    let candidate_count = candidates.len();
    if candidates.is_empty() {
        return Ok((0, candidates));
    }

    let batch = select(candidates);
    if !batch.is_empty() {
        let ids = json_id_list(&batch.iter().map(|e| e.event_id.as_str()).collect::<Vec<_>>());
        conn.execute(
            "UPDATE outbox_events SET claimed_at = ?1, processing_token = ?2
             WHERE event_id IN (SELECT value FROM json_each(?3))",
            params![to_millis(window.now), processing_token, ids],
        )?;
    }
    Ok((candidate_count, batch))
}

/// Lease exactly the given events with one conditional update.
///
/// Eligibility is re-checked in the `WHERE` clause; rows another claimer
/// took after the read are left out. Returns the leased rows in the order
/// of `event_ids`.
pub fn claim_selected(
    conn: &Connection,
    window: &ClaimWindow,
    processing_token: &str,
    event_ids: &[String],
) -> DatabaseResult<Vec<OutboxEvent>> {
    if event_ids.is_empty() {
        return Ok(Vec::new());
    }

    let sql = format!(
        "UPDATE outbox_events SET claimed_at = ?1, processing_token = ?3
         WHERE {ELIGIBLE} AND event_id IN (SELECT value FROM json_each(?4))
         RETURNING {EVENT_COLUMNS}"
    );

    let mut stmt = conn.prepare_cached(&sql)?;
    let mut claimed: HashMap<String, OutboxEvent> = stmt
        .query_map(
            params![
                to_millis(window.now),
                to_millis(window.stale_before),
                processing_token,
                json_id_list(event_ids)
            ],
            row_to_event,
        )?
        .map(|r| r.map(|e| (e.event_id.clone(), e)))
        .collect::<Result<_, _>>()?;

    Ok(event_ids
        .iter()
        .filter_map(|id| claimed.remove(id))
        .collect())
}

// ==========================================
// Guarded mutations
// ==========================================

/// Mark a leased event published and release the lease.
///
/// Returns the number of rows changed: 0 when the lease was lost or the
/// event is already terminal.
pub fn mark_event_published(
    conn: &Connection,
    event_id: &str,
    processing_token: &str,
    published_at: DateTime<Utc>,
) -> DatabaseResult<usize> {
    let sql = format!(
        "UPDATE outbox_events
         SET published_at = ?3, next_attempt_at = NULL, claimed_at = NULL, processing_token = NULL,
             reason_code = NULL, error_class = NULL, error_stack = NULL
         WHERE {OWNED}"
    );
    let changed = conn.execute(
        &sql,
        params![event_id, processing_token, to_millis(published_at)],
    )?;
    Ok(changed)
}

/// Mark a leased event dead-lettered and release the lease.
///
/// `reason_code` replaces the stored code when given.
pub fn mark_event_dead_lettered(
    conn: &Connection,
    event_id: &str,
    processing_token: &str,
    now: DateTime<Utc>,
    reason_code: Option<&str>,
) -> DatabaseResult<usize> {
    let sql = format!(
        "UPDATE outbox_events
         SET dead_lettered_at = ?3, next_attempt_at = NULL, claimed_at = NULL, processing_token = NULL,
             reason_code = COALESCE(?4, reason_code)
         WHERE {OWNED}"
    );
    let changed = conn.execute(
        &sql,
        params![event_id, processing_token, to_millis(now), reason_code],
    )?;
    Ok(changed)
}

/// Release the lease and make the event due again at `next_attempt_at`.
///
/// Failure diagnostics and `attempts` are left untouched.
pub fn schedule_event_retry(
    conn: &Connection,
    event_id: &str,
    processing_token: &str,
    next_attempt_at: DateTime<Utc>,
) -> DatabaseResult<usize> {
    let sql = format!(
        "UPDATE outbox_events
         SET next_attempt_at = ?3, claimed_at = NULL, processing_token = NULL
         WHERE {OWNED}"
    );
    let changed = conn.execute(
        &sql,
        params![event_id, processing_token, to_millis(next_attempt_at)],
    )?;
    Ok(changed)
}

/// Record a failed attempt on a leased event.
///
/// Increments `attempts`, stores the diagnostics, and either dead-letters
/// the event (once attempts reach `max_attempts`) or schedules it at
/// `retry_at(attempts)`. The lease is released in both cases. Returns
/// `None` when the lease was lost.
pub fn record_event_failure<F>(
    conn: &Connection,
    event_id: &str,
    processing_token: &str,
    now: DateTime<Utc>,
    failure: &EventFailure,
    max_attempts: u32,
    retry_at: F,
) -> DatabaseResult<Option<RecordedFailure>>
where
    F: FnOnce(u32) -> DateTime<Utc>,
{
    let select_sql = format!("SELECT attempts FROM outbox_events WHERE {OWNED}");
    let current: u32 = match conn.query_row(
        &select_sql,
        params![event_id, processing_token],
        |row| row.get(0),
    ) {
        Ok(attempts) => attempts,
        Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let attempts = current.saturating_add(1);
    let dead_lettered = attempts >= max_attempts;
    let next_attempt_at = if dead_lettered {
        None
    } else {
        Some(retry_at(attempts))
    };
    let dead_lettered_at = if dead_lettered { Some(now) } else { None };

    let update_sql = format!(
        "UPDATE outbox_events
         SET attempts = ?3,
             reason_code = ?4, error_class = ?5, error_stack = ?6,
             first_seen_at = COALESCE(first_seen_at, ?7), last_seen_at = ?7,
             dead_lettered_at = ?8, next_attempt_at = ?9,
             claimed_at = NULL, processing_token = NULL
         WHERE {OWNED} AND attempts = ?10"
    );
    let changed = conn.execute(
        &update_sql,
        params![
            event_id,
            processing_token,
            attempts,
            failure.reason_code,
            failure.error_class,
            failure.error_stack,
            to_millis(now),
            opt_to_millis(dead_lettered_at),
            opt_to_millis(next_attempt_at),
            current,
        ],
    )?;

    if changed == 0 {
        return Ok(None);
    }
    Ok(Some(RecordedFailure {
        attempts,
        dead_lettered,
        next_attempt_at,
    }))
}

// ==========================================
// Inspection
// ==========================================

/// Count events per lifecycle state.
pub fn count_events_by_state(conn: &Connection) -> DatabaseResult<EventStateCounts> {
    let counts = conn.query_row(
        "SELECT
            COALESCE(SUM(CASE WHEN published_at IS NULL AND dead_lettered_at IS NULL THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN published_at IS NOT NULL THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN dead_lettered_at IS NOT NULL THEN 1 ELSE 0 END), 0)
         FROM outbox_events",
        [],
        |row| {
            Ok(EventStateCounts {
                pending: row.get::<_, i64>(0)? as u64,
                published: row.get::<_, i64>(1)? as u64,
                dead_lettered: row.get::<_, i64>(2)? as u64,
            })
        },
    )?;
    Ok(counts)
}

/// Most recently dead-lettered events first.
pub fn list_dead_lettered_events(
    conn: &Connection,
    limit: usize,
) -> DatabaseResult<Vec<OutboxEvent>> {
    let sql = format!(
        "SELECT {EVENT_COLUMNS} FROM outbox_events
         WHERE dead_lettered_at IS NOT NULL
         ORDER BY dead_lettered_at DESC, event_id ASC
         LIMIT ?1"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let (events, undecodable) = decode_events(stmt.query(params![limit as i64])?)?;
    for (event_id, err) in undecodable {
        warn!(event_id = %event_id, error = %err, "skipping undecodable dead-lettered event");
    }
    Ok(events)
}
