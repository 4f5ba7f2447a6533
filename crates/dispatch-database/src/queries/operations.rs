use super::{from_millis, json_column, opt_from_millis, to_millis};
use crate::{
    CreateOperationOutcome, DatabaseError, DatabaseResult, NewOperation, Operation,
    OperationStatus,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, Row};
use tracing::debug;

const OPERATION_COLUMNS: &str = "id, dedupe_key, operation_type, status, attempts, payload, last_error, locked_at, next_retry_at, created_at, updated_at";

/// Runnable by a worker. Binds `?1` = now, `?2` = stale-before.
const RUNNABLE: &str = "(status = 'PENDING' AND locked_at IS NULL)
    OR (status = 'FAILED' AND locked_at IS NULL AND (next_retry_at IS NULL OR next_retry_at <= ?1))
    OR (status = 'RUNNING' AND locked_at <= ?2)";

fn row_to_operation(row: &Row<'_>) -> rusqlite::Result<Operation> {
    Ok(Operation {
        id: row.get(0)?,
        dedupe_key: row.get(1)?,
        operation_type: row.get(2)?,
        status: OperationStatus::from_str(&row.get::<_, String>(3)?),
        attempts: row.get(4)?,
        payload: json_column(5, row.get(5)?)?,
        last_error: row.get(6)?,
        locked_at: opt_from_millis(7, row.get(7)?)?,
        next_retry_at: opt_from_millis(8, row.get(8)?)?,
        created_at: from_millis(9, row.get(9)?)?,
        updated_at: from_millis(10, row.get(10)?)?,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == ErrorCode::ConstraintViolation
                && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
        }
        _ => false,
    }
}

/// Get an operation by id.
pub fn get_operation(conn: &Connection, id: i64) -> DatabaseResult<Option<Operation>> {
    let sql = format!("SELECT {OPERATION_COLUMNS} FROM operations WHERE id = ?1");
    let mut stmt = conn.prepare_cached(&sql)?;

    match stmt.query_row(params![id], row_to_operation) {
        Ok(op) => Ok(Some(op)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Get an operation by its dedupe key.
pub fn get_operation_by_dedupe_key(
    conn: &Connection,
    dedupe_key: &str,
) -> DatabaseResult<Option<Operation>> {
    let sql = format!("SELECT {OPERATION_COLUMNS} FROM operations WHERE dedupe_key = ?1");
    let mut stmt = conn.prepare_cached(&sql)?;

    match stmt.query_row(params![dedupe_key], row_to_operation) {
        Ok(op) => Ok(Some(op)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Create a PENDING operation unless one already holds the dedupe key.
///
/// A concurrent writer winning the key is reported as
/// [`CreateOperationOutcome::AlreadyExists`] with the winner's row.
pub fn create_operation(
    conn: &Connection,
    op: &NewOperation,
) -> DatabaseResult<CreateOperationOutcome> {
    let payload = serde_json::to_string(&op.payload)?;
    let now = to_millis(op.created_at);

    let inserted = conn.execute(
        "INSERT INTO operations (dedupe_key, operation_type, status, attempts, payload, created_at, updated_at)
         VALUES (?1, ?2, 'PENDING', 0, ?3, ?4, ?4)",
        params![op.dedupe_key, op.operation_type, payload, now],
    );

    match inserted {
        Ok(_) => {
            let id = conn.last_insert_rowid();
            debug!(id, dedupe_key = %op.dedupe_key, "operation created");
            get_operation(conn, id)?
                .map(CreateOperationOutcome::Created)
                .ok_or_else(|| {
                    DatabaseError::NotFound("Operation not found after insert".to_string())
                })
        }
        Err(e) if is_unique_violation(&e) => {
            debug!(dedupe_key = %op.dedupe_key, "operation already exists");
            get_operation_by_dedupe_key(conn, &op.dedupe_key)?
                .map(CreateOperationOutcome::AlreadyExists)
                .ok_or_else(|| {
                    DatabaseError::NotFound(format!(
                        "Operation {} conflicted but could not be read",
                        op.dedupe_key
                    ))
                })
        }
        Err(e) => Err(e.into()),
    }
}

/// Operations a worker may pick up, lowest id first.
///
/// PENDING and due FAILED rows are runnable when unlocked; RUNNING rows
/// are runnable again once their lock is older than `stale_before`.
pub fn select_runnable_operations(
    conn: &Connection,
    now: DateTime<Utc>,
    stale_before: DateTime<Utc>,
    limit: usize,
) -> DatabaseResult<Vec<Operation>> {
    let sql = format!(
        "SELECT {OPERATION_COLUMNS} FROM operations
         WHERE {RUNNABLE}
         ORDER BY id ASC
         LIMIT ?3"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let ops = stmt
        .query_map(
            params![to_millis(now), to_millis(stale_before), limit as i64],
            row_to_operation,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ops)
}

/// Lock an operation for processing and count the attempt.
///
/// Returns the locked row, or `None` when another worker got there first.
pub fn claim_operation(
    conn: &Connection,
    id: i64,
    now: DateTime<Utc>,
    stale_before: DateTime<Utc>,
) -> DatabaseResult<Option<Operation>> {
    let sql = format!(
        "UPDATE operations
         SET status = 'RUNNING', locked_at = ?1, attempts = attempts + 1, updated_at = ?1
         WHERE id = ?3 AND ({RUNNABLE})
         RETURNING {OPERATION_COLUMNS}"
    );
    let mut stmt = conn.prepare_cached(&sql)?;

    match stmt.query_row(
        params![to_millis(now), to_millis(stale_before), id],
        row_to_operation,
    ) {
        Ok(op) => Ok(Some(op)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Mark a running operation succeeded.
pub fn complete_operation(conn: &Connection, id: i64, now: DateTime<Utc>) -> DatabaseResult<usize> {
    let changed = conn.execute(
        "UPDATE operations
         SET status = 'SUCCEEDED', locked_at = NULL, next_retry_at = NULL, last_error = NULL, updated_at = ?2
         WHERE id = ?1 AND status = 'RUNNING'",
        params![id, to_millis(now)],
    )?;
    Ok(changed)
}

/// Record a failed run.
///
/// The operation becomes DEAD_LETTER once its attempts reach
/// `max_attempts`, otherwise FAILED and due again at `retry_at`.
/// Returns the new status, or `None` when the operation was not running.
pub fn fail_operation(
    conn: &Connection,
    id: i64,
    now: DateTime<Utc>,
    error: &str,
    max_attempts: u32,
    retry_at: DateTime<Utc>,
) -> DatabaseResult<Option<OperationStatus>> {
    let result = conn.query_row(
        "UPDATE operations
         SET status = CASE WHEN attempts >= ?3 THEN 'DEAD_LETTER' ELSE 'FAILED' END,
             next_retry_at = CASE WHEN attempts >= ?3 THEN NULL ELSE ?4 END,
             last_error = ?5, locked_at = NULL, updated_at = ?2
         WHERE id = ?1 AND status = 'RUNNING'
         RETURNING status",
        params![id, to_millis(now), max_attempts, to_millis(retry_at), error],
        |row| row.get::<_, String>(0),
    );

    match result {
        Ok(status) => Ok(Some(OperationStatus::from_str(&status))),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Number of operations per status, ordered by status.
pub fn count_operations_by_status(conn: &Connection) -> DatabaseResult<Vec<(OperationStatus, u64)>> {
    let mut stmt = conn.prepare_cached(
        "SELECT status, COUNT(*) FROM operations GROUP BY status ORDER BY status",
    )?;
    let counts = stmt
        .query_map([], |row| {
            Ok((
                OperationStatus::from_str(&row.get::<_, String>(0)?),
                row.get::<_, i64>(1)? as u64,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(counts)
}
