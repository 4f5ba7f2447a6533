//! SQLite storage for the outbox dispatcher.
//!
//! This crate provides:
//! - Connection setup (WAL, bounded busy wait)
//! - Versioned migrations
//! - Model types for the outbox queue and the operation ledger
//! - Query functions that take any `&Connection`, including an open
//!   transaction owned by the caller
//!
//! ```ignore
//! let db = Database::open(&path)?;
//! queries::insert_outbox_event(db.connection(), &NewOutboxEvent::new("evt-1", "order.paid", payload))?;
//! ```

mod db;
mod error;
mod migrations;
mod models;
pub mod queries;

pub use db::{Database, DEFAULT_BUSY_TIMEOUT};
pub use error::{DatabaseError, DatabaseResult};
pub use migrations::{run_migrations, CURRENT_VERSION};
pub use models::*;
