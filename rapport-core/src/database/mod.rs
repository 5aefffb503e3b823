//! SQLite-backed local data store.
//!
//! Holds CRM records as JSON documents per collection, plus a small
//! settings table used for durable values like the backup registry.

pub mod schema;

pub use schema::SqliteStore;

use thiserror::Error;

/// Errors from the local data store
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: i32, supported: i32 },
}
