//! Database layer: the local store mirrored by the sync engine.

mod appointments;
mod outbox;
mod patients;
mod schema;
mod sync_config;

pub use appointments::*;
pub use outbox::*;
pub use patients::*;
pub use schema::*;
pub use sync_config::*;

use rusqlite::{Connection, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::models::ValidationError;

/// Database errors.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),
}

pub type DbResult<T> = Result<T, DbError>;

impl DbError {
    /// True when the store refused the data itself (a failed check or
    /// validation) rather than failing to run the statement.
    pub fn is_rejected_record(&self) -> bool {
        match self {
            DbError::Validation(_) => true,
            DbError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => {
                err.code == rusqlite::ErrorCode::ConstraintViolation
            }
            _ => false,
        }
    }
}

/// Outcome of mirroring one remote record into the local store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteUpsert {
    /// A new row was created with this local ID
    Inserted(String),
    /// The existing row with this local ID was overwritten
    Updated(String),
    /// The row has unsent local mutations; its fields were left as they are
    KeptLocal(String),
}

/// Database handle shared between the UI-facing API and the sync workers.
pub type SharedDatabase = Arc<Mutex<Database>>;

/// Database connection wrapper.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open database at path, creating if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Create in-memory database (for testing).
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Wrap into a handle shareable with the sync engine.
    pub fn into_shared(self) -> SharedDatabase {
        Arc::new(Mutex::new(self))
    }

    /// Initialize schema.
    fn initialize(&self) -> DbResult<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Get raw connection (for advanced queries).
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run `f` inside a transaction, committing only if it succeeds.
    ///
    /// Any error returned by `f` drops the transaction, which rolls back
    /// every write made through it.
    pub fn atomically<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> DbResult<T>,
    {
        let tx = self.conn.unchecked_transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory();
        assert!(db.is_ok());
    }

    #[test]
    fn test_schema_initialized() {
        let db = Database::open_in_memory().unwrap();

        // Check that tables exist
        let tables: Vec<String> = db
            .conn()
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(tables.contains(&"patients_local".to_string()));
        assert!(tables.contains(&"appointments_local".to_string()));
        assert!(tables.contains(&"sync_outbox".to_string()));
        assert!(tables.contains(&"sync_config".to_string()));
    }

    #[test]
    fn test_atomically_rolls_back_on_error() {
        let db = Database::open_in_memory().unwrap();

        let result: DbResult<()> = db.atomically(|tx| {
            tx.execute(
                "INSERT INTO sync_config (key, value) VALUES ('k', 'v')",
                [],
            )?;
            Err(DbError::Constraint("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(db.get_sync_config("k").unwrap(), None);

        db.atomically(|tx| {
            tx.execute(
                "INSERT INTO sync_config (key, value) VALUES ('k', 'v')",
                [],
            )?;
            Ok(())
        })
        .unwrap();
        assert_eq!(db.get_sync_config("k").unwrap(), Some("v".into()));
    }

    #[test]
    fn test_check_failure_is_a_rejected_record() {
        let db = Database::open_in_memory().unwrap();

        let err = db
            .conn()
            .execute(
                "INSERT INTO sync_outbox (id, entity, operation, local_id, payload, created_at)
                 VALUES ('O1', 'visit', 'create', 'L1', '{}', '2024-01-01T00:00:00Z')",
                [],
            )
            .map_err(DbError::from)
            .unwrap_err();
        assert!(err.is_rejected_record());

        let err = db
            .conn()
            .execute("DELETE FROM missing_table", [])
            .map_err(DbError::from)
            .unwrap_err();
        assert!(!err.is_rejected_record());
        assert!(!DbError::NotFound("L1".into()).is_rejected_record());
    }

    #[test]
    fn test_reopen_from_disk_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");

        {
            let db = Database::open(&path).unwrap();
            db.set_sync_config("lastSync:patients", "2024-01-01T00:00:00.000Z")
                .unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert_eq!(
            db.get_sync_config("lastSync:patients").unwrap(),
            Some("2024-01-01T00:00:00.000Z".into())
        );
    }
}
