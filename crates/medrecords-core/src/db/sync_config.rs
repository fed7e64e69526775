//! Sync bookkeeping: per-entity pull cursors and cycle timestamps.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{Database, DbError, DbResult};
use crate::models::{format_timestamp, parse_timestamp, EntityKind};

/// Key holding the time of the last cycle that completed without error.
pub const LAST_SUCCESSFUL_SYNC_KEY: &str = "lastSuccessfulSync";

/// Cursor key for an entity type (`lastSync:patients`).
pub fn cursor_key(entity: EntityKind) -> String {
    format!("lastSync:{}", entity.resource())
}

/// Start of the delta stream when no cursor has been stored yet.
pub fn epoch_cursor() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

pub(crate) fn set_sync_config_in(conn: &Connection, key: &str, value: &str) -> DbResult<()> {
    conn.execute(
        r#"
        INSERT INTO sync_config (key, value, updated_at)
        VALUES (?1, ?2, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
        params![key, value],
    )?;
    Ok(())
}

impl Database {
    /// Get a sync config value.
    pub fn get_sync_config(&self, key: &str) -> DbResult<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM sync_config WHERE key = ?",
                [key],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    /// Set a sync config value.
    pub fn set_sync_config(&self, key: &str, value: &str) -> DbResult<()> {
        set_sync_config_in(&self.conn, key, value)
    }

    /// Current pull cursor for an entity type (epoch if never pulled).
    pub fn sync_cursor(&self, entity: EntityKind) -> DbResult<DateTime<Utc>> {
        match self.get_sync_config(&cursor_key(entity))? {
            Some(value) => parse_timestamp(&value)
                .ok_or_else(|| DbError::Constraint(format!("Malformed cursor: {}", value))),
            None => Ok(epoch_cursor()),
        }
    }

    /// Move the cursor forward to `to`. Never moves it backwards.
    ///
    /// Returns true if the stored cursor changed.
    pub fn advance_sync_cursor(&self, entity: EntityKind, to: DateTime<Utc>) -> DbResult<bool> {
        let current = self.sync_cursor(entity)?;
        if to <= current {
            return Ok(false);
        }
        self.set_sync_config(&cursor_key(entity), &format_timestamp(to))?;
        Ok(true)
    }

    /// Time of the last cycle that completed without error.
    pub fn last_successful_sync(&self) -> DbResult<Option<DateTime<Utc>>> {
        Ok(self
            .get_sync_config(LAST_SUCCESSFUL_SYNC_KEY)?
            .and_then(|value| parse_timestamp(&value)))
    }

    /// Record a successful cycle.
    pub fn record_successful_sync(&self, at: DateTime<Utc>) -> DbResult<()> {
        self.set_sync_config(LAST_SUCCESSFUL_SYNC_KEY, &format_timestamp(at))
    }
}
