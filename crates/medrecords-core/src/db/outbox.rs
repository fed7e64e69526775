//! Outbox writer and queue operations.
//!
//! Every local mutation appends exactly one entry through [`append_outbox`],
//! using the same transaction as the row write so the two never diverge.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Database, DbResult};
use crate::models::{now_timestamp, EntityKind, OutboxEntry, OutboxPayload};

const OUTBOX_COLUMNS: &str = "id, payload, retry_count, last_attempt_at, created_at";

/// Append one outbox entry describing `payload`.
///
/// The payload is validated before anything is written.
pub fn append_outbox(conn: &Connection, payload: &OutboxPayload) -> DbResult<OutboxEntry> {
    payload.validate()?;

    let entry = OutboxEntry {
        id: uuid::Uuid::new_v4().to_string(),
        payload: payload.clone(),
        retry_count: 0,
        last_attempt_at: None,
        created_at: now_timestamp(),
    };

    conn.execute(
        r#"
        INSERT INTO sync_outbox (
            id, entity, operation, local_id, payload, retry_count, last_attempt_at, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, 0, NULL, ?6)
        "#,
        params![
            entry.id,
            payload.entity().as_str(),
            payload.operation().as_str(),
            payload.local_id(),
            serde_json::to_string(payload)?,
            entry.created_at,
        ],
    )?;

    tracing::debug!(
        entry_id = %entry.id,
        entity = %payload.entity(),
        operation = %payload.operation(),
        local_id = payload.local_id(),
        "outbox entry appended"
    );

    Ok(entry)
}

/// Whether any entry is still pending for the given entity, inside `conn`.
pub(crate) fn pending_outbox_in(
    conn: &Connection,
    entity: EntityKind,
    local_id: &str,
) -> DbResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sync_outbox WHERE entity = ?1 AND local_id = ?2",
        params![entity.as_str(), local_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

impl Database {
    /// Append an outbox entry on its own (outside a row write).
    pub fn enqueue_outbox(&self, payload: &OutboxPayload) -> DbResult<OutboxEntry> {
        self.atomically(|tx| append_outbox(tx, payload))
    }

    /// All pending entries in replay order.
    ///
    /// Replay follows insertion order (`rowid`), never `created_at`, so a wall
    /// clock stepping backwards cannot reorder an entity's mutations.
    pub fn list_outbox(&self) -> DbResult<Vec<OutboxEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM sync_outbox ORDER BY rowid",
            OUTBOX_COLUMNS
        ))?;

        let rows = stmt.query_map([], OutboxRow::from_row)?;
        rows.map(|row| OutboxEntry::try_from(row?))
            .collect::<DbResult<Vec<OutboxEntry>>>()
    }

    /// Pending entries for one entity, in replay order.
    pub fn list_outbox_for(&self, entity: EntityKind, local_id: &str) -> DbResult<Vec<OutboxEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM sync_outbox WHERE entity = ?1 AND local_id = ?2 ORDER BY rowid",
            OUTBOX_COLUMNS
        ))?;

        let rows = stmt.query_map(params![entity.as_str(), local_id], OutboxRow::from_row)?;
        rows.map(|row| OutboxEntry::try_from(row?))
            .collect::<DbResult<Vec<OutboxEntry>>>()
    }

    /// Get an entry by ID.
    pub fn get_outbox_entry(&self, id: &str) -> DbResult<Option<OutboxEntry>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {} FROM sync_outbox WHERE id = ?", OUTBOX_COLUMNS),
                [id],
                OutboxRow::from_row,
            )
            .optional()?;
        row.map(OutboxEntry::try_from).transpose()
    }

    /// Number of pending entries.
    pub fn outbox_len(&self) -> DbResult<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM sync_outbox", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Whether any entry is still pending for the given entity.
    pub fn has_pending_outbox(&self, entity: EntityKind, local_id: &str) -> DbResult<bool> {
        pending_outbox_in(&self.conn, entity, local_id)
    }

    /// Stamp a delivery attempt and return the new retry count.
    pub fn record_outbox_attempt(&self, id: &str, at: &str) -> DbResult<u32> {
        let retry_count: i64 = self.conn.query_row(
            r#"
            UPDATE sync_outbox
            SET retry_count = retry_count + 1, last_attempt_at = ?2
            WHERE id = ?1
            RETURNING retry_count
            "#,
            params![id, at],
            |row| row.get(0),
        )?;
        Ok(retry_count as u32)
    }

    /// Remove an entry after success, conflict or give-up.
    pub fn delete_outbox_entry(&self, id: &str) -> DbResult<bool> {
        let rows_affected = self
            .conn
            .execute("DELETE FROM sync_outbox WHERE id = ?", [id])?;
        Ok(rows_affected > 0)
    }
}

/// Intermediate row struct for database mapping.
struct OutboxRow {
    id: String,
    payload: String,
    retry_count: i64,
    last_attempt_at: Option<String>,
    created_at: String,
}

impl OutboxRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            payload: row.get(1)?,
            retry_count: row.get(2)?,
            last_attempt_at: row.get(3)?,
            created_at: row.get(4)?,
        })
    }
}

impl TryFrom<OutboxRow> for OutboxEntry {
    type Error = super::DbError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        Ok(OutboxEntry {
            id: row.id,
            payload: serde_json::from_str(&row.payload)?,
            retry_count: row.retry_count as u32,
            last_attempt_at: row.last_attempt_at,
            created_at: row.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DbError;
    use crate::models::{OutboxOperation, PatientFields};

    fn setup_db() -> Database {
        Database::open_in_memory().unwrap()
    }

    fn create_payload(local_id: &str) -> OutboxPayload {
        OutboxPayload::CreatePatient {
            local_id: local_id.into(),
            fields: PatientFields::named("Ana"),
        }
    }

    #[test]
    fn test_enqueue_and_list() {
        let db = setup_db();

        let entry = db.enqueue_outbox(&create_payload("L1")).unwrap();
        assert_eq!(entry.retry_count, 0);
        assert!(entry.last_attempt_at.is_none());

        let entries = db.list_outbox().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0], entry);
        assert_eq!(entries[0].operation(), OutboxOperation::Create);
    }

    #[test]
    fn test_list_preserves_enqueue_order() {
        let db = setup_db();

        let ids: Vec<String> = (0..5)
            .map(|i| db.enqueue_outbox(&create_payload(&format!("L{}", i))).unwrap().id)
            .collect();

        let listed: Vec<String> = db.list_outbox().unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(listed, ids);
    }

    #[test]
    fn test_replay_order_ignores_clock_steps() {
        let db = setup_db();
        let create = db.enqueue_outbox(&create_payload("L1")).unwrap();
        let update = db
            .enqueue_outbox(&OutboxPayload::UpdatePatient {
                local_id: "L1".into(),
                remote_id: None,
                fields: PatientFields::named("Ana Lima"),
            })
            .unwrap();

        // Device clock was corrected backwards between the two writes
        db.conn()
            .execute(
                "UPDATE sync_outbox SET created_at = '2000-01-01T00:00:00.000Z' WHERE id = ?",
                [&update.id],
            )
            .unwrap();

        let listed: Vec<String> = db.list_outbox().unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(listed, vec![create.id.clone(), update.id.clone()]);
        let lane: Vec<String> = db
            .list_outbox_for(EntityKind::Patient, "L1")
            .unwrap()
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(lane, vec![create.id, update.id]);
    }

    #[test]
    fn test_invalid_payload_not_enqueued() {
        let db = setup_db();

        let result = db.enqueue_outbox(&OutboxPayload::CreatePatient {
            local_id: "L1".into(),
            fields: PatientFields::named(""),
        });
        assert!(matches!(result, Err(DbError::Validation(_))));
        assert_eq!(db.outbox_len().unwrap(), 0);
    }

    #[test]
    fn test_record_attempt_and_delete() {
        let db = setup_db();
        let entry = db.enqueue_outbox(&create_payload("L1")).unwrap();

        assert_eq!(
            db.record_outbox_attempt(&entry.id, "2024-01-01T00:00:00.000Z")
                .unwrap(),
            1
        );
        assert_eq!(
            db.record_outbox_attempt(&entry.id, "2024-01-01T00:00:05.000Z")
                .unwrap(),
            2
        );

        let stored = db.get_outbox_entry(&entry.id).unwrap().unwrap();
        assert_eq!(stored.retry_count, 2);
        assert_eq!(
            stored.last_attempt_at.as_deref(),
            Some("2024-01-01T00:00:05.000Z")
        );

        assert!(db.delete_outbox_entry(&entry.id).unwrap());
        assert!(!db.delete_outbox_entry(&entry.id).unwrap());
        assert_eq!(db.outbox_len().unwrap(), 0);
    }

    #[test]
    fn test_pending_for_entity() {
        let db = setup_db();
        db.enqueue_outbox(&create_payload("L1")).unwrap();

        assert!(db.has_pending_outbox(EntityKind::Patient, "L1").unwrap());
        assert!(!db.has_pending_outbox(EntityKind::Patient, "L2").unwrap());
        assert!(!db.has_pending_outbox(EntityKind::Appointment, "L1").unwrap());
        assert_eq!(db.list_outbox_for(EntityKind::Patient, "L1").unwrap().len(), 1);
    }
}
