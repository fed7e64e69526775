//! SQLite schema definition.

/// Complete database schema for the local store.
pub const SCHEMA: &str = r#"
-- Enable foreign keys
PRAGMA foreign_keys = ON;

-- ============================================================================
-- Patients (mirror of the remote resource)
-- ============================================================================

CREATE TABLE IF NOT EXISTS patients_local (
    local_id TEXT PRIMARY KEY,
    remote_id TEXT,                              -- NULL until the create is acknowledged
    name TEXT NOT NULL,
    date_of_birth TEXT,
    sex TEXT,
    phone TEXT,
    email TEXT,
    notes TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT                              -- soft-delete marker
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_patients_local_remote_id
    ON patients_local(remote_id) WHERE remote_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_patients_local_name ON patients_local(name);

-- ============================================================================
-- Appointments (mirror of the remote resource)
-- ============================================================================

CREATE TABLE IF NOT EXISTS appointments_local (
    local_id TEXT PRIMARY KEY,
    remote_id TEXT,
    patient_local_id TEXT NOT NULL REFERENCES patients_local(local_id) ON DELETE CASCADE,
    scheduled_at TEXT NOT NULL,
    duration_minutes INTEGER NOT NULL CHECK (duration_minutes > 0),
    status TEXT NOT NULL DEFAULT 'scheduled',   -- scheduled, completed, cancelled, no_show
    reason TEXT,
    notes TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_appointments_local_remote_id
    ON appointments_local(remote_id) WHERE remote_id IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_appointments_local_patient ON appointments_local(patient_local_id);
CREATE INDEX IF NOT EXISTS idx_appointments_local_scheduled ON appointments_local(scheduled_at);

-- ============================================================================
-- Sync Outbox (pending mutation intents, replayed in rowid order)
-- ============================================================================

CREATE TABLE IF NOT EXISTS sync_outbox (
    id TEXT PRIMARY KEY,
    entity TEXT NOT NULL CHECK (entity IN ('patient', 'appointment')),
    operation TEXT NOT NULL CHECK (operation IN ('create', 'update', 'delete')),
    local_id TEXT NOT NULL,
    payload TEXT NOT NULL,                       -- JSON OutboxPayload
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_attempt_at TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_outbox_entity ON sync_outbox(entity, local_id);

-- ============================================================================
-- Sync Config (cursors and bookkeeping)
-- ============================================================================

CREATE TABLE IF NOT EXISTS sync_config (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_schema_valid() {
        let conn = Connection::open_in_memory().unwrap();
        let result = conn.execute_batch(SCHEMA);
        assert!(result.is_ok(), "Schema should be valid SQL: {:?}", result);
    }

    #[test]
    fn test_schema_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        assert!(conn.execute_batch(SCHEMA).is_ok());
    }

    #[test]
    fn test_remote_id_unique_when_present() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();

        let insert = "INSERT INTO patients_local (local_id, remote_id, name, created_at, updated_at)
                      VALUES (?1, ?2, 'x', '2024-01-01T00:00:00.000Z', '2024-01-01T00:00:00.000Z')";

        // Several unsynced rows may coexist
        conn.execute(insert, rusqlite::params!["L1", None::<String>]).unwrap();
        conn.execute(insert, rusqlite::params!["L2", None::<String>]).unwrap();

        conn.execute(insert, rusqlite::params!["L3", "R1"]).unwrap();
        assert!(conn.execute(insert, rusqlite::params!["L4", "R1"]).is_err());
    }

    #[test]
    fn test_outbox_rejects_unknown_entity() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();

        let result = conn.execute(
            "INSERT INTO sync_outbox (id, entity, operation, local_id, payload, created_at)
             VALUES ('e1', 'invoice', 'create', 'L1', '{}', '2024-01-01T00:00:00.000Z')",
            [],
        );
        assert!(result.is_err());
    }
}
