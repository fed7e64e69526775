//! Patient database operations.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{append_outbox, pending_outbox_in, Database, DbError, DbResult, RemoteUpsert};
use crate::models::{now_timestamp, EntityKind, OutboxPayload, Patient, PatientFields};

const PATIENT_COLUMNS: &str = "local_id, remote_id, name, date_of_birth, sex, phone, email, notes, \
                               created_at, updated_at, deleted_at";

fn patient_from_row(row: &Row<'_>) -> rusqlite::Result<Patient> {
    Ok(Patient {
        local_id: row.get(0)?,
        remote_id: row.get(1)?,
        fields: PatientFields {
            name: row.get(2)?,
            date_of_birth: row.get(3)?,
            sex: row.get(4)?,
            phone: row.get(5)?,
            email: row.get(6)?,
            notes: row.get(7)?,
        },
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        deleted_at: row.get(10)?,
    })
}

fn insert_patient_row(conn: &Connection, patient: &Patient) -> DbResult<()> {
    let f = &patient.fields;
    conn.execute(
        r#"
        INSERT INTO patients_local (
            local_id, remote_id, name, date_of_birth, sex, phone, email, notes,
            created_at, updated_at, deleted_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
        params![
            patient.local_id,
            patient.remote_id,
            f.name,
            f.date_of_birth,
            f.sex,
            f.phone,
            f.email,
            f.notes,
            patient.created_at,
            patient.updated_at,
            patient.deleted_at,
        ],
    )?;
    Ok(())
}

fn update_patient_fields(
    conn: &Connection,
    local_id: &str,
    fields: &PatientFields,
    updated_at: &str,
) -> DbResult<bool> {
    let rows_affected = conn.execute(
        r#"
        UPDATE patients_local SET
            name = ?2,
            date_of_birth = ?3,
            sex = ?4,
            phone = ?5,
            email = ?6,
            notes = ?7,
            updated_at = ?8
        WHERE local_id = ?1
        "#,
        params![
            local_id,
            fields.name,
            fields.date_of_birth,
            fields.sex,
            fields.phone,
            fields.email,
            fields.notes,
            updated_at,
        ],
    )?;
    Ok(rows_affected > 0)
}

fn find_patient_by_remote_id(conn: &Connection, remote_id: &str) -> DbResult<Option<Patient>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM patients_local WHERE remote_id = ?",
            PATIENT_COLUMNS
        ),
        [remote_id],
        patient_from_row,
    )
    .optional()
    .map_err(Into::into)
}

impl Database {
    // =========================================================================
    // Local mutations (row write + outbox append in one transaction)
    // =========================================================================

    /// Create a patient locally and enqueue its remote creation.
    pub fn create_patient(&self, fields: PatientFields) -> DbResult<Patient> {
        fields.validate()?;
        let patient = Patient::new(fields);

        self.atomically(|tx| {
            insert_patient_row(tx, &patient)?;
            append_outbox(
                tx,
                &OutboxPayload::CreatePatient {
                    local_id: patient.local_id.clone(),
                    fields: patient.fields.clone(),
                },
            )?;
            Ok(())
        })?;

        Ok(patient)
    }

    /// Replace a patient's fields locally and enqueue the remote update.
    pub fn update_patient(&self, local_id: &str, fields: PatientFields) -> DbResult<Patient> {
        fields.validate()?;
        let mut patient = self
            .get_patient(local_id)?
            .filter(|p| !p.is_deleted())
            .ok_or_else(|| DbError::NotFound(format!("patient {}", local_id)))?;

        patient.fields = fields;
        patient.updated_at = now_timestamp();

        self.atomically(|tx| {
            update_patient_fields(tx, local_id, &patient.fields, &patient.updated_at)?;
            append_outbox(
                tx,
                &OutboxPayload::UpdatePatient {
                    local_id: patient.local_id.clone(),
                    remote_id: patient.remote_id.clone(),
                    fields: patient.fields.clone(),
                },
            )?;
            Ok(())
        })?;

        Ok(patient)
    }

    /// Soft-delete a patient locally and enqueue the remote deletion.
    ///
    /// Returns false if the patient is unknown or already deleted.
    pub fn delete_patient(&self, local_id: &str) -> DbResult<bool> {
        let patient = match self.get_patient(local_id)? {
            Some(p) if !p.is_deleted() => p,
            _ => return Ok(false),
        };
        let now = now_timestamp();

        self.atomically(|tx| {
            tx.execute(
                "UPDATE patients_local SET deleted_at = ?2, updated_at = ?2 WHERE local_id = ?1",
                params![local_id, now],
            )?;
            append_outbox(
                tx,
                &OutboxPayload::DeletePatient {
                    local_id: patient.local_id.clone(),
                    remote_id: patient.remote_id.clone(),
                },
            )?;
            Ok(())
        })?;

        Ok(true)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Get a patient by local ID (deleted rows included).
    pub fn get_patient(&self, local_id: &str) -> DbResult<Option<Patient>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM patients_local WHERE local_id = ?",
                    PATIENT_COLUMNS
                ),
                [local_id],
                patient_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Get a patient by remote ID.
    pub fn get_patient_by_remote_id(&self, remote_id: &str) -> DbResult<Option<Patient>> {
        find_patient_by_remote_id(&self.conn, remote_id)
    }

    /// List patients that are not soft-deleted, by name.
    pub fn list_patients(&self) -> DbResult<Vec<Patient>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM patients_local WHERE deleted_at IS NULL ORDER BY name",
            PATIENT_COLUMNS
        ))?;

        let rows = stmt.query_map([], patient_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Search patients by name (prefix match).
    pub fn search_patients(&self, query: &str, limit: usize) -> DbResult<Vec<Patient>> {
        let pattern = format!("{}%", query);
        let mut stmt = self.conn.prepare(&format!(
            r#"
            SELECT {} FROM patients_local
            WHERE name LIKE ? AND deleted_at IS NULL
            ORDER BY name
            LIMIT ?
            "#,
            PATIENT_COLUMNS
        ))?;

        let rows = stmt.query_map(params![pattern, limit as i64], patient_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    // =========================================================================
    // Sync operations
    // =========================================================================

    /// Bind the server's canonical ID to a locally created patient.
    ///
    /// If a pull already mirrored the same remote record under another local
    /// row, that duplicate is folded into `local_id`: its appointments are
    /// re-pointed and the duplicate row removed.
    pub fn bind_patient_remote_id(&self, local_id: &str, remote_id: &str) -> DbResult<bool> {
        self.atomically(|tx| {
            if let Some(duplicate) = find_patient_by_remote_id(tx, remote_id)? {
                if duplicate.local_id == local_id {
                    return Ok(true);
                }
                tracing::warn!(
                    local_id,
                    duplicate = %duplicate.local_id,
                    remote_id,
                    "merging pulled duplicate into locally created patient"
                );
                tx.execute(
                    "UPDATE appointments_local SET patient_local_id = ?1 WHERE patient_local_id = ?2",
                    params![local_id, duplicate.local_id],
                )?;
                tx.execute(
                    "DELETE FROM patients_local WHERE local_id = ?",
                    [&duplicate.local_id],
                )?;
            }

            let rows_affected = tx.execute(
                "UPDATE patients_local SET remote_id = ?2 WHERE local_id = ?1",
                params![local_id, remote_id],
            )?;
            Ok(rows_affected > 0)
        })
    }

    /// Mirror a remote patient: overwrite the row holding `remote_id`, or
    /// insert a new one with a fresh local ID.
    ///
    /// A local soft-delete marker is preserved on overwrite. A row with
    /// mutations still in the outbox keeps its fields; only `updated_at`
    /// follows the server until those mutations are pushed.
    pub fn upsert_patient_from_remote(
        &self,
        remote_id: &str,
        fields: &PatientFields,
        updated_at: &str,
    ) -> DbResult<RemoteUpsert> {
        self.atomically(|tx| match find_patient_by_remote_id(tx, remote_id)? {
            Some(existing) => {
                if pending_outbox_in(tx, EntityKind::Patient, &existing.local_id)? {
                    tx.execute(
                        "UPDATE patients_local SET updated_at = ?2 WHERE local_id = ?1",
                        params![existing.local_id, updated_at],
                    )?;
                    return Ok(RemoteUpsert::KeptLocal(existing.local_id));
                }
                update_patient_fields(tx, &existing.local_id, fields, updated_at)?;
                Ok(RemoteUpsert::Updated(existing.local_id))
            }
            None => {
                let mut patient = Patient::new(fields.clone());
                patient.remote_id = Some(remote_id.to_string());
                patient.updated_at = updated_at.to_string();
                insert_patient_row(tx, &patient)?;
                Ok(RemoteUpsert::Inserted(patient.local_id))
            }
        })
    }

    /// Remove the row mirroring a remote patient the server has deleted.
    ///
    /// The patient's appointments go with it.
    pub fn purge_patient_by_remote_id(&self, remote_id: &str) -> DbResult<bool> {
        let rows_affected = self
            .conn
            .execute("DELETE FROM patients_local WHERE remote_id = ?", [remote_id])?;
        Ok(rows_affected > 0)
    }

    /// Set the soft-delete marker if it is not already set.
    pub fn mark_patient_deleted(&self, local_id: &str, at: &str) -> DbResult<bool> {
        let rows_affected = self.conn.execute(
            "UPDATE patients_local SET deleted_at = ?2 WHERE local_id = ?1 AND deleted_at IS NULL",
            params![local_id, at],
        )?;
        Ok(rows_affected > 0)
    }
}
