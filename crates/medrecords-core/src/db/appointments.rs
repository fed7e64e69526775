//! Appointment database operations.

use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{append_outbox, pending_outbox_in, Database, DbError, DbResult, RemoteUpsert};
use crate::models::{
    now_timestamp, Appointment, AppointmentFields, AppointmentStatus, EntityKind, OutboxPayload,
};

const APPOINTMENT_COLUMNS: &str = "local_id, remote_id, patient_local_id, scheduled_at, \
                                   duration_minutes, status, reason, notes, created_at, \
                                   updated_at, deleted_at";

/// Intermediate row struct for database mapping.
struct AppointmentRow {
    local_id: String,
    remote_id: Option<String>,
    patient_local_id: String,
    scheduled_at: String,
    duration_minutes: i64,
    status: String,
    reason: Option<String>,
    notes: Option<String>,
    created_at: String,
    updated_at: String,
    deleted_at: Option<String>,
}

impl AppointmentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            local_id: row.get(0)?,
            remote_id: row.get(1)?,
            patient_local_id: row.get(2)?,
            scheduled_at: row.get(3)?,
            duration_minutes: row.get(4)?,
            status: row.get(5)?,
            reason: row.get(6)?,
            notes: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
            deleted_at: row.get(10)?,
        })
    }
}

impl TryFrom<AppointmentRow> for Appointment {
    type Error = DbError;

    fn try_from(row: AppointmentRow) -> Result<Self, Self::Error> {
        let status = AppointmentStatus::parse(&row.status).ok_or_else(|| {
            DbError::Constraint(format!("Unknown appointment status: {}", row.status))
        })?;

        Ok(Appointment {
            local_id: row.local_id,
            remote_id: row.remote_id,
            patient_local_id: row.patient_local_id,
            fields: AppointmentFields {
                scheduled_at: row.scheduled_at,
                duration_minutes: row.duration_minutes as u32,
                status,
                reason: row.reason,
                notes: row.notes,
            },
            created_at: row.created_at,
            updated_at: row.updated_at,
            deleted_at: row.deleted_at,
        })
    }
}

fn insert_appointment_row(conn: &Connection, appt: &Appointment) -> DbResult<()> {
    let f = &appt.fields;
    conn.execute(
        r#"
        INSERT INTO appointments_local (
            local_id, remote_id, patient_local_id, scheduled_at, duration_minutes,
            status, reason, notes, created_at, updated_at, deleted_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
        params![
            appt.local_id,
            appt.remote_id,
            appt.patient_local_id,
            f.scheduled_at,
            f.duration_minutes,
            f.status.as_str(),
            f.reason,
            f.notes,
            appt.created_at,
            appt.updated_at,
            appt.deleted_at,
        ],
    )?;
    Ok(())
}

fn update_appointment_fields(
    conn: &Connection,
    local_id: &str,
    patient_local_id: &str,
    fields: &AppointmentFields,
    updated_at: &str,
) -> DbResult<bool> {
    let rows_affected = conn.execute(
        r#"
        UPDATE appointments_local SET
            patient_local_id = ?2,
            scheduled_at = ?3,
            duration_minutes = ?4,
            status = ?5,
            reason = ?6,
            notes = ?7,
            updated_at = ?8
        WHERE local_id = ?1
        "#,
        params![
            local_id,
            patient_local_id,
            fields.scheduled_at,
            fields.duration_minutes,
            fields.status.as_str(),
            fields.reason,
            fields.notes,
            updated_at,
        ],
    )?;
    Ok(rows_affected > 0)
}

fn find_appointment_by_remote_id(
    conn: &Connection,
    remote_id: &str,
) -> DbResult<Option<Appointment>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {} FROM appointments_local WHERE remote_id = ?",
                APPOINTMENT_COLUMNS
            ),
            [remote_id],
            AppointmentRow::from_row,
        )
        .optional()?;
    row.map(Appointment::try_from).transpose()
}

impl Database {
    // =========================================================================
    // Local mutations (row write + outbox append in one transaction)
    // =========================================================================

    /// Book an appointment for a patient and enqueue its remote creation.
    pub fn create_appointment(
        &self,
        patient_local_id: &str,
        fields: AppointmentFields,
    ) -> DbResult<Appointment> {
        fields.validate()?;
        self.require_live_patient(patient_local_id)?;
        let appt = Appointment::new(patient_local_id, fields);

        self.atomically(|tx| {
            insert_appointment_row(tx, &appt)?;
            append_outbox(
                tx,
                &OutboxPayload::CreateAppointment {
                    local_id: appt.local_id.clone(),
                    patient_local_id: appt.patient_local_id.clone(),
                    fields: appt.fields.clone(),
                },
            )?;
            Ok(())
        })?;

        Ok(appt)
    }

    /// Replace an appointment's fields and enqueue the remote update.
    pub fn update_appointment(
        &self,
        local_id: &str,
        fields: AppointmentFields,
    ) -> DbResult<Appointment> {
        fields.validate()?;
        let mut appt = self
            .get_appointment(local_id)?
            .filter(|a| a.deleted_at.is_none())
            .ok_or_else(|| DbError::NotFound(format!("appointment {}", local_id)))?;

        appt.fields = fields;
        appt.updated_at = now_timestamp();

        self.atomically(|tx| {
            update_appointment_fields(
                tx,
                local_id,
                &appt.patient_local_id,
                &appt.fields,
                &appt.updated_at,
            )?;
            append_outbox(
                tx,
                &OutboxPayload::UpdateAppointment {
                    local_id: appt.local_id.clone(),
                    remote_id: appt.remote_id.clone(),
                    patient_local_id: appt.patient_local_id.clone(),
                    fields: appt.fields.clone(),
                },
            )?;
            Ok(())
        })?;

        Ok(appt)
    }

    /// Soft-delete an appointment and enqueue the remote deletion.
    ///
    /// Returns false if the appointment is unknown or already deleted.
    pub fn delete_appointment(&self, local_id: &str) -> DbResult<bool> {
        let appt = match self.get_appointment(local_id)? {
            Some(a) if a.deleted_at.is_none() => a,
            _ => return Ok(false),
        };
        let now = now_timestamp();

        self.atomically(|tx| {
            tx.execute(
                "UPDATE appointments_local SET deleted_at = ?2, updated_at = ?2 WHERE local_id = ?1",
                params![local_id, now],
            )?;
            append_outbox(
                tx,
                &OutboxPayload::DeleteAppointment {
                    local_id: appt.local_id.clone(),
                    remote_id: appt.remote_id.clone(),
                },
            )?;
            Ok(())
        })?;

        Ok(true)
    }

    fn require_live_patient(&self, patient_local_id: &str) -> DbResult<()> {
        match self.get_patient(patient_local_id)? {
            Some(p) if !p.is_deleted() => Ok(()),
            Some(_) => Err(DbError::Constraint(format!(
                "patient {} is deleted",
                patient_local_id
            ))),
            None => Err(DbError::NotFound(format!("patient {}", patient_local_id))),
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Get an appointment by local ID (deleted rows included).
    pub fn get_appointment(&self, local_id: &str) -> DbResult<Option<Appointment>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM appointments_local WHERE local_id = ?",
                    APPOINTMENT_COLUMNS
                ),
                [local_id],
                AppointmentRow::from_row,
            )
            .optional()?;
        row.map(Appointment::try_from).transpose()
    }

    /// Get an appointment by remote ID.
    pub fn get_appointment_by_remote_id(&self, remote_id: &str) -> DbResult<Option<Appointment>> {
        find_appointment_by_remote_id(&self.conn, remote_id)
    }

    /// A patient's live appointments, earliest first.
    pub fn list_appointments_for_patient(
        &self,
        patient_local_id: &str,
    ) -> DbResult<Vec<Appointment>> {
        let mut stmt = self.conn.prepare(&format!(
            r#"
            SELECT {} FROM appointments_local
            WHERE patient_local_id = ? AND deleted_at IS NULL
            ORDER BY scheduled_at
            "#,
            APPOINTMENT_COLUMNS
        ))?;

        let rows = stmt.query_map([patient_local_id], AppointmentRow::from_row)?;
        rows.map(|row| Appointment::try_from(row?))
            .collect::<DbResult<Vec<_>>>()
    }

    /// Live scheduled appointments starting at or after `from`.
    pub fn list_upcoming_appointments(&self, from: &str, limit: usize) -> DbResult<Vec<Appointment>> {
        let mut stmt = self.conn.prepare(&format!(
            r#"
            SELECT {} FROM appointments_local
            WHERE scheduled_at >= ?1 AND status = 'scheduled' AND deleted_at IS NULL
            ORDER BY scheduled_at
            LIMIT ?2
            "#,
            APPOINTMENT_COLUMNS
        ))?;

        let rows = stmt.query_map(params![from, limit as i64], AppointmentRow::from_row)?;
        rows.map(|row| Appointment::try_from(row?))
            .collect::<DbResult<Vec<_>>>()
    }

    // =========================================================================
    // Sync operations
    // =========================================================================

    /// Bind the server's canonical ID to a locally created appointment,
    /// dropping any pulled duplicate of the same remote record.
    pub fn bind_appointment_remote_id(&self, local_id: &str, remote_id: &str) -> DbResult<bool> {
        self.atomically(|tx| {
            if let Some(duplicate) = find_appointment_by_remote_id(tx, remote_id)? {
                if duplicate.local_id == local_id {
                    return Ok(true);
                }
                tracing::warn!(
                    local_id,
                    duplicate = %duplicate.local_id,
                    remote_id,
                    "dropping pulled duplicate of locally created appointment"
                );
                tx.execute(
                    "DELETE FROM appointments_local WHERE local_id = ?",
                    [&duplicate.local_id],
                )?;
            }

            let rows_affected = tx.execute(
                "UPDATE appointments_local SET remote_id = ?2 WHERE local_id = ?1",
                params![local_id, remote_id],
            )?;
            Ok(rows_affected > 0)
        })
    }

    /// Mirror a remote appointment under the given local patient.
    ///
    /// Rows with unsent local mutations keep their fields, as for patients.
    pub fn upsert_appointment_from_remote(
        &self,
        remote_id: &str,
        patient_local_id: &str,
        fields: &AppointmentFields,
        updated_at: &str,
    ) -> DbResult<RemoteUpsert> {
        self.atomically(|tx| match find_appointment_by_remote_id(tx, remote_id)? {
            Some(existing) => {
                if pending_outbox_in(tx, EntityKind::Appointment, &existing.local_id)? {
                    tx.execute(
                        "UPDATE appointments_local SET updated_at = ?2 WHERE local_id = ?1",
                        params![existing.local_id, updated_at],
                    )?;
                    return Ok(RemoteUpsert::KeptLocal(existing.local_id));
                }
                update_appointment_fields(
                    tx,
                    &existing.local_id,
                    patient_local_id,
                    fields,
                    updated_at,
                )?;
                Ok(RemoteUpsert::Updated(existing.local_id))
            }
            None => {
                let mut appt = Appointment::new(patient_local_id, fields.clone());
                appt.remote_id = Some(remote_id.to_string());
                appt.updated_at = updated_at.to_string();
                insert_appointment_row(tx, &appt)?;
                Ok(RemoteUpsert::Inserted(appt.local_id))
            }
        })
    }

    /// Remove the row mirroring a remote appointment the server has deleted.
    pub fn purge_appointment_by_remote_id(&self, remote_id: &str) -> DbResult<bool> {
        let rows_affected = self.conn.execute(
            "DELETE FROM appointments_local WHERE remote_id = ?",
            [remote_id],
        )?;
        Ok(rows_affected > 0)
    }

    /// Set the soft-delete marker if it is not already set.
    pub fn mark_appointment_deleted(&self, local_id: &str, at: &str) -> DbResult<bool> {
        let rows_affected = self.conn.execute(
            "UPDATE appointments_local SET deleted_at = ?2 WHERE local_id = ?1 AND deleted_at IS NULL",
            params![local_id, at],
        )?;
        Ok(rows_affected > 0)
    }
}
