//! Push worker: replays the outbox against the remote service.
//!
//! Entries are visited in creation order. Entries for the same entity form a
//! FIFO lane keyed by `(entity, local_id)`: once one entry in a lane is held
//! back (backing off, failed, or waiting on its patient) every later entry in
//! that lane waits for the next cycle.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::pull::{skip_rejected, store_appointment, store_patient};
use super::remote::{AppointmentBody, RemoteApi, RemoteAppointment, RemotePatient};
use super::{with_db, with_timeout, Clock, ConflictKind, RemoteError, SyncConfig, SyncResult};
use crate::db::SharedDatabase;
use crate::models::{
    format_timestamp, parse_timestamp, AppointmentFields, EntityKind, OutboxEntry,
    OutboxOperation, OutboxPayload,
};

/// Why a mutation was dropped without reaching the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// The server reported a conflict; its version wins.
    Conflict,
    /// Transient failures exceeded the retry ceiling.
    RetriesExhausted,
    /// The server (or the local state) made the mutation impossible.
    Rejected,
}

/// A mutation removed from the outbox without being applied remotely.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscardedMutation {
    pub entry_id: String,
    pub entity: EntityKind,
    pub operation: OutboxOperation,
    pub local_id: String,
    pub reason: DiscardReason,
    pub detail: String,
}

/// Result of one drain pass.
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    /// Entries for which delivery was tried
    pub attempted: u32,
    /// Entries confirmed by the server and removed
    pub succeeded: u32,
    /// Entries dropped because the server reported a conflict
    pub conflicts: u32,
    /// Entries left in the outbox for a later cycle
    pub deferred: u32,
    /// Every entry dropped without being applied remotely
    pub discarded: Vec<DiscardedMutation>,
    /// First retryable failure seen during the pass
    pub first_error: Option<RemoteError>,
}

impl DrainReport {
    /// Discards that were not plain conflicts.
    pub fn needs_attention(&self) -> usize {
        self.discarded
            .iter()
            .filter(|d| d.reason != DiscardReason::Conflict)
            .count()
    }
}

enum Outcome {
    /// Applied remotely (or nothing left to apply)
    Synced,
    /// Not attempted this cycle
    Held(&'static str),
    /// Attempted, failed, kept for retry
    Failed(RemoteError),
    /// Dropped from the outbox
    Discarded(DiscardReason, String),
}

enum PatientRef {
    Ready(String),
    Pending,
    Missing,
}

/// Drains the outbox one entry at a time.
pub struct PushWorker {
    db: SharedDatabase,
    remote: Arc<dyn RemoteApi>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
}

impl PushWorker {
    pub fn new(
        db: SharedDatabase,
        remote: Arc<dyn RemoteApi>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        Self {
            db,
            remote,
            clock,
            config,
        }
    }

    /// Push every due outbox entry once.
    ///
    /// Remote failures are absorbed into the report. Local storage errors
    /// abort the pass and are returned.
    pub async fn drain(&self, token: &str) -> SyncResult<DrainReport> {
        let entries = with_db(&self.db, |db| db.list_outbox())?;
        let mut report = DrainReport::default();
        let mut held: HashSet<(EntityKind, String)> = HashSet::new();

        for entry in entries {
            let key = entry.entity_key();
            if held.contains(&key) || patient_lane_held(&entry, &held) {
                held.insert(key);
                report.deferred += 1;
                continue;
            }

            if !self.is_due(&entry, self.clock.now()) {
                tracing::debug!(
                    entry_id = %entry.id,
                    retry_count = entry.retry_count,
                    "outbox entry backing off"
                );
                held.insert(key);
                report.deferred += 1;
                continue;
            }

            match self.push_entry(&entry, token).await? {
                Outcome::Synced => {
                    with_db(&self.db, |db| db.delete_outbox_entry(&entry.id))?;
                    report.attempted += 1;
                    report.succeeded += 1;
                    tracing::debug!(
                        entry_id = %entry.id,
                        entity = %entry.entity(),
                        operation = %entry.operation(),
                        local_id = entry.local_id(),
                        "outbox entry pushed"
                    );
                }
                Outcome::Held(reason) => {
                    tracing::debug!(entry_id = %entry.id, reason, "outbox entry held");
                    held.insert(key);
                    report.deferred += 1;
                }
                Outcome::Failed(err) => {
                    tracing::debug!(
                        entry_id = %entry.id,
                        error = %err,
                        "outbox entry failed, will retry"
                    );
                    report.attempted += 1;
                    report.deferred += 1;
                    held.insert(key);
                    let unauthorized = matches!(err, RemoteError::Unauthorized(_));
                    report.first_error.get_or_insert(err);
                    if unauthorized {
                        tracing::info!("credentials rejected, stopping push for this cycle");
                        break;
                    }
                }
                Outcome::Discarded(reason, detail) => {
                    with_db(&self.db, |db| db.delete_outbox_entry(&entry.id))?;
                    report.attempted += 1;
                    if reason == DiscardReason::Conflict {
                        report.conflicts += 1;
                    }
                    tracing::warn!(
                        entry_id = %entry.id,
                        entity = %entry.entity(),
                        operation = %entry.operation(),
                        local_id = entry.local_id(),
                        reason = ?reason,
                        detail = %detail,
                        "outbox entry discarded"
                    );
                    report.discarded.push(DiscardedMutation {
                        entry_id: entry.id.clone(),
                        entity: entry.entity(),
                        operation: entry.operation(),
                        local_id: entry.local_id().to_string(),
                        reason,
                        detail,
                    });
                    if entry.operation() == OutboxOperation::Update
                        && reason != DiscardReason::RetriesExhausted
                    {
                        self.refresh(&entry, token).await?;
                    }
                }
            }
        }

        tracing::info!(
            attempted = report.attempted,
            succeeded = report.succeeded,
            conflicts = report.conflicts,
            deferred = report.deferred,
            discarded = report.discarded.len(),
            "outbox drained"
        );
        Ok(report)
    }

    fn is_due(&self, entry: &OutboxEntry, now: DateTime<Utc>) -> bool {
        let Some(last) = entry.last_attempt_at.as_deref().and_then(parse_timestamp) else {
            return true;
        };
        let wait = self
            .config
            .retry
            .backoff_with_jitter(entry.retry_count, &entry.id);
        let elapsed = now
            .signed_duration_since(last)
            .to_std()
            .unwrap_or(Duration::ZERO);
        elapsed >= wait
    }

    async fn push_entry(&self, entry: &OutboxEntry, token: &str) -> SyncResult<Outcome> {
        match &entry.payload {
            OutboxPayload::CreatePatient { local_id, fields } => {
                let Some(row) = with_db(&self.db, |db| db.get_patient(local_id))? else {
                    return Ok(Outcome::Discarded(
                        DiscardReason::Rejected,
                        "local patient no longer exists".into(),
                    ));
                };
                if row.remote_id.is_some() {
                    return Ok(Outcome::Synced);
                }

                match self.call(self.remote.create_patient(token, fields)).await {
                    Ok(remote_id) => {
                        with_db(&self.db, |db| db.bind_patient_remote_id(local_id, &remote_id))?;
                        Ok(Outcome::Synced)
                    }
                    Err(err) => self.failure(entry, err),
                }
            }

            OutboxPayload::UpdatePatient {
                local_id,
                remote_id,
                fields,
            } => {
                let Some(remote_id) = self.resolve_remote_id(EntityKind::Patient, local_id, remote_id)?
                else {
                    return Ok(Outcome::Discarded(
                        DiscardReason::Rejected,
                        "patient was never acknowledged by the server".into(),
                    ));
                };

                match self
                    .call(self.remote.update_patient(token, &remote_id, fields))
                    .await
                {
                    Ok(()) => Ok(Outcome::Synced),
                    Err(err) => {
                        if err.conflict_kind() == Some(ConflictKind::NotFound) {
                            self.mark_deleted(EntityKind::Patient, local_id)?;
                        }
                        self.failure(entry, err)
                    }
                }
            }

            OutboxPayload::DeletePatient {
                local_id,
                remote_id,
            } => {
                self.push_delete(entry, token, EntityKind::Patient, local_id, remote_id)
                    .await
            }

            OutboxPayload::CreateAppointment {
                local_id,
                patient_local_id,
                fields,
            } => {
                let Some(row) = with_db(&self.db, |db| db.get_appointment(local_id))? else {
                    return Ok(Outcome::Discarded(
                        DiscardReason::Rejected,
                        "local appointment no longer exists".into(),
                    ));
                };
                if row.remote_id.is_some() {
                    return Ok(Outcome::Synced);
                }
                let body = match self.appointment_body(patient_local_id, fields)? {
                    Ok(body) => body,
                    Err(outcome) => return Ok(outcome),
                };

                match self
                    .call(self.remote.create_appointment(token, &body))
                    .await
                {
                    Ok(remote_id) => {
                        with_db(&self.db, |db| {
                            db.bind_appointment_remote_id(local_id, &remote_id)
                        })?;
                        Ok(Outcome::Synced)
                    }
                    Err(err) => self.failure(entry, err),
                }
            }

            OutboxPayload::UpdateAppointment {
                local_id,
                remote_id,
                patient_local_id,
                fields,
            } => {
                let Some(remote_id) =
                    self.resolve_remote_id(EntityKind::Appointment, local_id, remote_id)?
                else {
                    return Ok(Outcome::Discarded(
                        DiscardReason::Rejected,
                        "appointment was never acknowledged by the server".into(),
                    ));
                };
                let body = match self.appointment_body(patient_local_id, fields)? {
                    Ok(body) => body,
                    Err(outcome) => return Ok(outcome),
                };

                match self
                    .call(self.remote.update_appointment(token, &remote_id, &body))
                    .await
                {
                    Ok(()) => Ok(Outcome::Synced),
                    Err(err) => {
                        if err.conflict_kind() == Some(ConflictKind::NotFound) {
                            self.mark_deleted(EntityKind::Appointment, local_id)?;
                        }
                        self.failure(entry, err)
                    }
                }
            }

            OutboxPayload::DeleteAppointment {
                local_id,
                remote_id,
            } => {
                self.push_delete(entry, token, EntityKind::Appointment, local_id, remote_id)
                    .await
            }
        }
    }

    async fn push_delete(
        &self,
        entry: &OutboxEntry,
        token: &str,
        entity: EntityKind,
        local_id: &str,
        remote_id: &Option<String>,
    ) -> SyncResult<Outcome> {
        // Never reached the server: nothing to delete remotely
        let Some(remote_id) = self.resolve_remote_id(entity, local_id, remote_id)? else {
            self.mark_deleted(entity, local_id)?;
            return Ok(Outcome::Synced);
        };

        match self
            .call(self.remote.delete(token, entity, &remote_id))
            .await
        {
            Ok(()) => {
                self.mark_deleted(entity, local_id)?;
                Ok(Outcome::Synced)
            }
            Err(err) if err.conflict_kind() == Some(ConflictKind::NotFound) => {
                self.mark_deleted(entity, local_id)?;
                Ok(Outcome::Synced)
            }
            Err(err) => self.failure(entry, err),
        }
    }

    /// Build the request body, or the outcome to report if the owning
    /// patient has no server ID yet.
    fn appointment_body(
        &self,
        patient_local_id: &str,
        fields: &AppointmentFields,
    ) -> SyncResult<Result<AppointmentBody, Outcome>> {
        let body = match self.patient_ref(patient_local_id)? {
            PatientRef::Ready(patient_id) => Ok(AppointmentBody {
                patient_id,
                fields: fields.clone(),
            }),
            PatientRef::Pending => Err(Outcome::Held("patient not yet acknowledged")),
            PatientRef::Missing => Err(Outcome::Discarded(
                DiscardReason::Rejected,
                format!("patient {} never reached the server", patient_local_id),
            )),
        };
        Ok(body)
    }

    fn patient_ref(&self, patient_local_id: &str) -> SyncResult<PatientRef> {
        with_db(&self.db, |db| {
            if let Some(remote_id) = db
                .get_patient(patient_local_id)?
                .and_then(|p| p.remote_id)
            {
                return Ok(PatientRef::Ready(remote_id));
            }
            if db.has_pending_outbox(EntityKind::Patient, patient_local_id)? {
                Ok(PatientRef::Pending)
            } else {
                Ok(PatientRef::Missing)
            }
        })
    }

    /// Remote ID from the payload, else the one bound to the row since.
    fn resolve_remote_id(
        &self,
        entity: EntityKind,
        local_id: &str,
        captured: &Option<String>,
    ) -> SyncResult<Option<String>> {
        if let Some(remote_id) = captured {
            return Ok(Some(remote_id.clone()));
        }
        with_db(&self.db, |db| {
            Ok(match entity {
                EntityKind::Patient => db.get_patient(local_id)?.and_then(|p| p.remote_id),
                EntityKind::Appointment => {
                    db.get_appointment(local_id)?.and_then(|a| a.remote_id)
                }
            })
        })
    }

    fn record_attempt(&self, entry: &OutboxEntry) -> SyncResult<u32> {
        let at = format_timestamp(self.clock.now());
        with_db(&self.db, |db| db.record_outbox_attempt(&entry.id, &at))
    }

    fn mark_deleted(&self, entity: EntityKind, local_id: &str) -> SyncResult<()> {
        let at = format_timestamp(self.clock.now());
        with_db(&self.db, |db| match entity {
            EntityKind::Patient => db.mark_patient_deleted(local_id, &at),
            EntityKind::Appointment => db.mark_appointment_deleted(local_id, &at),
        })?;
        Ok(())
    }

    async fn call<T, F>(&self, call: F) -> Result<T, RemoteError>
    where
        F: std::future::Future<Output = Result<T, RemoteError>>,
    {
        with_timeout(self.config.request_timeout, call).await
    }

    /// Classify a failed call. Only failures the entry itself can cause
    /// count as an attempt; rejected credentials hold it without one.
    fn failure(&self, entry: &OutboxEntry, err: RemoteError) -> SyncResult<Outcome> {
        if matches!(err, RemoteError::Unauthorized(_)) {
            return Ok(Outcome::Failed(err));
        }
        if err.conflict_kind().is_some() {
            return Ok(Outcome::Discarded(DiscardReason::Conflict, err.to_string()));
        }
        if !err.is_retryable() {
            return Ok(Outcome::Discarded(DiscardReason::Rejected, err.to_string()));
        }

        let retry_count = self.record_attempt(entry)?;
        if self.config.retry.exhausted(retry_count) {
            Ok(Outcome::Discarded(
                DiscardReason::RetriesExhausted,
                format!("gave up after {} attempts: {}", retry_count, err),
            ))
        } else {
            Ok(Outcome::Failed(err))
        }
    }

    /// Re-read the server's copy of a record whose update was dropped, so
    /// the local row stops showing the edit the server refused.
    ///
    /// Remote failures are logged and left for a later pull.
    async fn refresh(&self, entry: &OutboxEntry, token: &str) -> SyncResult<()> {
        let entity = entry.entity();
        let local_id = entry.local_id();
        let captured = entry.payload.remote_id().map(str::to_string);
        let Some(remote_id) = self.resolve_remote_id(entity, local_id, &captured)? else {
            return Ok(());
        };
        let deleted = with_db(&self.db, |db| {
            Ok(match entity {
                EntityKind::Patient => db.get_patient(local_id)?.map(|p| p.deleted_at.is_some()),
                EntityKind::Appointment => {
                    db.get_appointment(local_id)?.map(|a| a.deleted_at.is_some())
                }
            })
        })?;
        if deleted != Some(false) {
            return Ok(());
        }

        let fetched = match entity {
            EntityKind::Patient => self
                .call(self.remote.fetch_patient(token, &remote_id))
                .await
                .map(|record| record.map(Refreshed::Patient)),
            EntityKind::Appointment => self
                .call(self.remote.fetch_appointment(token, &remote_id))
                .await
                .map(|record| record.map(Refreshed::Appointment)),
        };
        match fetched {
            Ok(Some(record)) => {
                with_db(&self.db, |db| {
                    let applied = match &record {
                        Refreshed::Patient(record) => store_patient(db, record),
                        Refreshed::Appointment(record) => store_appointment(db, record),
                    };
                    skip_rejected(entity, &remote_id, applied)
                })?;
                tracing::debug!(entity = %entity, remote_id = %remote_id, "server version restored");
            }
            Ok(None) => self.mark_deleted(entity, local_id)?,
            Err(err) => {
                tracing::warn!(
                    entity = %entity,
                    remote_id = %remote_id,
                    error = %err,
                    "could not refresh record after dropped update"
                );
            }
        }
        Ok(())
    }
}

enum Refreshed {
    Patient(RemotePatient),
    Appointment(RemoteAppointment),
}

fn patient_lane_held(entry: &OutboxEntry, held: &HashSet<(EntityKind, String)>) -> bool {
    entry
        .payload
        .patient_local_id()
        .map(|patient| held.contains(&(EntityKind::Patient, patient.to_string())))
        .unwrap_or(false)
}
