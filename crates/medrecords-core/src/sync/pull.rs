//! Pull worker: fetches remote changes after the stored cursor.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::remote::{Fetched, RemoteApi, RemoteAppointment, RemotePatient, RemoteRecord};
use super::{with_db, with_timeout, SyncConfig, SyncResult};
use crate::db::{Database, DbResult, RemoteUpsert, SharedDatabase};
use crate::models::{parse_timestamp, EntityKind};

/// Applies remote deltas to the local store, server wins.
pub struct PullWorker {
    db: SharedDatabase,
    remote: Arc<dyn RemoteApi>,
    config: SyncConfig,
}

/// What happened to one remote record.
pub(crate) enum Applied {
    Upserted,
    Purged,
    Skipped,
}

impl PullWorker {
    pub fn new(db: SharedDatabase, remote: Arc<dyn RemoteApi>, config: SyncConfig) -> Self {
        Self { db, remote, config }
    }

    /// Pull every change of `entity` newer than its cursor.
    ///
    /// Returns the number of records applied. The cursor advances after each
    /// fully applied page, so a failure mid-way keeps earlier pages.
    pub async fn pull(&self, entity: EntityKind, token: &str) -> SyncResult<usize> {
        let mut applied = 0;

        for _ in 0..self.config.max_pages_per_pull {
            let cursor = with_db(&self.db, |db| db.sync_cursor(entity))?;
            let (count, fetched, newest) = match entity {
                EntityKind::Patient => self.pull_patient_page(token, cursor).await?,
                EntityKind::Appointment => self.pull_appointment_page(token, cursor).await?,
            };
            applied += count;

            match newest {
                Some(newest) if newest > cursor => {
                    with_db(&self.db, |db| db.advance_sync_cursor(entity, newest))?;
                }
                _ => break,
            }
            if fetched < self.config.page_size as usize {
                break;
            }
        }

        tracing::info!(entity = %entity, applied, "pull complete");
        Ok(applied)
    }

    async fn pull_patient_page(
        &self,
        token: &str,
        cursor: DateTime<Utc>,
    ) -> SyncResult<(usize, usize, Option<DateTime<Utc>>)> {
        let page = with_timeout(
            self.config.request_timeout,
            self.remote
                .fetch_patients(token, cursor, self.config.page_size),
        )
        .await?;

        let (applied, newest) = self.apply_page(EntityKind::Patient, &page, |record| {
            with_db(&self.db, |db| {
                skip_rejected(EntityKind::Patient, &record.id, store_patient(db, record))
            })
        })?;
        Ok((applied, page.len(), newest))
    }

    async fn pull_appointment_page(
        &self,
        token: &str,
        cursor: DateTime<Utc>,
    ) -> SyncResult<(usize, usize, Option<DateTime<Utc>>)> {
        let page = with_timeout(
            self.config.request_timeout,
            self.remote
                .fetch_appointments(token, cursor, self.config.page_size),
        )
        .await?;

        let (applied, newest) = self.apply_page(EntityKind::Appointment, &page, |record| {
            with_db(&self.db, |db| {
                skip_rejected(EntityKind::Appointment, &record.id, store_appointment(db, record))
            })
        })?;
        Ok((applied, page.len(), newest))
    }

    /// Apply every decodable element of a page.
    ///
    /// Returns the applied count and the newest `updatedAt` seen, including
    /// that of elements which were skipped, so the cursor moves past them.
    fn apply_page<T: RemoteRecord>(
        &self,
        entity: EntityKind,
        page: &[Fetched<T>],
        apply: impl Fn(&T) -> SyncResult<Applied>,
    ) -> SyncResult<(usize, Option<DateTime<Utc>>)> {
        let mut applied = 0;
        let mut newest = None;
        for element in page {
            let Some(updated_at) = element.updated_at().and_then(parse_timestamp) else {
                tracing::warn!(entity = %entity, "remote record has malformed updatedAt, skipping");
                continue;
            };
            match element {
                Fetched::Record(record) => {
                    if !matches!(apply(record)?, Applied::Skipped) {
                        applied += 1;
                    }
                }
                Fetched::Malformed { id, reason, .. } => {
                    tracing::warn!(
                        entity = %entity,
                        remote_id = ?id,
                        reason = %reason,
                        "remote record could not be decoded, skipping"
                    );
                }
            }
            newest = newest.max(Some(updated_at));
        }
        Ok((applied, newest))
    }
}

/// Turn a record the local store refuses into a skip; other errors stand.
pub(crate) fn skip_rejected(
    entity: EntityKind,
    remote_id: &str,
    result: DbResult<Applied>,
) -> DbResult<Applied> {
    match result {
        Err(err) if err.is_rejected_record() => {
            tracing::warn!(
                entity = %entity,
                remote_id = %remote_id,
                error = %err,
                "remote record rejected by local store, skipping"
            );
            Ok(Applied::Skipped)
        }
        other => other,
    }
}

pub(crate) fn store_patient(db: &Database, record: &RemotePatient) -> DbResult<Applied> {
    if record.deleted_at.is_some() {
        let purged = db.purge_patient_by_remote_id(&record.id)?;
        return Ok(if purged { Applied::Purged } else { Applied::Skipped });
    }
    record.fields.validate()?;
    match db.upsert_patient_from_remote(&record.id, &record.fields, &record.updated_at)? {
        RemoteUpsert::Inserted(local_id) => {
            tracing::debug!(remote_id = %record.id, local_id = %local_id, "patient pulled")
        }
        RemoteUpsert::Updated(local_id) => {
            tracing::debug!(remote_id = %record.id, local_id = %local_id, "patient refreshed")
        }
        RemoteUpsert::KeptLocal(local_id) => {
            tracing::debug!(remote_id = %record.id, local_id = %local_id, "patient has unsent edits")
        }
    }
    Ok(Applied::Upserted)
}

pub(crate) fn store_appointment(db: &Database, record: &RemoteAppointment) -> DbResult<Applied> {
    if record.deleted_at.is_some() {
        let purged = db.purge_appointment_by_remote_id(&record.id)?;
        return Ok(if purged { Applied::Purged } else { Applied::Skipped });
    }
    let Some(patient) = db.get_patient_by_remote_id(&record.patient_id)? else {
        tracing::warn!(
            remote_id = %record.id,
            patient_id = %record.patient_id,
            "appointment references unknown patient, skipping"
        );
        return Ok(Applied::Skipped);
    };
    record.fields.validate()?;
    if let RemoteUpsert::KeptLocal(local_id) = db.upsert_appointment_from_remote(
        &record.id,
        &patient.local_id,
        &record.fields,
        &record.updated_at,
    )? {
        tracing::debug!(
            remote_id = %record.id,
            local_id = %local_id,
            "appointment has unsent edits, kept"
        );
    }
    Ok(Applied::Upserted)
}
