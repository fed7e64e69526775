//! MedRecords Core Library
//!
//! Local-first patient and appointment store with an offline sync engine for
//! the mobile client.
//!
//! # Architecture
//!
//! ```text
//!   Mobile UI ──► MedRecordsCore (FFI)
//!                      │
//!                      ▼
//!          ┌──────────────────────────┐
//!          │  patients_local          │
//!          │  appointments_local      │   one transaction per write
//!          │  sync_outbox             │
//!          └────────────┬─────────────┘
//!                       │
//!             SyncSession / SyncScheduler
//!             (foreground, every 5 min, sync now)
//!                       │
//!          ┌────────────┴─────────────┐
//!          ▼                          ▼
//!     PushWorker                 PullWorker
//!   POST / PUT / DELETE      GET ?updatedAfter=cursor
//!          └────────────┬─────────────┘
//!                       ▼
//!                 REST service
//! ```
//!
//! # Core Principle
//!
//! **The device never waits for the network.** Every write succeeds locally
//! and is replayed at least once; on conflict the server version wins.
//!
//! # Modules
//!
//! - [`db`]: SQLite store, outbox writer and sync cursors
//! - [`models`]: Domain types (Patient, Appointment, OutboxEntry, etc.)
//! - [`sync`]: Push/pull workers, scheduler and remote client
//! - [`logging`]: tracing subscriber setup

pub mod db;
pub mod logging;
pub mod models;
pub mod sync;

// Re-export commonly used types
pub use db::{Database, SharedDatabase};
pub use models::{
    Appointment, AppointmentFields, AppointmentStatus, EntityKind, OutboxEntry, OutboxOperation,
    OutboxPayload, Patient, PatientFields,
};
pub use sync::{
    HttpRemote, MockRemote, PullWorker, PushWorker, RemoteApi, SyncConfig, SyncScheduler,
};

// UniFFI setup - using proc macros
uniffi::setup_scaffolding!();

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sync::{
    AppLifecycle, ManualLifecycle, RetryConfig, SchedulerHandle, SyncPorts, SyncSnapshot,
    SyncStatus, StaticConnectivity, StaticTokenProvider, TriggerOutcome,
};

// =========================================================================
// FFI Error Type
// =========================================================================

#[derive(Debug, thiserror::Error, uniffi::Error)]
pub enum MedRecordsError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Sync error: {0}")]
    SyncError(String),
}

impl From<db::DbError> for MedRecordsError {
    fn from(e: db::DbError) -> Self {
        match e {
            db::DbError::NotFound(what) => MedRecordsError::NotFound(what),
            db::DbError::Validation(err) => MedRecordsError::InvalidInput(err.to_string()),
            db::DbError::Constraint(msg) => MedRecordsError::InvalidInput(msg),
            other => MedRecordsError::DatabaseError(other.to_string()),
        }
    }
}

impl From<sync::SyncError> for MedRecordsError {
    fn from(e: sync::SyncError) -> Self {
        match e {
            sync::SyncError::Database(err) => err.into(),
            other => MedRecordsError::SyncError(other.to_string()),
        }
    }
}

impl From<sync::RemoteError> for MedRecordsError {
    fn from(e: sync::RemoteError) -> Self {
        MedRecordsError::SyncError(e.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for MedRecordsError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        MedRecordsError::DatabaseError(format!("Lock poisoned: {}", e))
    }
}

// =========================================================================
// Factory Functions (exported to FFI)
// =========================================================================

/// Open or create a database at the given path.
#[uniffi::export]
pub fn open_database(path: String) -> Result<Arc<MedRecordsCore>, MedRecordsError> {
    let db = Database::open(&path)?;
    Ok(Arc::new(MedRecordsCore {
        db: db.into_shared(),
    }))
}

/// Create an in-memory database (for testing).
#[uniffi::export]
pub fn open_database_in_memory() -> Result<Arc<MedRecordsCore>, MedRecordsError> {
    let db = Database::open_in_memory()?;
    Ok(Arc::new(MedRecordsCore {
        db: db.into_shared(),
    }))
}

/// Route core logs to stdout, filtered by an `EnvFilter` directive string.
#[uniffi::export]
pub fn init_logging(filter: String) -> bool {
    logging::init(&filter)
}

// =========================================================================
// Main API Object
// =========================================================================

/// Thread-safe database wrapper for FFI.
#[derive(uniffi::Object)]
pub struct MedRecordsCore {
    db: SharedDatabase,
}

#[uniffi::export]
impl MedRecordsCore {
    // =========================================================================
    // Patient Operations
    // =========================================================================

    /// Create a patient; queued for upload.
    pub fn create_patient(&self, fields: FfiPatientFields) -> Result<FfiPatient, MedRecordsError> {
        let db = self.db.lock()?;
        let patient = db.create_patient(fields.into())?;
        Ok(patient.into())
    }

    /// Replace a patient's fields; queued for upload.
    pub fn update_patient(
        &self,
        local_id: String,
        fields: FfiPatientFields,
    ) -> Result<FfiPatient, MedRecordsError> {
        let db = self.db.lock()?;
        let patient = db.update_patient(&local_id, fields.into())?;
        Ok(patient.into())
    }

    /// Soft-delete a patient; queued for upload.
    pub fn delete_patient(&self, local_id: String) -> Result<bool, MedRecordsError> {
        let db = self.db.lock()?;
        Ok(db.delete_patient(&local_id)?)
    }

    /// Get a patient by local ID.
    pub fn get_patient(&self, local_id: String) -> Result<Option<FfiPatient>, MedRecordsError> {
        let db = self.db.lock()?;
        let patient = db.get_patient(&local_id)?;
        Ok(patient.map(|p| p.into()))
    }

    pub fn list_patients(&self) -> Result<Vec<FfiPatient>, MedRecordsError> {
        let db = self.db.lock()?;
        let patients = db.list_patients()?;
        Ok(patients.into_iter().map(|p| p.into()).collect())
    }

    /// Search patients by name prefix.
    pub fn search_patients(
        &self,
        query: String,
        limit: u32,
    ) -> Result<Vec<FfiPatient>, MedRecordsError> {
        let db = self.db.lock()?;
        let patients = db.search_patients(&query, limit as usize)?;
        Ok(patients.into_iter().map(|p| p.into()).collect())
    }

    // =========================================================================
    // Appointment Operations
    // =========================================================================

    /// Book an appointment for a patient; queued for upload.
    pub fn create_appointment(
        &self,
        patient_local_id: String,
        fields: FfiAppointmentFields,
    ) -> Result<FfiAppointment, MedRecordsError> {
        let db = self.db.lock()?;
        let appointment = db.create_appointment(&patient_local_id, fields.into())?;
        Ok(appointment.into())
    }

    pub fn update_appointment(
        &self,
        local_id: String,
        fields: FfiAppointmentFields,
    ) -> Result<FfiAppointment, MedRecordsError> {
        let db = self.db.lock()?;
        let appointment = db.update_appointment(&local_id, fields.into())?;
        Ok(appointment.into())
    }

    pub fn delete_appointment(&self, local_id: String) -> Result<bool, MedRecordsError> {
        let db = self.db.lock()?;
        Ok(db.delete_appointment(&local_id)?)
    }

    pub fn get_appointment(
        &self,
        local_id: String,
    ) -> Result<Option<FfiAppointment>, MedRecordsError> {
        let db = self.db.lock()?;
        let appointment = db.get_appointment(&local_id)?;
        Ok(appointment.map(|a| a.into()))
    }

    pub fn list_appointments_for_patient(
        &self,
        patient_local_id: String,
    ) -> Result<Vec<FfiAppointment>, MedRecordsError> {
        let db = self.db.lock()?;
        let appointments = db.list_appointments_for_patient(&patient_local_id)?;
        Ok(appointments.into_iter().map(|a| a.into()).collect())
    }

    /// Scheduled appointments starting at or after `from` (RFC 3339).
    pub fn list_upcoming_appointments(
        &self,
        from: String,
        limit: u32,
    ) -> Result<Vec<FfiAppointment>, MedRecordsError> {
        let db = self.db.lock()?;
        let appointments = db.list_upcoming_appointments(&from, limit as usize)?;
        Ok(appointments.into_iter().map(|a| a.into()).collect())
    }

    // =========================================================================
    // Sync Operations
    // =========================================================================

    /// Number of local mutations not yet confirmed by the server.
    pub fn pending_mutations(&self) -> Result<u32, MedRecordsError> {
        let db = self.db.lock()?;
        Ok(db.outbox_len()? as u32)
    }

    /// Pull cursor for an entity type.
    pub fn sync_cursor(&self, entity: FfiEntityKind) -> Result<String, MedRecordsError> {
        let db = self.db.lock()?;
        let cursor = db.sync_cursor(entity.into())?;
        Ok(models::format_timestamp(cursor))
    }

    /// Time of the last cycle that completed without error.
    pub fn last_successful_sync(&self) -> Result<Option<String>, MedRecordsError> {
        let db = self.db.lock()?;
        Ok(db.last_successful_sync()?.map(models::format_timestamp))
    }

    /// Start background sync against the REST service.
    ///
    /// The session begins online and backgrounded; the host reports
    /// lifecycle, connectivity and token changes through it.
    pub fn start_sync(
        &self,
        config: FfiSyncConfig,
        token: Option<String>,
    ) -> Result<Arc<SyncSession>, MedRecordsError> {
        let config: SyncConfig = config.into();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("medrecords-sync")
            .enable_all()
            .build()
            .map_err(|e| MedRecordsError::SyncError(format!("failed to start runtime: {}", e)))?;

        let connectivity = Arc::new(StaticConnectivity::new(true));
        let tokens = Arc::new(StaticTokenProvider::new(token));
        let lifecycle = Arc::new(ManualLifecycle::new(AppLifecycle::Background));
        let ports = SyncPorts::new(connectivity.clone(), tokens.clone(), lifecycle.clone());

        let remote = Arc::new(HttpRemote::new(&config)?);
        let scheduler = Arc::new(SyncScheduler::new(self.db.clone(), remote, config, ports)?);
        let handle = {
            let _entered = runtime.enter();
            scheduler.clone().spawn()
        };

        Ok(Arc::new(SyncSession {
            runtime,
            scheduler,
            handle: Mutex::new(Some(handle)),
            connectivity,
            tokens,
            lifecycle,
        }))
    }
}

// =========================================================================
// Sync Session
// =========================================================================

/// A running sync scheduler owned by the host app.
#[derive(uniffi::Object)]
pub struct SyncSession {
    runtime: tokio::runtime::Runtime,
    scheduler: Arc<SyncScheduler>,
    handle: Mutex<Option<SchedulerHandle>>,
    connectivity: Arc<StaticConnectivity>,
    tokens: Arc<StaticTokenProvider>,
    lifecycle: Arc<ManualLifecycle>,
}

#[uniffi::export]
impl SyncSession {
    /// Run a cycle now (after any cycle already in progress) and report it.
    pub fn sync_now(&self) -> Result<FfiSyncOutcome, MedRecordsError> {
        let handle = self.handle.lock()?;
        let handle = handle
            .as_ref()
            .ok_or_else(|| MedRecordsError::SyncError("sync session stopped".into()))?;
        let outcome = self.runtime.block_on(handle.sync_now())?;
        Ok(outcome.into())
    }

    pub fn notify_foreground(&self) {
        self.lifecycle.set(AppLifecycle::Foreground);
    }

    pub fn notify_background(&self) {
        self.lifecycle.set(AppLifecycle::Background);
    }

    pub fn set_online(&self, online: bool) {
        self.connectivity.set_online(online);
    }

    /// Replace the bearer token; `None` signs out.
    pub fn set_token(&self, token: Option<String>) {
        self.tokens.set_token(token);
    }

    pub fn status(&self) -> FfiSyncSnapshot {
        self.scheduler.snapshot().into()
    }

    /// Stop the scheduler after the current cycle. Idempotent.
    pub fn shutdown(&self) -> Result<(), MedRecordsError> {
        let handle = self.handle.lock()?.take();
        if let Some(handle) = handle {
            self.runtime.block_on(handle.shutdown());
        }
        Ok(())
    }
}

// =========================================================================
// FFI Types
// =========================================================================

/// FFI-safe patient fields.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiPatientFields {
    pub name: String,
    pub date_of_birth: Option<String>,
    pub sex: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub notes: Option<String>,
}

impl From<FfiPatientFields> for PatientFields {
    fn from(fields: FfiPatientFields) -> Self {
        PatientFields {
            name: fields.name,
            date_of_birth: fields.date_of_birth,
            sex: fields.sex,
            phone: fields.phone,
            email: fields.email,
            notes: fields.notes,
        }
    }
}

impl From<PatientFields> for FfiPatientFields {
    fn from(fields: PatientFields) -> Self {
        Self {
            name: fields.name,
            date_of_birth: fields.date_of_birth,
            sex: fields.sex,
            phone: fields.phone,
            email: fields.email,
            notes: fields.notes,
        }
    }
}

/// FFI-safe patient.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiPatient {
    pub local_id: String,
    pub remote_id: Option<String>,
    pub fields: FfiPatientFields,
    pub updated_at: String,
    pub deleted_at: Option<String>,
}

impl From<Patient> for FfiPatient {
    fn from(patient: Patient) -> Self {
        Self {
            local_id: patient.local_id,
            remote_id: patient.remote_id,
            fields: patient.fields.into(),
            updated_at: patient.updated_at,
            deleted_at: patient.deleted_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum FfiAppointmentStatus {
    Scheduled,
    Completed,
    Cancelled,
    NoShow,
}

impl From<FfiAppointmentStatus> for AppointmentStatus {
    fn from(status: FfiAppointmentStatus) -> Self {
        match status {
            FfiAppointmentStatus::Scheduled => AppointmentStatus::Scheduled,
            FfiAppointmentStatus::Completed => AppointmentStatus::Completed,
            FfiAppointmentStatus::Cancelled => AppointmentStatus::Cancelled,
            FfiAppointmentStatus::NoShow => AppointmentStatus::NoShow,
        }
    }
}

impl From<AppointmentStatus> for FfiAppointmentStatus {
    fn from(status: AppointmentStatus) -> Self {
        match status {
            AppointmentStatus::Scheduled => FfiAppointmentStatus::Scheduled,
            AppointmentStatus::Completed => FfiAppointmentStatus::Completed,
            AppointmentStatus::Cancelled => FfiAppointmentStatus::Cancelled,
            AppointmentStatus::NoShow => FfiAppointmentStatus::NoShow,
        }
    }
}

/// FFI-safe appointment fields.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiAppointmentFields {
    pub scheduled_at: String,
    pub duration_minutes: u32,
    pub status: FfiAppointmentStatus,
    pub reason: Option<String>,
    pub notes: Option<String>,
}

impl From<FfiAppointmentFields> for AppointmentFields {
    fn from(fields: FfiAppointmentFields) -> Self {
        AppointmentFields {
            scheduled_at: fields.scheduled_at,
            duration_minutes: fields.duration_minutes,
            status: fields.status.into(),
            reason: fields.reason,
            notes: fields.notes,
        }
    }
}

impl From<AppointmentFields> for FfiAppointmentFields {
    fn from(fields: AppointmentFields) -> Self {
        Self {
            scheduled_at: fields.scheduled_at,
            duration_minutes: fields.duration_minutes,
            status: fields.status.into(),
            reason: fields.reason,
            notes: fields.notes,
        }
    }
}

/// FFI-safe appointment.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiAppointment {
    pub local_id: String,
    pub remote_id: Option<String>,
    pub patient_local_id: String,
    pub fields: FfiAppointmentFields,
    pub updated_at: String,
    pub deleted_at: Option<String>,
}

impl From<Appointment> for FfiAppointment {
    fn from(appointment: Appointment) -> Self {
        Self {
            local_id: appointment.local_id,
            remote_id: appointment.remote_id,
            patient_local_id: appointment.patient_local_id,
            fields: appointment.fields.into(),
            updated_at: appointment.updated_at,
            deleted_at: appointment.deleted_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum FfiEntityKind {
    Patient,
    Appointment,
}

impl From<FfiEntityKind> for EntityKind {
    fn from(kind: FfiEntityKind) -> Self {
        match kind {
            FfiEntityKind::Patient => EntityKind::Patient,
            FfiEntityKind::Appointment => EntityKind::Appointment,
        }
    }
}

/// FFI-safe sync configuration; durations in milliseconds.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiSyncConfig {
    pub base_url: String,
    pub request_timeout_ms: u64,
    pub page_size: u32,
    pub max_pages_per_pull: u32,
    pub sync_interval_ms: u64,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_jitter_ms: u64,
    pub max_retries: u32,
}

impl From<FfiSyncConfig> for SyncConfig {
    fn from(config: FfiSyncConfig) -> Self {
        let retry = RetryConfig::new(config.max_retries)
            .with_base_delay(Duration::from_millis(config.retry_base_delay_ms))
            .with_max_delay(Duration::from_millis(config.retry_max_delay_ms))
            .with_jitter(Duration::from_millis(config.retry_jitter_ms));

        SyncConfig::new(config.base_url)
            .with_request_timeout(Duration::from_millis(config.request_timeout_ms))
            .with_page_size(config.page_size)
            .with_max_pages_per_pull(config.max_pages_per_pull)
            .with_sync_interval(Duration::from_millis(config.sync_interval_ms))
            .with_retry(retry)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum FfiSyncStatus {
    NotSynced,
    Synced,
    Syncing,
    Error,
}

/// FFI-safe view of the scheduler state.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiSyncSnapshot {
    pub status: FfiSyncStatus,
    pub last_synced_at: Option<String>,
    pub last_error: Option<String>,
    pub needs_attention: u32,
    pub pending_mutations: u32,
}

impl From<SyncSnapshot> for FfiSyncSnapshot {
    fn from(snapshot: SyncSnapshot) -> Self {
        Self {
            status: match snapshot.status {
                SyncStatus::NotSynced => FfiSyncStatus::NotSynced,
                SyncStatus::Synced => FfiSyncStatus::Synced,
                SyncStatus::Syncing => FfiSyncStatus::Syncing,
                SyncStatus::Error => FfiSyncStatus::Error,
            },
            last_synced_at: snapshot.last_synced_at.map(models::format_timestamp),
            last_error: snapshot.last_error,
            needs_attention: snapshot.needs_attention,
            pending_mutations: snapshot.pending_mutations as u32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum FfiTriggerResult {
    Completed,
    AlreadyRunning,
    Offline,
    Unauthenticated,
}

/// FFI-safe result of a manual sync.
#[derive(Debug, Clone, uniffi::Record)]
pub struct FfiSyncOutcome {
    pub result: FfiTriggerResult,
    pub pushed: u32,
    pub discarded: u32,
    pub pulled_patients: u32,
    pub pulled_appointments: u32,
    pub error: Option<String>,
}

impl From<TriggerOutcome> for FfiSyncOutcome {
    fn from(outcome: TriggerOutcome) -> Self {
        let skipped = |result: FfiTriggerResult| Self {
            result,
            pushed: 0,
            discarded: 0,
            pulled_patients: 0,
            pulled_appointments: 0,
            error: None,
        };
        match outcome {
            TriggerOutcome::Completed(report) => Self {
                result: FfiTriggerResult::Completed,
                pushed: report.push.succeeded,
                discarded: report.push.discarded.len() as u32,
                pulled_patients: report.pulled(EntityKind::Patient) as u32,
                pulled_appointments: report.pulled(EntityKind::Appointment) as u32,
                error: report.first_error().map(str::to_string),
            },
            TriggerOutcome::AlreadyRunning => skipped(FfiTriggerResult::AlreadyRunning),
            TriggerOutcome::Offline => skipped(FfiTriggerResult::Offline),
            TriggerOutcome::Unauthenticated => skipped(FfiTriggerResult::Unauthenticated),
        }
    }
}
