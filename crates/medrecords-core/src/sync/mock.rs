//! In-memory stand-in for the remote REST service.
//!
//! Keeps its own records with server-assigned IDs and `updatedAt` stamps,
//! records every call, and can be scripted to fail specific operations.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use parking_lot::Mutex;

use serde_json::Value;

use super::remote::{
    AppointmentBody, Fetched, RemoteApi, RemoteAppointment, RemotePatient, RemoteRecord,
};
use super::{ConflictKind, RemoteError};
use crate::models::{format_timestamp, parse_timestamp, AppointmentFields, EntityKind, PatientFields};

/// Kind of remote operation, for scripting failures and inspecting calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Create,
    Update,
    Delete,
    Fetch,
}

/// One call received by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub op: MockOp,
    pub entity: EntityKind,
    pub remote_id: Option<String>,
}

#[derive(Debug, Clone)]
struct Stored<T> {
    body: T,
    updated_at: String,
    deleted_at: Option<String>,
}

#[derive(Default)]
struct MockState {
    patients: BTreeMap<String, Stored<PatientFields>>,
    appointments: BTreeMap<String, Stored<AppointmentBody>>,
    next_id: u64,
    revision: i64,
    failures: HashMap<MockOp, VecDeque<RemoteError>>,
    calls: Vec<MockCall>,
    token: Option<String>,
    /// Elements served verbatim in delta pages, as another client version wrote them
    raw: Vec<(EntityKind, Value)>,
}

impl MockState {
    fn stamp(&mut self) -> String {
        self.revision += 1;
        format_timestamp(mock_epoch() + ChronoDuration::seconds(self.revision))
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn begin(
        &mut self,
        op: MockOp,
        entity: EntityKind,
        remote_id: Option<&str>,
        token: &str,
    ) -> Result<(), RemoteError> {
        self.calls.push(MockCall {
            op,
            entity,
            remote_id: remote_id.map(str::to_string),
        });
        if let Some(expected) = &self.token {
            if expected != token {
                return Err(RemoteError::Unauthorized("invalid token".into()));
            }
        }
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn mock_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn not_found(entity: EntityKind, remote_id: &str) -> RemoteError {
    RemoteError::conflict(
        ConflictKind::NotFound,
        format!("{} {} not found", entity, remote_id),
    )
}

/// Elements strictly newer than `after`, ascending, at most `limit`.
fn delta<T: RemoteRecord>(
    mut elements: Vec<Fetched<T>>,
    after: DateTime<Utc>,
    limit: u32,
) -> Vec<Fetched<T>> {
    elements.retain(|e| {
        e.updated_at()
            .and_then(parse_timestamp)
            .map_or(false, |ts| ts > after)
    });
    elements.sort_by(|a, b| a.updated_at().cmp(&b.updated_at()));
    elements.truncate(limit as usize);
    elements
}

impl MockState {
    fn raw_elements<T: serde::de::DeserializeOwned>(&self, entity: EntityKind) -> Vec<Fetched<T>> {
        self.raw
            .iter()
            .filter(|(e, _)| *e == entity)
            .filter_map(|(_, value)| serde_json::from_value(value.clone()).ok())
            .collect()
    }
}

/// In-memory remote service.
#[derive(Default)]
pub struct MockRemote {
    state: Mutex<MockState>,
    latency: Mutex<Option<Duration>>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject calls whose bearer token differs from `token`.
    pub fn require_token(&self, token: impl Into<String>) {
        self.state.lock().token = Some(token.into());
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Make the next call of kind `op` fail with `err`. Failures queue up.
    pub fn fail_next(&self, op: MockOp, err: RemoteError) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    /// Make the next `times` calls of kind `op` fail with `err`.
    pub fn fail_times(&self, op: MockOp, times: usize, err: RemoteError) {
        for _ in 0..times {
            self.fail_next(op, err.clone());
        }
    }

    /// Every call received so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().calls.clone()
    }

    /// Number of calls of kind `op`.
    pub fn call_count(&self, op: MockOp) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .count()
    }

    // =========================================================================
    // Server-side view and edits (as another client would make them)
    // =========================================================================

    pub fn patient(&self, remote_id: &str) -> Option<RemotePatient> {
        self.state
            .lock()
            .patients
            .get(remote_id)
            .map(|r| to_remote_patient(remote_id, r))
    }

    /// Live (not deleted) patients.
    pub fn patients(&self) -> Vec<RemotePatient> {
        self.state
            .lock()
            .patients
            .iter()
            .filter(|(_, r)| r.deleted_at.is_none())
            .map(|(id, r)| to_remote_patient(id, r))
            .collect()
    }

    pub fn appointment(&self, remote_id: &str) -> Option<RemoteAppointment> {
        self.state
            .lock()
            .appointments
            .get(remote_id)
            .map(|r| to_remote_appointment(remote_id, r))
    }

    /// Live (not deleted) appointments.
    pub fn appointments(&self) -> Vec<RemoteAppointment> {
        self.state
            .lock()
            .appointments
            .iter()
            .filter(|(_, r)| r.deleted_at.is_none())
            .map(|(id, r)| to_remote_appointment(id, r))
            .collect()
    }

    pub fn server_create_patient(&self, fields: PatientFields) -> String {
        let mut state = self.state.lock();
        let id = state.next_id("P");
        let updated_at = state.stamp();
        state.patients.insert(
            id.clone(),
            Stored {
                body: fields,
                updated_at,
                deleted_at: None,
            },
        );
        id
    }

    pub fn server_update_patient(&self, remote_id: &str, fields: PatientFields) -> bool {
        let mut state = self.state.lock();
        let updated_at = state.stamp();
        match state.patients.get_mut(remote_id) {
            Some(record) => {
                record.body = fields;
                record.updated_at = updated_at;
                true
            }
            None => false,
        }
    }

    pub fn server_delete_patient(&self, remote_id: &str) -> bool {
        let mut state = self.state.lock();
        let at = state.stamp();
        match state.patients.get_mut(remote_id) {
            Some(record) => {
                record.deleted_at = Some(at.clone());
                record.updated_at = at;
                true
            }
            None => false,
        }
    }

    pub fn server_create_appointment(
        &self,
        patient_id: &str,
        fields: AppointmentFields,
    ) -> String {
        let mut state = self.state.lock();
        let id = state.next_id("A");
        let updated_at = state.stamp();
        state.appointments.insert(
            id.clone(),
            Stored {
                body: AppointmentBody {
                    patient_id: patient_id.to_string(),
                    fields,
                },
                updated_at,
                deleted_at: None,
            },
        );
        id
    }

    pub fn server_update_appointment(&self, remote_id: &str, fields: AppointmentFields) -> bool {
        let mut state = self.state.lock();
        let updated_at = state.stamp();
        match state.appointments.get_mut(remote_id) {
            Some(record) => {
                record.body.fields = fields;
                record.updated_at = updated_at;
                true
            }
            None => false,
        }
    }

    /// Serve `record` in delta pages as-is, with a fresh ID and `updatedAt`.
    ///
    /// Lets a test model records this client cannot decode or store.
    pub fn server_insert_raw(&self, entity: EntityKind, mut record: Value) -> String {
        let mut state = self.state.lock();
        let id = state.next_id("X");
        let updated_at = state.stamp();
        if let Some(fields) = record.as_object_mut() {
            fields.insert("id".into(), Value::from(id.clone()));
            fields.insert("updatedAt".into(), Value::from(updated_at));
        }
        state.raw.push((entity, record));
        id
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

fn to_remote_patient(id: &str, record: &Stored<PatientFields>) -> RemotePatient {
    RemotePatient {
        id: id.to_string(),
        fields: record.body.clone(),
        updated_at: record.updated_at.clone(),
        deleted_at: record.deleted_at.clone(),
    }
}

fn to_remote_appointment(id: &str, record: &Stored<AppointmentBody>) -> RemoteAppointment {
    RemoteAppointment {
        id: id.to_string(),
        patient_id: record.body.patient_id.clone(),
        fields: record.body.fields.clone(),
        updated_at: record.updated_at.clone(),
        deleted_at: record.deleted_at.clone(),
    }
}

#[async_trait]
impl RemoteApi for MockRemote {
    async fn create_patient(
        &self,
        token: &str,
        fields: &PatientFields,
    ) -> Result<String, RemoteError> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin(MockOp::Create, EntityKind::Patient, None, token)?;
        let id = state.next_id("P");
        let updated_at = state.stamp();
        state.patients.insert(
            id.clone(),
            Stored {
                body: fields.clone(),
                updated_at,
                deleted_at: None,
            },
        );
        Ok(id)
    }

    async fn update_patient(
        &self,
        token: &str,
        remote_id: &str,
        fields: &PatientFields,
    ) -> Result<(), RemoteError> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin(MockOp::Update, EntityKind::Patient, Some(remote_id), token)?;
        let updated_at = state.stamp();
        match state.patients.get_mut(remote_id) {
            Some(record) if record.deleted_at.is_none() => {
                record.body = fields.clone();
                record.updated_at = updated_at;
                Ok(())
            }
            _ => Err(not_found(EntityKind::Patient, remote_id)),
        }
    }

    async fn create_appointment(
        &self,
        token: &str,
        body: &AppointmentBody,
    ) -> Result<String, RemoteError> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin(MockOp::Create, EntityKind::Appointment, None, token)?;
        let patient_known = state
            .patients
            .get(&body.patient_id)
            .map_or(false, |p| p.deleted_at.is_none());
        if !patient_known {
            return Err(RemoteError::Permanent(format!(
                "unknown patient {}",
                body.patient_id
            )));
        }
        let id = state.next_id("A");
        let updated_at = state.stamp();
        state.appointments.insert(
            id.clone(),
            Stored {
                body: body.clone(),
                updated_at,
                deleted_at: None,
            },
        );
        Ok(id)
    }

    async fn update_appointment(
        &self,
        token: &str,
        remote_id: &str,
        body: &AppointmentBody,
    ) -> Result<(), RemoteError> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin(MockOp::Update, EntityKind::Appointment, Some(remote_id), token)?;
        let updated_at = state.stamp();
        match state.appointments.get_mut(remote_id) {
            Some(record) if record.deleted_at.is_none() => {
                record.body = body.clone();
                record.updated_at = updated_at;
                Ok(())
            }
            _ => Err(not_found(EntityKind::Appointment, remote_id)),
        }
    }

    async fn delete(
        &self,
        token: &str,
        entity: EntityKind,
        remote_id: &str,
    ) -> Result<(), RemoteError> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin(MockOp::Delete, entity, Some(remote_id), token)?;
        let at = state.stamp();
        let deleted_at = match entity {
            EntityKind::Patient => state
                .patients
                .get_mut(remote_id)
                .map(|r| (&mut r.deleted_at, &mut r.updated_at)),
            EntityKind::Appointment => state
                .appointments
                .get_mut(remote_id)
                .map(|r| (&mut r.deleted_at, &mut r.updated_at)),
        };
        match deleted_at {
            Some((deleted_at, updated_at)) if deleted_at.is_none() => {
                *deleted_at = Some(at.clone());
                *updated_at = at;
                Ok(())
            }
            _ => Err(not_found(entity, remote_id)),
        }
    }

    async fn fetch_patients(
        &self,
        token: &str,
        updated_after: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Fetched<RemotePatient>>, RemoteError> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin(MockOp::Fetch, EntityKind::Patient, None, token)?;
        let mut elements: Vec<Fetched<RemotePatient>> = state
            .patients
            .iter()
            .map(|(id, r)| Fetched::Record(to_remote_patient(id, r)))
            .collect();
        elements.extend(state.raw_elements(EntityKind::Patient));
        Ok(delta(elements, updated_after, limit))
    }

    async fn fetch_appointments(
        &self,
        token: &str,
        updated_after: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Fetched<RemoteAppointment>>, RemoteError> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin(MockOp::Fetch, EntityKind::Appointment, None, token)?;
        let mut elements: Vec<Fetched<RemoteAppointment>> = state
            .appointments
            .iter()
            .map(|(id, r)| Fetched::Record(to_remote_appointment(id, r)))
            .collect();
        elements.extend(state.raw_elements(EntityKind::Appointment));
        Ok(delta(elements, updated_after, limit))
    }

    async fn fetch_patient(
        &self,
        token: &str,
        remote_id: &str,
    ) -> Result<Option<RemotePatient>, RemoteError> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin(MockOp::Fetch, EntityKind::Patient, Some(remote_id), token)?;
        Ok(state
            .patients
            .get(remote_id)
            .filter(|r| r.deleted_at.is_none())
            .map(|r| to_remote_patient(remote_id, r)))
    }

    async fn fetch_appointment(
        &self,
        token: &str,
        remote_id: &str,
    ) -> Result<Option<RemoteAppointment>, RemoteError> {
        self.simulate_latency().await;
        let mut state = self.state.lock();
        state.begin(MockOp::Fetch, EntityKind::Appointment, Some(remote_id), token)?;
        Ok(state
            .appointments
            .get(remote_id)
            .filter(|r| r.deleted_at.is_none())
            .map(|r| to_remote_appointment(remote_id, r)))
    }
}
