//! Remote REST service port and its wire types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use super::RemoteError;
use crate::models::{AppointmentFields, EntityKind, PatientFields};

/// Patient as served by `GET /patients`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemotePatient {
    pub id: String,
    #[serde(flatten)]
    pub fields: PatientFields,
    pub updated_at: String,
    #[serde(default)]
    pub deleted_at: Option<String>,
}

/// Appointment as served by `GET /appointments`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAppointment {
    pub id: String,
    /// Remote ID of the owning patient
    pub patient_id: String,
    #[serde(flatten)]
    pub fields: AppointmentFields,
    pub updated_at: String,
    #[serde(default)]
    pub deleted_at: Option<String>,
}

/// Accessors shared by the records of a delta page.
pub trait RemoteRecord {
    fn remote_id(&self) -> &str;
    fn updated_at(&self) -> &str;
}

impl RemoteRecord for RemotePatient {
    fn remote_id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> &str {
        &self.updated_at
    }
}

impl RemoteRecord for RemoteAppointment {
    fn remote_id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> &str {
        &self.updated_at
    }
}

/// One element of a delta page.
///
/// An element this client cannot decode (an unknown status, a missing field)
/// does not fail the whole page; it is kept as `Malformed` with whatever
/// identifies it so the cursor can move past it.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched<T> {
    Record(T),
    Malformed {
        id: Option<String>,
        updated_at: Option<String>,
        reason: String,
    },
}

impl<T: RemoteRecord> Fetched<T> {
    pub fn updated_at(&self) -> Option<&str> {
        match self {
            Fetched::Record(record) => Some(record.updated_at()),
            Fetched::Malformed { updated_at, .. } => updated_at.as_deref(),
        }
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for Fetched<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match T::deserialize(&value) {
            Ok(record) => Ok(Fetched::Record(record)),
            Err(err) => {
                let text = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);
                Ok(Fetched::Malformed {
                    id: text("id"),
                    updated_at: text("updatedAt"),
                    reason: err.to_string(),
                })
            }
        }
    }
}

/// Request body for appointment writes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentBody {
    pub patient_id: String,
    #[serde(flatten)]
    pub fields: AppointmentFields,
}

/// Response to a successful `POST`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Created {
    pub id: String,
}

/// The remote REST service.
///
/// Every call takes the bearer token obtained for the current cycle.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// `POST /patients`, returning the server ID.
    async fn create_patient(&self, token: &str, fields: &PatientFields)
        -> Result<String, RemoteError>;

    /// `PUT /patients/{id}`.
    async fn update_patient(
        &self,
        token: &str,
        remote_id: &str,
        fields: &PatientFields,
    ) -> Result<(), RemoteError>;

    /// `POST /appointments`, returning the server ID.
    async fn create_appointment(
        &self,
        token: &str,
        body: &AppointmentBody,
    ) -> Result<String, RemoteError>;

    /// `PUT /appointments/{id}`.
    async fn update_appointment(
        &self,
        token: &str,
        remote_id: &str,
        body: &AppointmentBody,
    ) -> Result<(), RemoteError>;

    /// `DELETE /<entity>/{id}`.
    async fn delete(&self, token: &str, entity: EntityKind, remote_id: &str)
        -> Result<(), RemoteError>;

    /// `GET /patients?updatedAfter=..&limit=..`, ascending by `updatedAt`.
    async fn fetch_patients(
        &self,
        token: &str,
        updated_after: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Fetched<RemotePatient>>, RemoteError>;

    /// `GET /appointments?updatedAfter=..&limit=..`, ascending by `updatedAt`.
    async fn fetch_appointments(
        &self,
        token: &str,
        updated_after: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Fetched<RemoteAppointment>>, RemoteError>;

    /// `GET /patients/{id}`; `None` once the server no longer has it.
    async fn fetch_patient(
        &self,
        token: &str,
        remote_id: &str,
    ) -> Result<Option<RemotePatient>, RemoteError>;

    /// `GET /appointments/{id}`; `None` once the server no longer has it.
    async fn fetch_appointment(
        &self,
        token: &str,
        remote_id: &str,
    ) -> Result<Option<RemoteAppointment>, RemoteError>;
}
