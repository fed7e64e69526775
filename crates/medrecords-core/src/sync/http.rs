//! HTTP implementation of [`RemoteApi`] on top of reqwest.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use super::remote::{
    AppointmentBody, Created, Fetched, RemoteApi, RemoteAppointment, RemotePatient,
};
use super::{ConflictKind, RemoteError, SyncConfig};
use crate::models::{format_timestamp, EntityKind, PatientFields};

/// REST client for the records service.
pub struct HttpRemote {
    client: Client,
    base_url: String,
}

impl HttpRemote {
    /// Build a client using the configured base URL and request timeout.
    pub fn new(config: &SyncConfig) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| RemoteError::Protocol(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn collection_url(&self, entity: EntityKind) -> String {
        format!("{}/{}", self.base_url, entity.resource())
    }

    fn record_url(&self, entity: EntityKind, remote_id: &str) -> String {
        format!("{}/{}/{}", self.base_url, entity.resource(), remote_id)
    }

    async fn send(&self, request: RequestBuilder, token: &str) -> Result<Response, RemoteError> {
        let response = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, body))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        token: &str,
    ) -> Result<T, RemoteError> {
        self.send(request, token)
            .await?
            .json::<T>()
            .await
            .map_err(|e| RemoteError::Protocol(format!("invalid response body: {}", e)))
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        entity: EntityKind,
        token: &str,
        updated_after: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<T>, RemoteError> {
        let request = self.client.get(self.collection_url(entity)).query(&[
            ("updatedAfter", format_timestamp(updated_after)),
            ("limit", limit.to_string()),
        ]);
        self.send_json(request, token).await
    }

    async fn fetch_one<T: DeserializeOwned>(
        &self,
        entity: EntityKind,
        token: &str,
        remote_id: &str,
    ) -> Result<Option<T>, RemoteError> {
        let request = self.client.get(self.record_url(entity, remote_id));
        match self.send_json(request, token).await {
            Ok(record) => Ok(Some(record)),
            Err(err) if err.conflict_kind() == Some(ConflictKind::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn create_patient(
        &self,
        token: &str,
        fields: &PatientFields,
    ) -> Result<String, RemoteError> {
        let request = self
            .client
            .post(self.collection_url(EntityKind::Patient))
            .json(fields);
        let created: Created = self.send_json(request, token).await?;
        Ok(created.id)
    }

    async fn update_patient(
        &self,
        token: &str,
        remote_id: &str,
        fields: &PatientFields,
    ) -> Result<(), RemoteError> {
        let request = self
            .client
            .put(self.record_url(EntityKind::Patient, remote_id))
            .json(fields);
        self.send(request, token).await?;
        Ok(())
    }

    async fn create_appointment(
        &self,
        token: &str,
        body: &AppointmentBody,
    ) -> Result<String, RemoteError> {
        let request = self
            .client
            .post(self.collection_url(EntityKind::Appointment))
            .json(body);
        let created: Created = self.send_json(request, token).await?;
        Ok(created.id)
    }

    async fn update_appointment(
        &self,
        token: &str,
        remote_id: &str,
        body: &AppointmentBody,
    ) -> Result<(), RemoteError> {
        let request = self
            .client
            .put(self.record_url(EntityKind::Appointment, remote_id))
            .json(body);
        self.send(request, token).await?;
        Ok(())
    }

    async fn delete(
        &self,
        token: &str,
        entity: EntityKind,
        remote_id: &str,
    ) -> Result<(), RemoteError> {
        let request = self.client.delete(self.record_url(entity, remote_id));
        self.send(request, token).await?;
        Ok(())
    }

    async fn fetch_patients(
        &self,
        token: &str,
        updated_after: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Fetched<RemotePatient>>, RemoteError> {
        self.fetch(EntityKind::Patient, token, updated_after, limit)
            .await
    }

    async fn fetch_appointments(
        &self,
        token: &str,
        updated_after: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Fetched<RemoteAppointment>>, RemoteError> {
        self.fetch(EntityKind::Appointment, token, updated_after, limit)
            .await
    }

    async fn fetch_patient(
        &self,
        token: &str,
        remote_id: &str,
    ) -> Result<Option<RemotePatient>, RemoteError> {
        self.fetch_one(EntityKind::Patient, token, remote_id).await
    }

    async fn fetch_appointment(
        &self,
        token: &str,
        remote_id: &str,
    ) -> Result<Option<RemoteAppointment>, RemoteError> {
        self.fetch_one(EntityKind::Appointment, token, remote_id)
            .await
    }
}

/// Map a non-success HTTP status to a remote error.
pub fn classify_status(status: StatusCode, body: String) -> RemoteError {
    let message = if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body)
    };

    match status {
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
            RemoteError::conflict(ConflictKind::Stale, message)
        }
        StatusCode::NOT_FOUND | StatusCode::GONE => {
            RemoteError::conflict(ConflictKind::NotFound, message)
        }
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::Unauthorized(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            RemoteError::Transient(message)
        }
        s if s.is_server_error() => RemoteError::Transient(message),
        _ => RemoteError::Permanent(message),
    }
}

fn classify_transport(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout
    } else if err.is_decode() {
        RemoteError::Protocol(err.to_string())
    } else if err.is_builder() {
        RemoteError::Permanent(err.to_string())
    } else {
        RemoteError::Transient(err.to_string())
    }
}
