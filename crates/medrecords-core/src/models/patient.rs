//! Patient models.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::{now_timestamp, ValidationError};

/// Domain fields of a patient, as exchanged with the remote service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PatientFields {
    /// Full name
    pub name: String,
    /// Date of birth (YYYY-MM-DD)
    #[serde(default)]
    pub date_of_birth: Option<String>,
    /// Sex as recorded by the practice
    #[serde(default)]
    pub sex: Option<String>,
    /// Contact phone number
    #[serde(default)]
    pub phone: Option<String>,
    /// Contact email
    #[serde(default)]
    pub email: Option<String>,
    /// Free-form clinical notes
    #[serde(default)]
    pub notes: Option<String>,
}

impl PatientFields {
    /// Create fields with only a name set.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Validate the fields before they are written or enqueued.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::new("name", "must not be blank"));
        }
        if let Some(dob) = &self.date_of_birth {
            NaiveDate::parse_from_str(dob, "%Y-%m-%d")
                .map_err(|_| ValidationError::new("dateOfBirth", "expected YYYY-MM-DD"))?;
        }
        if let Some(email) = &self.email {
            if !email.contains('@') {
                return Err(ValidationError::new("email", "missing '@'"));
            }
        }
        Ok(())
    }
}

/// A patient record with dual-ID support for offline-first sync.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Patient {
    /// Local UUID - always present, generated locally
    pub local_id: String,
    /// Server ID - null until the create is acknowledged
    pub remote_id: Option<String>,
    /// Domain fields
    pub fields: PatientFields,
    /// Creation timestamp
    pub created_at: String,
    /// Last writer's timestamp (client on local edit, server on pull)
    pub updated_at: String,
    /// Soft-delete marker
    pub deleted_at: Option<String>,
}

impl Patient {
    /// Create a new, not yet synced patient.
    pub fn new(fields: PatientFields) -> Self {
        let now = now_timestamp();
        Self {
            local_id: uuid::Uuid::new_v4().to_string(),
            remote_id: None,
            fields,
            created_at: now.clone(),
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Check if this patient has been acknowledged by the server.
    pub fn is_synced(&self) -> bool {
        self.remote_id.is_some()
    }

    /// Check if this patient carries a soft-delete marker.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}
