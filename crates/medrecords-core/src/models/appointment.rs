//! Appointment models.

use chrono::DateTime;
use serde::{Deserialize, Serialize};

use super::{now_timestamp, ValidationError};

/// Appointment lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    /// Booked, not yet happened
    #[default]
    Scheduled,
    /// Patient was seen
    Completed,
    /// Cancelled by patient or practice
    Cancelled,
    /// Patient did not show up
    NoShow,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::NoShow => "no_show",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(AppointmentStatus::Scheduled),
            "completed" => Some(AppointmentStatus::Completed),
            "cancelled" => Some(AppointmentStatus::Cancelled),
            "no_show" => Some(AppointmentStatus::NoShow),
            _ => None,
        }
    }
}

/// Domain fields of an appointment, excluding the patient reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentFields {
    /// Start time (RFC 3339)
    pub scheduled_at: String,
    /// Planned duration
    pub duration_minutes: u32,
    /// Current status
    #[serde(default)]
    pub status: AppointmentStatus,
    /// Reason for the visit
    #[serde(default)]
    pub reason: Option<String>,
    /// Additional notes
    #[serde(default)]
    pub notes: Option<String>,
}

impl AppointmentFields {
    /// Create fields for a scheduled appointment.
    pub fn scheduled(scheduled_at: impl Into<String>, duration_minutes: u32) -> Self {
        Self {
            scheduled_at: scheduled_at.into(),
            duration_minutes,
            status: AppointmentStatus::Scheduled,
            reason: None,
            notes: None,
        }
    }

    /// Validate the fields before they are written or enqueued.
    pub fn validate(&self) -> Result<(), ValidationError> {
        DateTime::parse_from_rfc3339(&self.scheduled_at)
            .map_err(|_| ValidationError::new("scheduledAt", "expected RFC 3339 timestamp"))?;
        if self.duration_minutes == 0 {
            return Err(ValidationError::new("durationMinutes", "must be positive"));
        }
        Ok(())
    }
}

/// An appointment with dual-ID support for offline-first sync.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Appointment {
    /// Local UUID - always present, generated locally
    pub local_id: String,
    /// Server ID - null until the create is acknowledged
    pub remote_id: Option<String>,
    /// Owning patient's local ID
    pub patient_local_id: String,
    /// Domain fields
    pub fields: AppointmentFields,
    /// Creation timestamp
    pub created_at: String,
    /// Last writer's timestamp
    pub updated_at: String,
    /// Soft-delete marker
    pub deleted_at: Option<String>,
}

impl Appointment {
    /// Create a new, not yet synced appointment for a patient.
    pub fn new(patient_local_id: impl Into<String>, fields: AppointmentFields) -> Self {
        let now = now_timestamp();
        Self {
            local_id: uuid::Uuid::new_v4().to_string(),
            remote_id: None,
            patient_local_id: patient_local_id.into(),
            fields,
            created_at: now.clone(),
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Check if this appointment has been acknowledged by the server.
    pub fn is_synced(&self) -> bool {
        self.remote_id.is_some()
    }
}
