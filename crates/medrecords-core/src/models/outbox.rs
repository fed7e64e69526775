//! Outbox models: pending mutation intents awaiting delivery.

use serde::{Deserialize, Serialize};

use super::{AppointmentFields, PatientFields, ValidationError};

/// Entity types mirrored in the local store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Patient,
    Appointment,
}

impl EntityKind {
    /// All entity kinds, in the order they are pulled.
    pub const ALL: [EntityKind; 2] = [EntityKind::Patient, EntityKind::Appointment];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Patient => "patient",
            EntityKind::Appointment => "appointment",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "patient" => Some(EntityKind::Patient),
            "appointment" => Some(EntityKind::Appointment),
            _ => None,
        }
    }

    /// REST collection name (`/patients`, `/appointments`).
    pub fn resource(&self) -> &'static str {
        match self {
            EntityKind::Patient => "patients",
            EntityKind::Appointment => "appointments",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of mutation recorded in the outbox.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutboxOperation {
    Create,
    Update,
    Delete,
}

impl OutboxOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxOperation::Create => "create",
            OutboxOperation::Update => "update",
            OutboxOperation::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(OutboxOperation::Create),
            "update" => Some(OutboxOperation::Update),
            "delete" => Some(OutboxOperation::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for OutboxOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot needed to replay one mutation against the remote service.
///
/// Stored as JSON in `sync_outbox.payload`; the `op` tag selects the variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OutboxPayload {
    CreatePatient {
        local_id: String,
        fields: PatientFields,
    },
    UpdatePatient {
        local_id: String,
        remote_id: Option<String>,
        fields: PatientFields,
    },
    DeletePatient {
        local_id: String,
        remote_id: Option<String>,
    },
    CreateAppointment {
        local_id: String,
        patient_local_id: String,
        fields: AppointmentFields,
    },
    UpdateAppointment {
        local_id: String,
        remote_id: Option<String>,
        patient_local_id: String,
        fields: AppointmentFields,
    },
    DeleteAppointment {
        local_id: String,
        remote_id: Option<String>,
    },
}

impl OutboxPayload {
    pub fn entity(&self) -> EntityKind {
        match self {
            OutboxPayload::CreatePatient { .. }
            | OutboxPayload::UpdatePatient { .. }
            | OutboxPayload::DeletePatient { .. } => EntityKind::Patient,
            OutboxPayload::CreateAppointment { .. }
            | OutboxPayload::UpdateAppointment { .. }
            | OutboxPayload::DeleteAppointment { .. } => EntityKind::Appointment,
        }
    }

    pub fn operation(&self) -> OutboxOperation {
        match self {
            OutboxPayload::CreatePatient { .. } | OutboxPayload::CreateAppointment { .. } => {
                OutboxOperation::Create
            }
            OutboxPayload::UpdatePatient { .. } | OutboxPayload::UpdateAppointment { .. } => {
                OutboxOperation::Update
            }
            OutboxPayload::DeletePatient { .. } | OutboxPayload::DeleteAppointment { .. } => {
                OutboxOperation::Delete
            }
        }
    }

    pub fn local_id(&self) -> &str {
        match self {
            OutboxPayload::CreatePatient { local_id, .. }
            | OutboxPayload::UpdatePatient { local_id, .. }
            | OutboxPayload::DeletePatient { local_id, .. }
            | OutboxPayload::CreateAppointment { local_id, .. }
            | OutboxPayload::UpdateAppointment { local_id, .. }
            | OutboxPayload::DeleteAppointment { local_id, .. } => local_id,
        }
    }

    /// Remote ID captured at enqueue time, if the entity was synced then.
    pub fn remote_id(&self) -> Option<&str> {
        match self {
            OutboxPayload::CreatePatient { .. } | OutboxPayload::CreateAppointment { .. } => None,
            OutboxPayload::UpdatePatient { remote_id, .. }
            | OutboxPayload::DeletePatient { remote_id, .. }
            | OutboxPayload::UpdateAppointment { remote_id, .. }
            | OutboxPayload::DeleteAppointment { remote_id, .. } => remote_id.as_deref(),
        }
    }

    /// Owning patient for appointment writes.
    pub fn patient_local_id(&self) -> Option<&str> {
        match self {
            OutboxPayload::CreateAppointment {
                patient_local_id, ..
            }
            | OutboxPayload::UpdateAppointment {
                patient_local_id, ..
            } => Some(patient_local_id),
            _ => None,
        }
    }

    /// Validate the payload before it is enqueued.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.local_id().trim().is_empty() {
            return Err(ValidationError::new("localId", "must not be blank"));
        }
        match self {
            OutboxPayload::CreatePatient { fields, .. }
            | OutboxPayload::UpdatePatient { fields, .. } => fields.validate(),
            OutboxPayload::CreateAppointment {
                fields,
                patient_local_id,
                ..
            }
            | OutboxPayload::UpdateAppointment {
                fields,
                patient_local_id,
                ..
            } => {
                if patient_local_id.trim().is_empty() {
                    return Err(ValidationError::new("patientLocalId", "must not be blank"));
                }
                fields.validate()
            }
            OutboxPayload::DeletePatient { .. } | OutboxPayload::DeleteAppointment { .. } => Ok(()),
        }
    }
}

/// A persisted outbox entry.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    /// Unique entry ID, generated at enqueue time
    pub id: String,
    /// Typed mutation snapshot
    pub payload: OutboxPayload,
    /// Number of delivery attempts so far
    pub retry_count: u32,
    /// Time of the last delivery attempt
    pub last_attempt_at: Option<String>,
    /// Enqueue time; replay order
    pub created_at: String,
}

impl OutboxEntry {
    pub fn entity(&self) -> EntityKind {
        self.payload.entity()
    }

    pub fn operation(&self) -> OutboxOperation {
        self.payload.operation()
    }

    pub fn local_id(&self) -> &str {
        self.payload.local_id()
    }

    /// FIFO ordering key: entries sharing a key replay in creation order.
    pub fn entity_key(&self) -> (EntityKind, String) {
        (self.entity(), self.local_id().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_tagging() {
        let payload = OutboxPayload::DeletePatient {
            local_id: "L1".into(),
            remote_id: Some("R1".into()),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["op"], "delete_patient");
        assert_eq!(json["remote_id"], "R1");

        let back: OutboxPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn test_payload_accessors() {
        let payload = OutboxPayload::UpdateAppointment {
            local_id: "A1".into(),
            remote_id: None,
            patient_local_id: "P1".into(),
            fields: AppointmentFields::scheduled("2024-03-01T09:00:00Z", 20),
        };
        assert_eq!(payload.entity(), EntityKind::Appointment);
        assert_eq!(payload.operation(), OutboxOperation::Update);
        assert_eq!(payload.local_id(), "A1");
        assert_eq!(payload.remote_id(), None);
        assert_eq!(payload.patient_local_id(), Some("P1"));
    }

    #[test]
    fn test_validate_rejects_bad_fields() {
        let payload = OutboxPayload::CreatePatient {
            local_id: "L1".into(),
            fields: PatientFields::named(""),
        };
        assert!(payload.validate().is_err());

        let payload = OutboxPayload::CreateAppointment {
            local_id: "A1".into(),
            patient_local_id: " ".into(),
            fields: AppointmentFields::scheduled("2024-03-01T09:00:00Z", 20),
        };
        assert_eq!(payload.validate().unwrap_err().field, "patientLocalId");
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let result: Result<OutboxPayload, _> =
            serde_json::from_str(r#"{"op":"merge_patient","local_id":"L1"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_entity_kind_names() {
        assert_eq!(EntityKind::parse("patient"), Some(EntityKind::Patient));
        assert_eq!(EntityKind::Appointment.resource(), "appointments");
        assert_eq!(EntityKind::parse("invoice"), None);
        assert_eq!(OutboxOperation::parse("delete"), Some(OutboxOperation::Delete));
    }
}
