//! Job and participant model
//!
//! Jobs arrive from the room-server control plane with a JSON metadata blob.
//! Metadata parsing is strict about the dialable phone number and lenient
//! about everything else: unknown keys flow into `custom_fields` untouched
//! so tools can consume them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Job validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("invalid job metadata JSON: {0}")]
    InvalidJson(String),

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("'{0}' is not a valid E.164 phone number")]
    InvalidPhoneNumber(String),
}

/// A dispatched telephony job, immutable once received
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Job id assigned by the control plane
    pub id: String,
    /// Room the call lives in
    pub room_name: String,
    /// Parsed metadata
    pub metadata: JobMetadata,
    /// When the control plane dispatched the job
    pub dispatched_at: DateTime<Utc>,
}

/// Parsed job metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobMetadata {
    /// Number to dial (E.164)
    #[serde(default)]
    pub phone_number: String,
    /// Optional transfer target (E.164)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_to: Option<String>,
    /// Customer display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    /// Selects a stored agent configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_config_id: Option<String>,
    /// Opaque fields passed through to tools
    #[serde(default, flatten)]
    pub custom_fields: HashMap<String, serde_json::Value>,
}

impl JobMetadata {
    /// Parse and validate the raw metadata blob attached to a job
    pub fn parse(raw: &str) -> Result<Self, JobError> {
        let meta: JobMetadata =
            serde_json::from_str(raw).map_err(|e| JobError::InvalidJson(e.to_string()))?;
        meta.validate()?;
        Ok(meta)
    }

    /// Validate required fields and number formats
    pub fn validate(&self) -> Result<(), JobError> {
        if self.phone_number.is_empty() {
            return Err(JobError::MissingField("phone_number"));
        }
        if !is_e164(&self.phone_number) {
            return Err(JobError::InvalidPhoneNumber(self.phone_number.clone()));
        }
        if let Some(transfer) = &self.transfer_to {
            if !is_e164(transfer) {
                return Err(JobError::InvalidPhoneNumber(transfer.clone()));
            }
        }
        Ok(())
    }

    /// Look up a custom field as a string
    pub fn custom_str(&self, key: &str) -> Option<&str> {
        self.custom_fields.get(key).and_then(|v| v.as_str())
    }

    /// Look up a custom field as a bool
    pub fn custom_bool(&self, key: &str) -> Option<bool> {
        self.custom_fields.get(key).and_then(|v| v.as_bool())
    }
}

/// E.164: '+' followed by 2..=15 digits, first digit nonzero
pub fn is_e164(number: &str) -> bool {
    let Some(digits) = number.strip_prefix('+') else {
        return false;
    };
    (2..=15).contains(&digits.len())
        && digits.chars().all(|c| c.is_ascii_digit())
        && !digits.starts_with('0')
}

/// Participant kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantKind {
    /// The agent itself
    Local,
    /// The remote phone party joined through the SIP trunk
    SipRemote,
}

/// A participant in the call room
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    /// Room-unique identity
    pub identity: String,
    /// Kind
    pub kind: ParticipantKind,
    /// Join time
    pub joined_at: DateTime<Utc>,
}

impl Participant {
    /// Create a remote SIP participant handle
    pub fn sip_remote(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            kind: ParticipantKind::SipRemote,
            joined_at: Utc::now(),
        }
    }
}
