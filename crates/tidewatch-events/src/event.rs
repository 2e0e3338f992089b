//! Event record types for the system event log.

use chrono::{DateTime, SubsecRound, Utc};
use tidewatch_types::{EventKind, SystemEventKind};
use uuid::Uuid;

/// A persisted system event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemEvent {
    /// Log-assigned identifier, strictly increasing with insertion order.
    pub id: i64,
    /// Vault public key the event concerns, if any.
    pub public_key: Option<String>,
    /// Policy the event concerns, if any.
    pub policy_id: Option<Uuid>,
    /// What happened, as labelled in the log.
    pub kind: EventKind,
    /// Pre-serialized JSON payload. Empty means no payload.
    pub payload: Vec<u8>,
    /// When the producer recorded the event.
    pub created_at: DateTime<Utc>,
}

/// An event about to be appended to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSystemEvent {
    pub public_key: Option<String>,
    pub policy_id: Option<Uuid>,
    pub kind: SystemEventKind,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl NewSystemEvent {
    /// Creates an event of `kind` stamped with the current time and no
    /// subject, policy or payload.
    pub fn now(kind: SystemEventKind) -> Self {
        Self::at(kind, Utc::now())
    }

    /// Creates an event of `kind` stamped with `created_at`, truncated to
    /// the microsecond precision the log stores.
    pub fn at(kind: SystemEventKind, created_at: DateTime<Utc>) -> Self {
        Self {
            public_key: None,
            policy_id: None,
            kind,
            payload: Vec::new(),
            created_at: created_at.trunc_subsecs(6),
        }
    }

    pub fn with_public_key(mut self, public_key: impl Into<String>) -> Self {
        self.public_key = Some(public_key.into());
        self
    }

    pub fn with_policy_id(mut self, policy_id: Uuid) -> Self {
        self.policy_id = Some(policy_id);
        self
    }

    /// Attaches a payload. The bytes must already be valid JSON; they are
    /// stored and forwarded as-is.
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Builds the persisted record this event becomes once the log assigns
    /// it `id`.
    pub fn into_event(self, id: i64) -> SystemEvent {
        SystemEvent {
            id,
            public_key: self.public_key,
            policy_id: self.policy_id,
            kind: self.kind.into(),
            payload: self.payload,
            created_at: self.created_at,
        }
    }
}

/// Converts a stored microsecond timestamp back into a `DateTime`.
///
/// Returns `None` when the value is outside chrono's representable range.
pub fn from_epoch_micros(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
}
