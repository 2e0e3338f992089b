//! Shared vocabulary for the Tidewatch workspace.
//!
//! Holds the closed sets that appear on the wire and in the event log:
//! the kinds of system events producers append, and the channels a
//! subscriber can ask for. Every other crate depends on these definitions
//! rather than on string literals.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kinds of system events recorded in the event log.
///
/// The serialized form is the snake_case label stored in the
/// `event_type` column and sent to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemEventKind {
    /// A vault was reshared to include the plugin.
    VaultReshared,
    /// A vault was deleted.
    VaultDeleted,
    /// A plugin policy was created.
    PolicyCreated,
    /// A plugin policy was deleted.
    PolicyDeleted,
}

impl SystemEventKind {
    /// Returns the canonical string label for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::VaultReshared => "vault_reshared",
            Self::VaultDeleted => "vault_deleted",
            Self::PolicyCreated => "policy_created",
            Self::PolicyDeleted => "policy_deleted",
        }
    }
}

impl std::fmt::Display for SystemEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SystemEventKind {
    type Err = ParseSystemEventKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vault_reshared" => Ok(Self::VaultReshared),
            "vault_deleted" => Ok(Self::VaultDeleted),
            "policy_created" => Ok(Self::PolicyCreated),
            "policy_deleted" => Ok(Self::PolicyDeleted),
            _ => Err(ParseSystemEventKindError(s.to_string())),
        }
    }
}

/// Error returned when parsing an unknown system event kind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown system event kind: {0}")]
pub struct ParseSystemEventKindError(pub String);

/// The `event_type` label of a stored event.
///
/// Producers built against a newer vocabulary may log kinds this build does
/// not know. Those rows keep their raw label and are forwarded as-is, so one
/// unfamiliar row never blocks the events behind it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Known(SystemEventKind),
    Unrecognized(String),
}

impl EventKind {
    /// Classifies a stored label.
    pub fn from_label(label: String) -> Self {
        match label.parse() {
            Ok(kind) => Self::Known(kind),
            Err(_) => Self::Unrecognized(label),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Known(kind) => kind.as_str(),
            Self::Unrecognized(label) => label,
        }
    }

    /// The known kind, if this build recognizes the label.
    pub fn known(&self) -> Option<SystemEventKind> {
        match self {
            Self::Known(kind) => Some(*kind),
            Self::Unrecognized(_) => None,
        }
    }
}

impl From<SystemEventKind> for EventKind {
    fn from(kind: SystemEventKind) -> Self {
        Self::Known(kind)
    }
}

impl PartialEq<SystemEventKind> for EventKind {
    fn eq(&self, other: &SystemEventKind) -> bool {
        self.known() == Some(*other)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Channels a subscriber can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Every event appended to the system event log.
    SystemEvents,
}

impl Channel {
    /// Returns the channel name as it appears on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SystemEvents => "system_events",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Channel {
    type Err = ParseChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system_events" => Ok(Self::SystemEvents),
            _ => Err(ParseChannelError(s.to_string())),
        }
    }
}

/// Error returned when a subscriber names a channel that does not exist.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown channel: {0}")]
pub struct ParseChannelError(pub String);
