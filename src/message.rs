//! Inbound event types.
//!
//! These are created by the messaging client when an event is delivered,
//! consumed by the session, and dropped after rendering.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message published on a channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique message id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Event name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Server timestamp in epoch milliseconds.
    #[serde(default)]
    pub timestamp: i64,
    /// Publisher's client id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Publisher's connection id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    /// Payload, still in its transport encoding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Encoding tag, e.g. `base64`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    /// Opaque metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<Value>,
}

impl Message {
    /// Convenience constructor for a named text message.
    pub fn new(name: impl Into<String>, data: impl Into<Value>) -> Self {
        Self {
            name: Some(name.into()),
            data: Some(data.into()),
            ..Self::default()
        }
    }

    /// Event name, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Extras, unless absent, `null` or an empty object.
    pub fn non_empty_extras(&self) -> Option<&Value> {
        self.extras.as_ref().filter(|extras| match extras {
            Value::Null => false,
            Value::Object(map) => !map.is_empty(),
            _ => true,
        })
    }
}

/// Presence action reported for a member.
///
/// Serialized as the service's numeric action code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresenceAction {
    /// Member is not present (sync only).
    Absent,
    /// Member was already present (sync).
    #[default]
    Present,
    /// Member entered.
    Enter,
    /// Member left.
    Leave,
    /// Member updated its data.
    Update,
    /// Action code this client does not know, kept as sent.
    Unknown(u8),
}

impl PresenceAction {
    /// Maps a wire action code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Absent),
            1 => Some(Self::Present),
            2 => Some(Self::Enter),
            3 => Some(Self::Leave),
            4 => Some(Self::Update),
            _ => None,
        }
    }

    /// Wire action code.
    pub fn code(self) -> u8 {
        match self {
            Self::Absent => 0,
            Self::Present => 1,
            Self::Enter => 2,
            Self::Leave => 3,
            Self::Update => 4,
            Self::Unknown(code) => code,
        }
    }

    /// Lowercase name used in output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Absent => "absent",
            Self::Present => "present",
            Self::Enter => "enter",
            Self::Leave => "leave",
            Self::Update => "update",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl std::fmt::Display for PresenceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for PresenceAction {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for PresenceAction {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        Ok(Self::from_code(code).unwrap_or(Self::Unknown(code)))
    }
}

/// A presence update on a channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMessage {
    /// What happened to the member.
    #[serde(default)]
    pub action: PresenceAction,
    /// Unique presence message id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Server timestamp in epoch milliseconds.
    #[serde(default)]
    pub timestamp: i64,
    /// Member's client id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Member's connection id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    /// Member data, still in its transport encoding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Encoding tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}
