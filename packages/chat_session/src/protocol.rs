//! Chat wire protocol
//!
//! One JSON object per WebSocket text frame, discriminated by its `type` field.
//! Frames are decoded once at the boundary into [`ChatEvent`]; nothing
//! downstream looks at raw JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DecodeError, EncodeError};

/// `type` values understood by [`decode`].
const KNOWN_TYPES: &[&str] = &["username", "chat", "system", "userlist", "delete", "image", "file"];

/// A single protocol frame, in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChatEvent {
    /// Handshake: the client names itself right after the socket opens.
    #[serde(rename = "username")]
    UsernameAnnounce { username: String },

    #[serde(rename = "chat")]
    ChatPosted { username: String, content: String },

    #[serde(rename = "system")]
    SystemNotice { content: String },

    /// Full replacement of the online-user list. On the wire the names travel
    /// comma-joined in `content`.
    #[serde(rename = "userlist")]
    UserListReplace {
        #[serde(rename = "content", with = "comma_list")]
        usernames: Vec<String>,
    },

    #[serde(rename = "delete")]
    DeleteRequest { username: String, content: String },

    #[serde(rename = "image")]
    ImagePosted {
        username: String,
        #[serde(default)]
        content: String,
        #[serde(rename = "imageData")]
        image_data: String,
    },

    #[serde(rename = "file")]
    FilePosted {
        username: String,
        #[serde(default)]
        content: String,
        filename: String,
        #[serde(rename = "fileData")]
        file_data: String,
    },
}

impl ChatEvent {
    /// The wire `type` tag of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UsernameAnnounce { .. } => "username",
            Self::ChatPosted { .. } => "chat",
            Self::SystemNotice { .. } => "system",
            Self::UserListReplace { .. } => "userlist",
            Self::DeleteRequest { .. } => "delete",
            Self::ImagePosted { .. } => "image",
            Self::FilePosted { .. } => "file",
        }
    }
}

/// Serialize an event into the text of one frame.
pub fn encode(event: &ChatEvent) -> Result<String, EncodeError> {
    Ok(serde_json::to_string(event)?)
}

/// Parse one inbound frame.
///
/// Unknown fields are ignored; the server fills every field of its message
/// struct even when a variant does not use it.
pub fn decode(frame: &[u8]) -> Result<ChatEvent, DecodeError> {
    let value: Value =
        serde_json::from_slice(frame).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let Some(object) = value.as_object() else {
        return Err(DecodeError::Malformed("frame is not a JSON object".into()));
    };
    let tag = match object.get("type") {
        None | Some(Value::Null) => return Err(DecodeError::MissingType),
        Some(Value::String(tag)) => tag.clone(),
        Some(other) => {
            return Err(DecodeError::Malformed(format!(
                "type field is not a string: {other}"
            )));
        }
    };
    if !KNOWN_TYPES.contains(&tag.as_str()) {
        return Err(DecodeError::UnknownType(tag));
    }

    serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))
}

/// Split a comma-joined user list. Empty segments are dropped.
pub fn split_usernames(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(String::from)
        .collect()
}

mod comma_list {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(names: &[String], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&names.join(","))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(super::split_usernames(&raw))
    }
}
