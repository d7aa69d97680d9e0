//! Envelope and payload types.
//!
//! DESIGN
//! ======
//! The envelope keeps `data` as a raw `serde_json::Value` so an unknown or
//! damaged payload never prevents reading the header fields (session id and
//! message id) that echo filtering depends on. Payloads are decoded into the
//! typed [`Message`] only after the echo check passes.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::Field;

// =============================================================================
// MESSAGE TYPES
// =============================================================================

/// Kind of edit carried by an envelope. Each kind has its own send destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    NodePositionUpdate,
    FieldUpdate,
    TogglePrimaryKey,
    ToggleForeignKey,
    AddAttribute,
    DeleteAttribute,
    ForeignKeyConnect,
    ForeignKeyDisconnect,
    AddModel,
    UpdateModelName,
    DeleteModel,
    Error,
}

impl MessageType {
    /// Destination suffix appended to the configured send prefix.
    #[must_use]
    pub fn destination(self) -> &'static str {
        match self {
            Self::NodePositionUpdate => "node-position",
            Self::FieldUpdate => "field-update",
            Self::TogglePrimaryKey => "toggle-primary-key",
            Self::ToggleForeignKey => "toggle-foreign-key",
            Self::AddAttribute => "add-attribute",
            Self::DeleteAttribute => "delete-attribute",
            Self::ForeignKeyConnect => "foreign-key-connect",
            Self::ForeignKeyDisconnect => "foreign-key-disconnect",
            Self::AddModel => "add-model",
            Self::UpdateModelName => "update-model-name",
            Self::DeleteModel => "delete-model",
            Self::Error => "error",
        }
    }

    /// Full send destination under `prefix`.
    #[must_use]
    pub fn destination_under(self, prefix: &str) -> String {
        format!("{}/{}", prefix.trim_end_matches('/'), self.destination())
    }
}

// =============================================================================
// ENVELOPE
// =============================================================================

/// Wire envelope shared by every message on the broadcast topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
}

/// Error decoding an envelope or its payload.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed {kind:?} payload: {source}")]
    Payload {
        kind: MessageType,
        #[source]
        source: serde_json::Error,
    },
}

impl Envelope {
    /// Decode an envelope from its JSON text form.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Json`] for invalid JSON or unknown message types.
    pub fn from_json(raw: &str) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Encode to JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Json`] if the payload cannot be serialized.
    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode the typed payload.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Payload`] when `data` does not match `kind`.
    pub fn message(&self) -> Result<Message, EnvelopeError> {
        Message::from_parts(self.kind, self.data.clone())
    }

    /// True when this is an `ADD_ATTRIBUTE` carrying an authoritative id.
    #[must_use]
    pub fn is_attribute_confirmation(&self) -> bool {
        self.kind == MessageType::AddAttribute
            && self.data.get("realAttributeId").is_some_and(|v| !v.is_null())
    }
}

/// Current time as milliseconds since Unix epoch.
pub(crate) fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

// =============================================================================
// PAYLOADS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePosition {
    #[serde(default)]
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<i64>,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldUpdate {
    #[serde(default)]
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<i64>,
    pub attribute_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrimaryKeyToggle {
    #[serde(default)]
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<i64>,
    pub attribute_id: i64,
    pub is_primary_key: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKeyToggle {
    #[serde(default)]
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<i64>,
    pub attribute_id: i64,
    pub is_foreign_key: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddAttribute {
    #[serde(default)]
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<i64>,
    /// Placeholder id assigned by the originating client.
    pub attribute_id: i64,
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub ordinal: usize,
    /// Authoritative id, present once the server has stored the field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub real_attribute_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteAttribute {
    #[serde(default)]
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<i64>,
    pub attribute_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKeyConnect {
    #[serde(default)]
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<i64>,
    pub attribute_id: i64,
    pub target_model_name: String,
    pub target_attribute_id: i64,
    pub foreign_key_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default)]
    pub animated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKeyDisconnect {
    #[serde(default)]
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<i64>,
    pub attribute_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddModel {
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<i64>,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateModelName {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<i64>,
    pub old_name: String,
    pub new_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteModel {
    #[serde(default)]
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<i64>,
}

/// Broker-side failure report delivered on the private error queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorNotice {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

// =============================================================================
// TYPED MESSAGE
// =============================================================================

/// Typed view of an envelope payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    NodePosition(NodePosition),
    FieldUpdate(FieldUpdate),
    TogglePrimaryKey(PrimaryKeyToggle),
    ToggleForeignKey(ForeignKeyToggle),
    AddAttribute(AddAttribute),
    DeleteAttribute(DeleteAttribute),
    ForeignKeyConnect(ForeignKeyConnect),
    ForeignKeyDisconnect(ForeignKeyDisconnect),
    AddModel(AddModel),
    UpdateModelName(UpdateModelName),
    DeleteModel(DeleteModel),
    Error(ErrorNotice),
}

impl Message {
    #[must_use]
    pub fn kind(&self) -> MessageType {
        match self {
            Self::NodePosition(_) => MessageType::NodePositionUpdate,
            Self::FieldUpdate(_) => MessageType::FieldUpdate,
            Self::TogglePrimaryKey(_) => MessageType::TogglePrimaryKey,
            Self::ToggleForeignKey(_) => MessageType::ToggleForeignKey,
            Self::AddAttribute(_) => MessageType::AddAttribute,
            Self::DeleteAttribute(_) => MessageType::DeleteAttribute,
            Self::ForeignKeyConnect(_) => MessageType::ForeignKeyConnect,
            Self::ForeignKeyDisconnect(_) => MessageType::ForeignKeyDisconnect,
            Self::AddModel(_) => MessageType::AddModel,
            Self::UpdateModelName(_) => MessageType::UpdateModelName,
            Self::DeleteModel(_) => MessageType::DeleteModel,
            Self::Error(_) => MessageType::Error,
        }
    }

    /// Serialize the payload alone.
    ///
    /// # Errors
    ///
    /// Returns a serde error if a payload value cannot be represented in JSON.
    pub fn to_data(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::NodePosition(p) => serde_json::to_value(p),
            Self::FieldUpdate(p) => serde_json::to_value(p),
            Self::TogglePrimaryKey(p) => serde_json::to_value(p),
            Self::ToggleForeignKey(p) => serde_json::to_value(p),
            Self::AddAttribute(p) => serde_json::to_value(p),
            Self::DeleteAttribute(p) => serde_json::to_value(p),
            Self::ForeignKeyConnect(p) => serde_json::to_value(p),
            Self::ForeignKeyDisconnect(p) => serde_json::to_value(p),
            Self::AddModel(p) => serde_json::to_value(p),
            Self::UpdateModelName(p) => serde_json::to_value(p),
            Self::DeleteModel(p) => serde_json::to_value(p),
            Self::Error(p) => serde_json::to_value(p),
        }
    }

    /// Decode a payload for the given kind.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Payload`] when `data` does not fit the kind.
    pub fn from_parts(kind: MessageType, data: Value) -> Result<Self, EnvelopeError> {
        let wrap = |source: serde_json::Error| EnvelopeError::Payload { kind, source };
        let message = match kind {
            MessageType::NodePositionUpdate => Self::NodePosition(serde_json::from_value(data).map_err(wrap)?),
            MessageType::FieldUpdate => Self::FieldUpdate(serde_json::from_value(data).map_err(wrap)?),
            MessageType::TogglePrimaryKey => Self::TogglePrimaryKey(serde_json::from_value(data).map_err(wrap)?),
            MessageType::ToggleForeignKey => Self::ToggleForeignKey(serde_json::from_value(data).map_err(wrap)?),
            MessageType::AddAttribute => Self::AddAttribute(serde_json::from_value(data).map_err(wrap)?),
            MessageType::DeleteAttribute => Self::DeleteAttribute(serde_json::from_value(data).map_err(wrap)?),
            MessageType::ForeignKeyConnect => Self::ForeignKeyConnect(serde_json::from_value(data).map_err(wrap)?),
            MessageType::ForeignKeyDisconnect => {
                Self::ForeignKeyDisconnect(serde_json::from_value(data).map_err(wrap)?)
            }
            MessageType::AddModel => Self::AddModel(serde_json::from_value(data).map_err(wrap)?),
            MessageType::UpdateModelName => Self::UpdateModelName(serde_json::from_value(data).map_err(wrap)?),
            MessageType::DeleteModel => Self::DeleteModel(serde_json::from_value(data).map_err(wrap)?),
            MessageType::Error => Self::Error(serde_json::from_value(data).map_err(wrap)?),
        };
        Ok(message)
    }
}

#[cfg(test)]
#[path = "envelope_test.rs"]
mod tests;
