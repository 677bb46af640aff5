use serde_json::{json, Value};

use super::{generate_message_id, MessageError, Result};

/// A JSON message: `{"header": {"name", "messageId"}, "payload": {...}}`.
///
/// The serialised size is computed once at construction; the payload is
/// immutable afterwards.
#[derive(Debug, Clone)]
pub struct JsonMessage {
    name: String,
    message_id: String,
    payload: Option<Value>,
    size: usize,
}

impl JsonMessage {
    /// Creates a message with a freshly generated message id.
    pub fn new(name: &str, payload: Option<Value>) -> Self {
        Self::with_message_id(name, generate_message_id(), payload)
    }

    /// Creates a message with a caller-chosen message id.
    pub fn with_message_id(name: &str, message_id: String, payload: Option<Value>) -> Self {
        let mut msg = JsonMessage {
            name: name.to_string(),
            message_id,
            payload,
            size: 0,
        };
        msg.size = msg.to_value().to_string().len();
        msg
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    /// Serialised size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The complete enveloped document.
    pub fn to_value(&self) -> Value {
        let mut doc = json!({
            "header": {
                "name": self.name,
                "messageId": self.message_id,
            }
        });
        if let Some(payload) = &self.payload {
            doc["payload"] = payload.clone();
        }
        doc
    }

    /// Serialises the enveloped document to its wire form.
    pub fn build(&self) -> String {
        self.to_value().to_string()
    }

    /// Parses an enveloped document back into its parts.
    pub fn parse_envelope(data: &[u8]) -> Result<(String, String, Option<Value>)> {
        let doc: Value = serde_json::from_slice(data).map_err(|_| MessageError::InvalidJson)?;
        let header = doc.get("header").ok_or(MessageError::MissingField("header"))?;
        let name = header
            .get("name")
            .and_then(Value::as_str)
            .ok_or(MessageError::MissingField("name"))?
            .to_string();
        let message_id = header
            .get("messageId")
            .and_then(Value::as_str)
            .ok_or(MessageError::MissingField("messageId"))?
            .to_string();
        Ok((name, message_id, doc.get("payload").cloned()))
    }
}
