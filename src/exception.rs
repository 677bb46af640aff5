//! Cross-cutting error surface: `ExceptionEncountered` events and the
//! inbound `Exception` directive.
//!
//! Malformed messages and internal errors are reported to the service
//! and recovered locally; they never tear the connection down on their
//! own.

use serde_json::{json, Value};

use crate::events;
use crate::message::{JsonMessage, Message};
use crate::topic::Topic;

/// Codes carried in an `ExceptionEncountered` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    /// A message failed to parse or was structurally invalid.
    MalformedMessage,
    /// A device-side failure such as resource exhaustion.
    InternalError,
}

impl ExceptionCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExceptionCode::MalformedMessage => "MALFORMED_MESSAGE",
            ExceptionCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// Emits `ExceptionEncountered` events and surfaces service-detected
/// errors arriving as `Exception` directives.
pub struct ExceptionManager {
    emit_event: Box<dyn Fn(Message) -> bool + Send + Sync>,
    on_service_exception: Option<Box<dyn Fn(&str) + Send + Sync>>,
}

impl ExceptionManager {
    pub fn new(emit_event: impl Fn(Message) -> bool + Send + Sync + 'static) -> Self {
        ExceptionManager {
            emit_event: Box::new(emit_event),
            on_service_exception: None,
        }
    }

    /// Registers an observer for service-detected errors.
    pub fn set_service_exception_observer(&mut self, observer: impl Fn(&str) + Send + Sync + 'static) {
        self.on_service_exception = Some(Box::new(observer));
    }

    /// Reports a malformed inbound message, quoting where it came from.
    pub fn emit_malformed_message(&self, topic: Topic, sequence_number: u32, index: usize) {
        log::error!(
            "Malformed message, topic={topic}, sequenceNumber={sequence_number}, index={index}"
        );
        let event = JsonMessage::new(
            events::EXCEPTION_ENCOUNTERED,
            Some(json!({
                "code": ExceptionCode::MalformedMessage.as_str(),
                "message": {
                    "topic": topic.as_str(),
                    "sequenceNumber": sequence_number,
                    "index": index,
                },
            })),
        );
        if !(self.emit_event)(event.into()) {
            log::error!("Failed to emit ExceptionEncountered event.");
        }
    }

    /// Reports a device-side failure with no message to quote.
    pub fn emit_internal_error(&self) {
        let event = JsonMessage::new(
            events::EXCEPTION_ENCOUNTERED,
            Some(json!({
                "code": ExceptionCode::InternalError.as_str(),
            })),
        );
        if !(self.emit_event)(event.into()) {
            log::error!("Failed to emit ExceptionEncountered event.");
        }
    }

    /// Handles a sequenced `Exception` directive:
    /// `{"code": "...", "description": "..."}`.
    pub fn handle_exception_directive(
        &self,
        payload: Option<&Value>,
        sequence_number: u32,
        index: usize,
    ) {
        let Some(payload) = payload else {
            log::error!("Exception directive without payload, sequenceNumber={sequence_number}");
            self.emit_malformed_message(Topic::Directive, sequence_number, index);
            return;
        };
        let code = payload.get("code").and_then(Value::as_str).unwrap_or("UNKNOWN");
        let description = payload
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("");
        log::error!("Service exception, code={code}, description={description}");
        if let Some(observer) = &self.on_service_exception {
            observer(code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn capture() -> (Arc<Mutex<Vec<Value>>>, ExceptionManager) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let manager = ExceptionManager::new(move |msg| {
            if let Message::Json(json) = msg {
                sink.lock().unwrap().push(json.to_value());
            }
            true
        });
        (seen, manager)
    }

    #[test]
    fn test_malformed_message_quotes_origin() {
        let (seen, manager) = capture();
        manager.emit_malformed_message(Topic::Directive, 42, 3);
        let events = seen.lock().unwrap();
        let event = &events[0];
        assert_eq!(event["header"]["name"], "ExceptionEncountered");
        assert_eq!(event["payload"]["code"], "MALFORMED_MESSAGE");
        assert_eq!(event["payload"]["message"]["topic"], "directive");
        assert_eq!(event["payload"]["message"]["sequenceNumber"], 42);
        assert_eq!(event["payload"]["message"]["index"], 3);
    }

    #[test]
    fn test_internal_error_has_no_message_object() {
        let (seen, manager) = capture();
        manager.emit_internal_error();
        let events = seen.lock().unwrap();
        assert_eq!(events[0]["payload"]["code"], "INTERNAL_ERROR");
        assert!(events[0]["payload"].get("message").is_none());
    }

    #[test]
    fn test_exception_directive_notifies_observer() {
        let (_, mut manager) = capture();
        let seen_code = Arc::new(Mutex::new(String::new()));
        let sink = seen_code.clone();
        manager.set_service_exception_observer(move |code| {
            *sink.lock().unwrap() = code.to_string();
        });
        let payload = serde_json::json!({"code": "THROTTLED", "description": "slow down"});
        manager.handle_exception_directive(Some(&payload), 1, 0);
        assert_eq!(*seen_code.lock().unwrap(), "THROTTLED");
    }

    #[test]
    fn test_exception_directive_without_payload_is_malformed() {
        let (seen, manager) = capture();
        manager.handle_exception_directive(None, 7, 0);
        let events = seen.lock().unwrap();
        assert_eq!(events[0]["payload"]["code"], "MALFORMED_MESSAGE");
    }
}
