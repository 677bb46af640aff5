//! Capabilities publishing.
//!
//! Once per connection the device enumerates what it supports on the
//! capabilities topic; the service accepts or rejects the set. The
//! publish state machine refuses overlapping publishes and surfaces the
//! verdict to the client.

use std::sync::Mutex;

use serde_json::{json, Value};

use crate::message::{JsonMessage, Message};

/// Speaker capability parameters advertised to the service.
#[derive(Debug, Clone)]
pub struct SpeakerCapability {
    pub buffer_size: usize,
    pub overrun_warning_threshold: u64,
    pub underrun_warning_threshold: u64,
    pub codec: String,
    pub bitrate: u32,
    pub channels: u8,
}

#[derive(Debug, Clone)]
pub struct MicrophoneCapability {
    pub audio_profile: String,
    pub audio_encoding: String,
}

#[derive(Debug, Clone)]
pub struct AlertsCapability {
    pub max_alert_count: usize,
}

#[derive(Debug, Clone)]
pub struct SystemCapability {
    pub firmware_version: String,
    pub locale: String,
    pub mqtt_max_message_size: usize,
}

/// What the device is built with; `None` fields are omitted from the
/// published document.
#[derive(Debug, Clone)]
pub struct CapabilitiesConfig {
    pub speaker: Option<SpeakerCapability>,
    pub microphone: Option<MicrophoneCapability>,
    pub alerts: Option<AlertsCapability>,
    pub clock: bool,
    pub system: SystemCapability,
}

/// Progress of the per-connection capabilities handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishState {
    /// Nothing published on this connection yet.
    Idle,
    /// Waiting for the service's verdict.
    Published { message_id: String },
    Accepted,
    Rejected,
}

pub struct CapabilitiesSender {
    config: CapabilitiesConfig,
    state: Mutex<PublishState>,
    publish_message: Box<dyn Fn(Message) -> bool + Send + Sync>,
}

impl CapabilitiesSender {
    pub fn new(
        config: CapabilitiesConfig,
        publish_message: impl Fn(Message) -> bool + Send + Sync + 'static,
    ) -> Self {
        CapabilitiesSender {
            config,
            state: Mutex::new(PublishState::Idle),
            publish_message: Box::new(publish_message),
        }
    }

    pub fn state(&self) -> PublishState {
        self.lock().clone()
    }

    /// Clears the handshake state; called when a connection closes.
    pub fn reset(&self) {
        *self.lock() = PublishState::Idle;
    }

    /// Publishes the capabilities document. Refused while a publish is
    /// already in flight on this connection.
    pub fn publish(&self) -> bool {
        {
            let state = self.lock();
            if matches!(*state, PublishState::Published { .. }) {
                log::warn!("Capabilities publish already in flight");
                return false;
            }
        }
        let message = JsonMessage::new("Publish", Some(self.build_document()));
        let message_id = message.message_id().to_string();
        if !(self.publish_message)(message.into()) {
            log::error!("Failed to publish capabilities");
            return false;
        }
        *self.lock() = PublishState::Published { message_id };
        log::info!("Capabilities published");
        true
    }

    /// `Acknowledge{publishMessageId, code}` from the capabilities
    /// topic.
    pub fn on_acknowledge(&self, payload: Option<&Value>) -> bool {
        let Some(payload) = payload else { return false };
        let code = payload.get("code").and_then(Value::as_str).unwrap_or("");
        let message_id = payload
            .get("publishMessageId")
            .and_then(Value::as_str)
            .unwrap_or("");
        let mut state = self.lock();
        if let PublishState::Published { message_id: expected } = &*state {
            if message_id != expected {
                log::warn!("Capabilities acknowledge for unknown publish: {message_id:?}");
            }
        }
        match code {
            "ACCEPTED" => {
                log::info!("Capabilities accepted");
                *state = PublishState::Accepted;
                true
            }
            "REJECTED" => {
                let description = payload
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                log::error!("Capabilities rejected: {description}");
                *state = PublishState::Rejected;
                true
            }
            other => {
                log::error!("Unknown capabilities acknowledge code: {other}");
                false
            }
        }
    }

    fn build_document(&self) -> Value {
        let mut capabilities = Vec::new();
        if let Some(speaker) = &self.config.speaker {
            capabilities.push(json!({
                "type": "AisInterface",
                "interface": "Speaker",
                "version": crate::API_VERSION,
                "configurations": {
                    "audioBuffer": {
                        "sizeInBytes": speaker.buffer_size,
                        "reporting": {
                            "overrunWarningThreshold": speaker.overrun_warning_threshold,
                            "underrunWarningThreshold": speaker.underrun_warning_threshold,
                        },
                    },
                    "audioDecoder": {
                        "format": speaker.codec,
                        "bitrate": speaker.bitrate,
                        "numberOfChannels": speaker.channels,
                    },
                },
            }));
        }
        if let Some(microphone) = &self.config.microphone {
            capabilities.push(json!({
                "type": "AisInterface",
                "interface": "Microphone",
                "version": crate::API_VERSION,
                "configurations": {
                    "audioProfile": microphone.audio_profile,
                    "audioEncoding": microphone.audio_encoding,
                },
            }));
        }
        if let Some(alerts) = &self.config.alerts {
            capabilities.push(json!({
                "type": "AisInterface",
                "interface": "Alerts",
                "version": crate::API_VERSION,
                "configurations": {
                    "maxAlertCount": alerts.max_alert_count,
                },
            }));
        }
        if self.config.clock {
            capabilities.push(json!({
                "type": "AisInterface",
                "interface": "Clock",
                "version": crate::API_VERSION,
            }));
        }
        capabilities.push(json!({
            "type": "AisInterface",
            "interface": "System",
            "version": crate::API_VERSION,
            "configurations": {
                "firmwareVersion": self.config.system.firmware_version,
                "locale": self.config.system.locale,
                "mqtt": { "maxMessageSize": self.config.system.mqtt_max_message_size },
            },
        }));
        json!({ "capabilities": capabilities })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PublishState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn config() -> CapabilitiesConfig {
        CapabilitiesConfig {
            speaker: Some(SpeakerCapability {
                buffer_size: 65536,
                overrun_warning_threshold: 60000,
                underrun_warning_threshold: 4096,
                codec: "OPUS".into(),
                bitrate: 64000,
                channels: 1,
            }),
            microphone: Some(MicrophoneCapability {
                audio_profile: "NEAR_FIELD".into(),
                audio_encoding: "AUDIO_L16_RATE_16000_CHANNELS_1".into(),
            }),
            alerts: Some(AlertsCapability {
                max_alert_count: 16,
            }),
            clock: true,
            system: SystemCapability {
                firmware_version: "1.0.0".into(),
                locale: "en-US".into(),
                mqtt_max_message_size: 8192,
            },
        }
    }

    fn sender() -> (CapabilitiesSender, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sender = CapabilitiesSender::new(config(), move |msg| {
            if let Message::Json(json) = msg {
                sink.lock().unwrap().push(json.to_value());
            }
            true
        });
        (sender, seen)
    }

    #[test]
    fn test_document_enumerates_built_interfaces() {
        let (sender, seen) = sender();
        assert!(sender.publish());
        let published = seen.lock().unwrap();
        let interfaces: Vec<&str> = published[0]["payload"]["capabilities"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["interface"].as_str().unwrap())
            .collect();
        assert_eq!(
            interfaces,
            vec!["Speaker", "Microphone", "Alerts", "Clock", "System"]
        );
    }

    #[test]
    fn test_absent_interfaces_omitted() {
        let mut cfg = config();
        cfg.speaker = None;
        cfg.clock = false;
        let sender = CapabilitiesSender::new(cfg, |_| true);
        let doc = sender.build_document();
        let interfaces: Vec<&str> = doc["capabilities"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["interface"].as_str().unwrap())
            .collect();
        assert_eq!(interfaces, vec!["Microphone", "Alerts", "System"]);
    }

    #[test]
    fn test_second_publish_refused_until_acknowledged() {
        let (sender, seen) = sender();
        assert!(sender.publish());
        assert!(!sender.publish());

        let message_id = seen.lock().unwrap()[0]["header"]["messageId"]
            .as_str()
            .unwrap()
            .to_string();
        assert!(sender.on_acknowledge(Some(&json!({
            "publishMessageId": message_id,
            "code": "ACCEPTED",
        }))));
        assert_eq!(sender.state(), PublishState::Accepted);
    }

    #[test]
    fn test_rejection_surfaces() {
        let (sender, _) = sender();
        sender.publish();
        assert!(sender.on_acknowledge(Some(&json!({
            "publishMessageId": "whatever",
            "code": "REJECTED",
            "description": "bad bitrate",
        }))));
        assert_eq!(sender.state(), PublishState::Rejected);
    }

    #[test]
    fn test_reset_allows_republish() {
        let (sender, _) = sender();
        sender.publish();
        sender.reset();
        assert!(sender.publish());
    }

    #[test]
    fn test_unknown_code_is_malformed() {
        let (sender, _) = sender();
        sender.publish();
        assert!(!sender.on_acknowledge(Some(&json!({"code": "MAYBE"}))));
        assert!(!sender.on_acknowledge(None));
    }
}
