//! Topics and the MQTT paths they map onto.
//!
//! Each topic is a logical channel with fixed properties: whether its
//! payloads are encrypted, which way it primarily flows, and whether it
//! carries JSON or binary stream messages. Sequence number spaces are per
//! topic *and* per direction.

use crate::API_VERSION;

/// Payload shape carried by a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Json,
    Binary,
}

/// Message flow direction, from the device's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    DeviceToService,
    ServiceToDevice,
}

impl Direction {
    /// Single-byte encoding used in AEAD nonce construction.
    pub fn byte(self) -> u8 {
        match self {
            Direction::DeviceToService => 0,
            Direction::ServiceToDevice => 1,
        }
    }
}

/// The finite set of logical channels between device and service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Capabilities,
    Directive,
    Event,
    Microphone,
    Speaker,
    Connection,
}

impl Topic {
    pub const ALL: [Topic; 6] = [
        Topic::Capabilities,
        Topic::Directive,
        Topic::Event,
        Topic::Microphone,
        Topic::Speaker,
        Topic::Connection,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Capabilities => "capabilities",
            Topic::Directive => "directive",
            Topic::Event => "event",
            Topic::Microphone => "microphone",
            Topic::Speaker => "speaker",
            Topic::Connection => "connection",
        }
    }

    /// Single-byte encoding used in AEAD nonce construction.
    pub fn id(self) -> u8 {
        match self {
            Topic::Capabilities => 0,
            Topic::Directive => 1,
            Topic::Event => 2,
            Topic::Microphone => 3,
            Topic::Speaker => 4,
            Topic::Connection => 5,
        }
    }

    /// All topics except the connection handshake are encrypted.
    pub fn is_encrypted(self) -> bool {
        !matches!(self, Topic::Connection)
    }

    /// Primary flow direction: `true` when the device publishes here.
    pub fn is_outbound(self) -> bool {
        matches!(
            self,
            Topic::Event | Topic::Microphone | Topic::Capabilities | Topic::Connection
        )
    }

    pub fn kind(self) -> TopicKind {
        match self {
            Topic::Microphone | Topic::Speaker => TopicKind::Binary,
            _ => TopicKind::Json,
        }
    }

    /// MQTT path the device publishes to for this topic, rooted at the
    /// service-assigned topic root: `<root>/ais/<version>/<clientId>/...`.
    pub fn publish_path(self, topic_root: &str, client_id: &str) -> String {
        let suffix = match self {
            Topic::Connection => "connection/fromclient",
            Topic::Capabilities => "capabilities/publish",
            other => other.as_str(),
        };
        format!("{topic_root}/ais/{API_VERSION}/{client_id}/{suffix}")
    }

    /// MQTT path the device subscribes to for this topic.
    pub fn subscribe_path(self, topic_root: &str, client_id: &str) -> String {
        let suffix = match self {
            Topic::Connection => "connection/fromservice",
            Topic::Capabilities => "capabilities/acknowledge",
            other => other.as_str(),
        };
        format!("{topic_root}/ais/{API_VERSION}/{client_id}/{suffix}")
    }

    /// Resolves an incoming MQTT topic path back to the logical topic.
    pub fn from_subscribe_path(path: &str, topic_root: &str, client_id: &str) -> Option<Topic> {
        Topic::ALL
            .iter()
            .copied()
            .find(|t| t.subscribe_path(topic_root, client_id) == path)
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encryption_properties() {
        assert!(!Topic::Connection.is_encrypted());
        for topic in Topic::ALL {
            if topic != Topic::Connection {
                assert!(topic.is_encrypted(), "{topic} should be encrypted");
            }
        }
    }

    #[test]
    fn test_kinds() {
        assert_eq!(Topic::Microphone.kind(), TopicKind::Binary);
        assert_eq!(Topic::Speaker.kind(), TopicKind::Binary);
        assert_eq!(Topic::Directive.kind(), TopicKind::Json);
        assert_eq!(Topic::Event.kind(), TopicKind::Json);
    }

    #[test]
    fn test_paths() {
        assert_eq!(
            Topic::Event.publish_path("root", "client"),
            "root/ais/v1/client/event"
        );
        assert_eq!(
            Topic::Connection.publish_path("root", "client"),
            "root/ais/v1/client/connection/fromclient"
        );
        assert_eq!(
            Topic::Connection.subscribe_path("root", "client"),
            "root/ais/v1/client/connection/fromservice"
        );
    }

    #[test]
    fn test_path_resolution() {
        let path = Topic::Directive.subscribe_path("r", "c");
        assert_eq!(Topic::from_subscribe_path(&path, "r", "c"), Some(Topic::Directive));
        assert_eq!(Topic::from_subscribe_path("r/other", "r", "c"), None);
    }

    #[test]
    fn test_topic_ids_unique() {
        let mut ids: Vec<u8> = Topic::ALL.iter().map(|t| t.id()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), Topic::ALL.len());
    }
}
