//! Seam to the application-supplied MQTT transport.

use thiserror::Error;

use crate::topic::Topic;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Not connected to the broker")]
    Disconnected,
    #[error("Publish failed: {0}")]
    PublishFailed(String),
}

/// Publishes finished frames onto the broker. Implementations resolve
/// the logical topic to the full MQTT path (see
/// [`Topic::publish_path`](crate::topic::Topic::publish_path)) and are
/// required to be thread-safe.
pub trait MqttPublisher: Send + Sync {
    fn publish(&self, topic: Topic, payload: &[u8]) -> Result<(), TransportError>;
}
