//! Device-side client runtime for the Aia voice service message plane.
//!
//! The crate implements the subsystems that carry encrypted, ordered,
//! rate-regulated MQTT traffic between an IoT device and the Aia service:
//! per-topic sequencing, outbound batching, AEAD with a rotating shared
//! secret, the audio ring buffer, the speaker playback engine, and the
//! directive/event plumbing around them. The MQTT transport, persistent
//! storage, and audio hardware are collaborators supplied by the
//! application through the traits in [`transport`], [`storage`],
//! [`speaker`] and [`clock`].

pub mod alerts;
pub mod buttons;
pub mod capabilities;
pub mod client;
pub mod clock;
pub mod connection;
pub mod crypto;
pub mod datastream;
pub mod dispatcher;
pub mod emitter;
pub mod events;
pub mod exception;
pub mod message;
pub mod microphone;
pub mod regulator;
pub mod secret;
pub mod sequencer;
pub mod speaker;
pub mod storage;
pub mod tasks;
pub mod topic;
pub mod transport;
pub mod ux;

pub use client::{AiaClient, AiaClientBuilder, ClientConfig};
pub use connection::{ConnectionState, DisconnectCode};
pub use message::{BinaryMessage, JsonMessage, Message};
pub use secret::{SecretManager, SharedSecret};
pub use topic::{Direction, Topic};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version segment used in MQTT topic paths.
pub const API_VERSION: &str = "v1";
