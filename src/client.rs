//! Composition root: builds the topic plumbing and whichever capability
//! managers the application enables, and routes raw inbound MQTT
//! payloads into it.
//!
//! Capabilities are composed at runtime: a client built without an
//! [`AudioOutput`] has no speaker engine and registers no speaker
//! directives; likewise for microphone, alerts and clock. The
//! collaborators (transport, storage, audio, clock) are owned as trait
//! objects for the lifetime of the client.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde_json::json;
use thiserror::Error;

use crate::alerts::{AlertManager, AlertManagerConfig};
use crate::buttons::{ButtonCommand, ButtonCommandSender};
use crate::capabilities::{CapabilitiesConfig, CapabilitiesSender, SystemCapability};
use crate::clock::{AlertClock, ClockManager};
use crate::connection::{ConnectionManager, ConnectionState, DisconnectCode};
use crate::datastream::DataStreamReader;
use crate::dispatcher::{Directive, Dispatcher, DispatcherBuilder};
use crate::emitter::Emitter;
use crate::exception::ExceptionManager;
use crate::message::Message;
use crate::microphone::{MicrophoneManager, MicrophoneProfile};
use crate::regulator::Regulator;
use crate::secret::{SecretManager, SharedSecret};
use crate::speaker::{AudioOutput, SpeakerConfig, SpeakerEngine, SpeakerError};
use crate::storage::{self, KeyValueStore};
use crate::tasks::TaskPool;
use crate::topic::Topic;
use crate::transport::MqttPublisher;
use crate::ux::{UXManager, UXState};

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("An MQTT publisher is required")]
    MissingPublisher,
    #[error("A key-value store is required")]
    MissingStore,
    #[error("No shared secret provided and none persisted")]
    MissingSecret,
    #[error("Speaker engine: {0}")]
    Speaker(#[from] SpeakerError),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub aws_account_id: String,
    pub client_id: String,
    pub topic_root: String,
    /// Largest MQTT payload the broker accepts.
    pub max_message_size: usize,
    /// Out-of-order window per inbound topic.
    pub max_slots: usize,
    /// Gap timeout before escalating to UNEXPECTED_SEQUENCE_NUMBER;
    /// zero disables.
    pub sequence_timeout: Duration,
    /// Regulator emit cadence floor.
    pub min_wait_time: Duration,
    /// Reconnect backoff cap.
    pub max_backoff: Duration,
    pub firmware_version: String,
    pub locale: String,
    /// Bytes per microphone chunk.
    pub microphone_chunk_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            aws_account_id: String::new(),
            client_id: String::new(),
            topic_root: String::new(),
            max_message_size: 8192,
            max_slots: 8,
            sequence_timeout: Duration::from_secs(10),
            min_wait_time: Duration::from_millis(50),
            max_backoff: Duration::from_secs(64),
            firmware_version: "0.0.0".into(),
            locale: "en-US".into(),
            microphone_chunk_size: 640,
        }
    }
}

#[derive(Default)]
pub struct AiaClientBuilder {
    config: ClientConfig,
    publisher: Option<Arc<dyn MqttPublisher>>,
    store: Option<Arc<dyn KeyValueStore>>,
    secret: Option<SharedSecret>,
    audio: Option<(Arc<dyn AudioOutput>, SpeakerConfig)>,
    microphone: Option<DataStreamReader>,
    alerts: Option<AlertManagerConfig>,
    clock: Option<Arc<dyn AlertClock>>,
    ux_observer: Option<Box<dyn Fn(UXState) + Send + Sync>>,
}

impl AiaClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        AiaClientBuilder {
            config,
            ..Default::default()
        }
    }

    pub fn publisher(mut self, publisher: Arc<dyn MqttPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Shared secret from registration. When omitted, the persisted
    /// secret is loaded from the store.
    pub fn shared_secret(mut self, secret: SharedSecret) -> Self {
        self.secret = Some(secret);
        self
    }

    /// Composes the speaker engine.
    pub fn speaker(mut self, audio: Arc<dyn AudioOutput>, config: SpeakerConfig) -> Self {
        self.audio = Some((audio, config));
        self
    }

    /// Composes the microphone publisher around the application's
    /// capture stream reader.
    pub fn microphone(mut self, capture_reader: DataStreamReader) -> Self {
        self.microphone = Some(capture_reader);
        self
    }

    /// Composes the alert manager.
    pub fn alerts(mut self, config: AlertManagerConfig) -> Self {
        self.alerts = Some(config);
        self
    }

    /// Composes the clock manager.
    pub fn clock(mut self, clock: Arc<dyn AlertClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn ux_observer(mut self, observer: impl Fn(UXState) + Send + Sync + 'static) -> Self {
        self.ux_observer = Some(Box::new(observer));
        self
    }

    pub fn build(self) -> Result<AiaClient, BuildError> {
        let config = self.config;
        let publisher = self.publisher.ok_or(BuildError::MissingPublisher)?;
        let store = self.store.ok_or(BuildError::MissingStore)?;
        let secret = match self.secret {
            Some(secret) => secret,
            None => storage::load_shared_secret(store.as_ref())
                .ok()
                .flatten()
                .ok_or(BuildError::MissingSecret)?,
        };
        let pool = TaskPool::new();

        // The secret manager consults the event emitter for sequence
        // numbers, and the emitters encrypt through the secret manager;
        // the cell breaks the construction cycle.
        let event_emitter_cell: Arc<OnceCell<Arc<Emitter>>> = Arc::new(OnceCell::new());
        let cell = event_emitter_cell.clone();
        let secret_manager = Arc::new(SecretManager::new(secret, move |_topic| {
            cell.get().map_or(0, |emitter| emitter.next_sequence_number())
        }));

        let event_emitter = Arc::new(Emitter::new(
            Topic::Event,
            secret_manager.clone(),
            publisher.clone(),
        ));
        let _ = event_emitter_cell.set(event_emitter.clone());
        let capabilities_emitter = Arc::new(Emitter::new(
            Topic::Capabilities,
            secret_manager.clone(),
            publisher.clone(),
        ));
        let connection_emitter = Arc::new(Emitter::new(
            Topic::Connection,
            secret_manager.clone(),
            publisher.clone(),
        ));

        let event_regulator = {
            let emitter = event_emitter.clone();
            Arc::new(Regulator::new(
                config.max_message_size,
                config.min_wait_time,
                pool.clone(),
                move |chunk, bytes, chunks| emitter.emit_chunk(chunk, bytes, chunks),
            ))
        };
        let capabilities_regulator = {
            let emitter = capabilities_emitter.clone();
            Arc::new(Regulator::new(
                config.max_message_size,
                Duration::ZERO,
                pool.clone(),
                move |chunk, bytes, chunks| emitter.emit_chunk(chunk, bytes, chunks),
            ))
        };

        let event_sink = |regulator: &Arc<Regulator>| {
            let regulator = regulator.clone();
            move |message: Message| regulator.write(message).is_ok()
        };

        secret_manager.set_event_emitter(event_sink(&event_regulator));
        let exceptions = Arc::new(ExceptionManager::new(event_sink(&event_regulator)));

        // Capabilities handshake, re-run on every connection.
        let capabilities_config = CapabilitiesConfig {
            speaker: self.audio.as_ref().map(|(_, speaker)| {
                crate::capabilities::SpeakerCapability {
                    buffer_size: speaker.buffer_size,
                    overrun_warning_threshold: speaker.overrun_warning_threshold,
                    underrun_warning_threshold: speaker.underrun_warning_threshold,
                    codec: "OPUS".into(),
                    bitrate: 64000,
                    channels: 1,
                }
            }),
            microphone: self.microphone.as_ref().map(|_| {
                crate::capabilities::MicrophoneCapability {
                    audio_profile: MicrophoneProfile::NearField.as_str().into(),
                    audio_encoding: "AUDIO_L16_RATE_16000_CHANNELS_1".into(),
                }
            }),
            alerts: self.alerts.as_ref().map(|alerts| {
                crate::capabilities::AlertsCapability {
                    max_alert_count: alerts.max_alerts,
                }
            }),
            clock: self.clock.is_some(),
            system: SystemCapability {
                firmware_version: config.firmware_version.clone(),
                locale: config.locale.clone(),
                mqtt_max_message_size: config.max_message_size,
            },
        };
        let capabilities = {
            let regulator = capabilities_regulator.clone();
            Arc::new(CapabilitiesSender::new(capabilities_config, move |msg| {
                regulator.write(msg).is_ok()
            }))
        };

        let clock_manager = self.clock.clone().map(|clock| {
            Arc::new(ClockManager::new(clock, event_sink(&event_regulator)))
        });

        let connection = {
            let capabilities = capabilities.clone();
            let capabilities_reset = capabilities.clone();
            let clock_manager = clock_manager.clone();
            ConnectionManager::new(
                connection_emitter,
                pool.clone(),
                config.aws_account_id.clone(),
                config.client_id.clone(),
                config.max_backoff,
                move || {
                    capabilities.reset();
                    capabilities.publish();
                    if let Some(clock) = &clock_manager {
                        clock.synchronize();
                    }
                },
                |_| {},
                move |_| {
                    capabilities_reset.reset();
                },
            )
        };

        let speaker = match self.audio {
            Some((audio, speaker_config)) => Some(SpeakerEngine::new(
                speaker_config,
                audio,
                pool.clone(),
                event_sink(&event_regulator),
            )?),
            None => None,
        };

        let ux = Arc::new(UXManager::new(match self.ux_observer {
            Some(observer) => observer,
            None => Box::new(|_| {}),
        }));

        let microphone = match self.microphone {
            Some(capture_reader) => {
                let microphone_emitter = Arc::new(Emitter::new(
                    Topic::Microphone,
                    secret_manager.clone(),
                    publisher.clone(),
                ));
                let microphone_regulator = {
                    let emitter = microphone_emitter.clone();
                    Arc::new(Regulator::new(
                        config.max_message_size,
                        config.min_wait_time,
                        pool.clone(),
                        move |chunk, bytes, chunks| emitter.emit_chunk(chunk, bytes, chunks),
                    ))
                };
                let ux = ux.clone();
                Some(MicrophoneManager::new(
                    capture_reader,
                    microphone_regulator,
                    pool.clone(),
                    config.microphone_chunk_size,
                    event_sink(&event_regulator),
                    move |open| ux.set_microphone_open(open),
                ))
            }
            None => None,
        };

        let alerts = match self.alerts {
            Some(alerts_config) => {
                let clock: Arc<dyn AlertClock> = self
                    .clock
                    .clone()
                    .unwrap_or_else(|| Arc::new(crate::clock::SystemClock::default()));
                let connection_probe = connection.clone();
                let connection_offline = connection.clone();
                let ux = ux.clone();
                Some(AlertManager::new(
                    alerts_config,
                    store.clone(),
                    clock,
                    pool.clone(),
                    speaker.clone(),
                    event_sink(&event_regulator),
                    move || connection_probe.is_connected(),
                    move || {
                        connection_offline
                            .disconnect(DisconnectCode::GoingOffline, "sustained speaker underruns");
                    },
                    move |active| ux.set_alert_active(active),
                ))
            }
            None => None,
        };

        // Directive handler table, populated only for what is composed.
        let mut builder = DispatcherBuilder::new(config.max_slots, config.sequence_timeout);
        {
            let secret_manager = secret_manager.clone();
            let exceptions = exceptions.clone();
            let store = store.clone();
            builder = builder.add_handler(Directive::RotateSecret, move |payload, seq, index| {
                match secret_manager.handle_rotate_secret(payload) {
                    Ok(()) => {
                        if let Err(e) = storage::store_shared_secret(
                            store.as_ref(),
                            &secret_manager.latest_secret(),
                        ) {
                            log::error!("Failed to persist rotated secret: {e}");
                        }
                    }
                    Err(e) => {
                        log::error!("RotateSecret failed: {e}");
                        exceptions.emit_malformed_message(Topic::Directive, seq, index);
                    }
                }
            });
        }
        {
            let ux = ux.clone();
            let exceptions = exceptions.clone();
            builder = builder.add_handler(Directive::SetAttentionState, move |payload, seq, index| {
                if !ux.handle_set_attention_state(payload) {
                    exceptions.emit_malformed_message(Topic::Directive, seq, index);
                }
            });
        }
        {
            let exceptions = exceptions.clone();
            builder = builder.add_handler(Directive::Exception, move |payload, seq, index| {
                exceptions.handle_exception_directive(payload, seq, index);
            });
        }
        if let Some(engine) = &speaker {
            for (directive, handler) in [
                (
                    Directive::OpenSpeaker,
                    handle_speaker(engine, &exceptions, SpeakerEngine::handle_open_speaker),
                ),
                (
                    Directive::CloseSpeaker,
                    handle_speaker(engine, &exceptions, SpeakerEngine::handle_close_speaker),
                ),
                (
                    Directive::SetVolume,
                    handle_speaker(engine, &exceptions, SpeakerEngine::handle_set_volume),
                ),
            ] {
                builder = builder.add_handler(directive, handler);
            }
            let engine = engine.clone();
            builder = builder.speaker_sink({
                let exceptions = exceptions.clone();
                move |seq, data| {
                    if !engine.on_speaker_topic_message(&data, seq) {
                        exceptions.emit_malformed_message(Topic::Speaker, seq, 0);
                    }
                }
            });
        }
        if let Some(microphone_manager) = &microphone {
            let open = microphone_manager.clone();
            let close = microphone_manager.clone();
            let exceptions_open = exceptions.clone();
            builder = builder
                .add_handler(Directive::OpenMicrophone, move |payload, seq, index| {
                    if !open.handle_open_microphone(payload) {
                        exceptions_open.emit_malformed_message(Topic::Directive, seq, index);
                    }
                })
                .add_handler(Directive::CloseMicrophone, move |payload, _seq, _index| {
                    close.handle_close_microphone(payload);
                });
        }
        if let Some(alert_manager) = &alerts {
            let set = alert_manager.clone();
            let delete = alert_manager.clone();
            let volume = alert_manager.clone();
            let exceptions = exceptions.clone();
            builder = builder
                .add_handler(Directive::SetAlert, move |payload, _seq, _index| {
                    set.handle_set_alert(payload);
                })
                .add_handler(Directive::DeleteAlert, move |payload, _seq, _index| {
                    delete.handle_delete_alert(payload);
                })
                .add_handler(Directive::SetAlertVolume, move |payload, seq, index| {
                    if !volume.handle_set_alert_volume(payload) {
                        exceptions.emit_malformed_message(Topic::Directive, seq, index);
                    }
                });
        }
        if let Some(clock_manager) = &clock_manager {
            let clock_manager = clock_manager.clone();
            let exceptions = exceptions.clone();
            builder = builder.add_handler(Directive::SetClock, move |payload, seq, index| {
                if !clock_manager.handle_set_clock(payload) {
                    exceptions.emit_malformed_message(Topic::Directive, seq, index);
                }
            });
        }
        {
            let capabilities = capabilities.clone();
            builder = builder.capabilities_ack_sink(move |payload| {
                capabilities.on_acknowledge(payload);
            });
        }

        let dispatcher = Arc::new(builder.build(
            pool.clone(),
            secret_manager.clone(),
            exceptions.clone(),
            connection.clone(),
        ));
        if let Some(engine) = &speaker {
            let dispatcher = dispatcher.clone();
            engine.set_sequencer_reset(move |next| dispatcher.reset_speaker_sequencer(next));
        }

        let buttons = ButtonCommandSender::new(event_sink(&event_regulator), speaker.clone());

        Ok(AiaClient {
            config,
            pool,
            dispatcher,
            connection,
            secret_manager,
            exceptions,
            capabilities,
            speaker,
            microphone,
            alerts,
            clock_manager,
            ux,
            buttons,
            event_regulator,
        })
    }
}

pub struct AiaClient {
    config: ClientConfig,
    #[allow(dead_code)]
    pool: TaskPool,
    dispatcher: Arc<Dispatcher>,
    connection: Arc<ConnectionManager>,
    secret_manager: Arc<SecretManager>,
    exceptions: Arc<ExceptionManager>,
    capabilities: Arc<CapabilitiesSender>,
    speaker: Option<Arc<SpeakerEngine>>,
    microphone: Option<Arc<MicrophoneManager>>,
    alerts: Option<Arc<AlertManager>>,
    clock_manager: Option<Arc<ClockManager>>,
    ux: Arc<UXManager>,
    buttons: ButtonCommandSender,
    event_regulator: Arc<Regulator>,
}

impl AiaClient {
    pub fn builder(config: ClientConfig) -> AiaClientBuilder {
        AiaClientBuilder::new(config)
    }

    /// Begins the connection handshake.
    pub fn connect(&self) -> bool {
        self.connection.connect()
    }

    pub fn disconnect(&self, code: DisconnectCode, description: &str) -> bool {
        self.connection.disconnect(code, description)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Feeds a raw inbound MQTT payload, already resolved to a logical
    /// topic.
    pub fn on_mqtt_message(&self, topic: Topic, payload: &[u8]) {
        self.dispatcher.on_mqtt_message(topic, payload);
    }

    /// Feeds a raw inbound MQTT payload by its full topic path.
    pub fn on_mqtt_message_path(&self, path: &str, payload: &[u8]) {
        match Topic::from_subscribe_path(path, &self.config.topic_root, &self.config.client_id) {
            Some(topic) => self.on_mqtt_message(topic, payload),
            None => log::warn!("Message on unknown topic path {path:?}"),
        }
    }

    /// Reports that the MQTT transport dropped.
    pub fn on_transport_disconnected(&self) {
        self.connection.on_transport_disconnected();
    }

    /// The topic paths the transport should subscribe to.
    pub fn subscribe_paths(&self) -> Vec<String> {
        [Topic::Connection, Topic::Capabilities, Topic::Directive, Topic::Speaker]
            .iter()
            .map(|t| t.subscribe_path(&self.config.topic_root, &self.config.client_id))
            .collect()
    }

    pub fn speaker(&self) -> Option<&Arc<SpeakerEngine>> {
        self.speaker.as_ref()
    }

    pub fn microphone(&self) -> Option<&Arc<MicrophoneManager>> {
        self.microphone.as_ref()
    }

    pub fn alerts(&self) -> Option<&Arc<AlertManager>> {
        self.alerts.as_ref()
    }

    pub fn ux_state(&self) -> UXState {
        self.ux.state()
    }

    pub fn on_button_pressed(&self, command: ButtonCommand) -> bool {
        self.buttons.on_button_pressed(command)
    }

    /// Progress of this connection's capabilities handshake.
    pub fn capabilities_state(&self) -> crate::capabilities::PublishState {
        self.capabilities.state()
    }

    /// Reports an application-detected internal error to the service.
    pub fn report_internal_error(&self) {
        self.exceptions.emit_internal_error();
    }

    /// Snapshot of the active shared secret, e.g. for re-registration.
    pub fn active_secret(&self) -> SharedSecret {
        self.secret_manager.active_secret()
    }

    /// Requests clock synchronisation from the service.
    pub fn synchronize_clock(&self) -> bool {
        self.clock_manager
            .as_ref()
            .map(|clock| clock.synchronize())
            .unwrap_or(false)
    }

    /// Emits a `SynchronizeState` event describing device-side state.
    pub fn synchronize_state(&self) -> bool {
        let volume = self.speaker.as_ref().map(|s| s.volume());
        let mut payload = json!({});
        if let Some(volume) = volume {
            payload["volume"] = json!(volume);
        }
        let message =
            crate::message::JsonMessage::new(crate::events::SYNCHRONIZE_STATE, Some(payload));
        self.event_regulator.write(message.into()).is_ok()
    }
}

/// Wraps a speaker directive method with malformed-message reporting.
fn handle_speaker(
    engine: &Arc<SpeakerEngine>,
    exceptions: &Arc<ExceptionManager>,
    method: fn(&Arc<SpeakerEngine>, Option<&serde_json::Value>) -> bool,
) -> impl Fn(Option<&serde_json::Value>, u32, usize) + Send + Sync + 'static {
    let engine = engine.clone();
    let exceptions = exceptions.clone();
    move |payload, seq, index| {
        if !method(&engine, payload) {
            exceptions.emit_malformed_message(Topic::Directive, seq, index);
        }
    }
}
