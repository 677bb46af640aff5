//! Microphone capture publishing.
//!
//! The application writes captured audio into a [`DataStream`]; this
//! manager drains it through a reader, wraps the bytes in binary stream
//! envelopes and feeds them to the microphone topic's regulator. Opening
//! and closing follow either local interaction (tap/hold-to-talk) or
//! the service's `OpenMicrophone`/`CloseMicrophone` directives.
//!
//! [`DataStream`]: crate::datastream::DataStream

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::{json, Value};

use crate::datastream::DataStreamReader;
use crate::events;
use crate::message::{BinaryMessage, JsonMessage, Message};
use crate::regulator::Regulator;
use crate::tasks::{TaskHandle, TaskPool};

/// Binary stream "type" for microphone audio.
pub const MICROPHONE_STREAM_TYPE_AUDIO: u8 = 0;

/// Cadence at which captured audio is drained and published.
const PUBLISH_CADENCE: Duration = Duration::from_millis(20);

/// How the microphone was engaged; reported to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicrophoneProfile {
    CloseTalk,
    NearField,
    FarField,
}

impl MicrophoneProfile {
    pub fn as_str(self) -> &'static str {
        match self {
            MicrophoneProfile::CloseTalk => "CLOSE_TALK",
            MicrophoneProfile::NearField => "NEAR_FIELD",
            MicrophoneProfile::FarField => "FAR_FIELD",
        }
    }
}

struct Inner {
    reader: DataStreamReader,
    open: bool,
    publish_task: Option<TaskHandle>,
    open_timeout_task: Option<TaskHandle>,
}

pub struct MicrophoneManager {
    inner: Mutex<Inner>,
    pool: TaskPool,
    data_regulator: Arc<Regulator>,
    emit_event: Box<dyn Fn(Message) -> bool + Send + Sync>,
    on_state_changed: Box<dyn Fn(bool) + Send + Sync>,
    chunk_size: usize,
}

impl MicrophoneManager {
    /// `reader` drains the application's capture stream; `chunk_size`
    /// bounds the bytes wrapped per binary message.
    pub fn new(
        reader: DataStreamReader,
        data_regulator: Arc<Regulator>,
        pool: TaskPool,
        chunk_size: usize,
        emit_event: impl Fn(Message) -> bool + Send + Sync + 'static,
        on_state_changed: impl Fn(bool) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(MicrophoneManager {
            inner: Mutex::new(Inner {
                reader,
                open: false,
                publish_task: None,
                open_timeout_task: None,
            }),
            pool,
            data_regulator,
            emit_event: Box::new(emit_event),
            on_state_changed: Box::new(on_state_changed),
            chunk_size,
        })
    }

    /// Whether microphone data is currently streaming to the service.
    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    /// Starts streaming microphone data (local tap/hold-to-talk or in
    /// response to `OpenMicrophone`).
    pub fn open_microphone(self: &Arc<Self>, profile: MicrophoneProfile) -> bool {
        let offset = {
            let mut inner = self.lock();
            if inner.open {
                log::warn!("Microphone already open");
                return false;
            }
            inner.open = true;
            if let Some(task) = inner.open_timeout_task.take() {
                self.pool.cancel(task);
            }
            let manager = Arc::downgrade(self);
            inner.publish_task = Some(self.pool.schedule_periodic(PUBLISH_CADENCE, move || {
                if let Some(manager) = manager.upgrade() {
                    manager.publish_captured_audio();
                }
            }));
            inner.reader.tell()
        };
        log::info!("Microphone opened, profile={}, offset={offset}", profile.as_str());
        self.emit(
            JsonMessage::new(
                events::MICROPHONE_OPENED,
                Some(json!({ "profile": profile.as_str(), "offset": offset })),
            )
            .into(),
        );
        (self.on_state_changed)(true);
        true
    }

    /// Stops streaming and reports the final stream offset.
    pub fn close_microphone(&self) -> bool {
        let offset = {
            let mut inner = self.lock();
            if !inner.open {
                return false;
            }
            inner.open = false;
            if let Some(task) = inner.publish_task.take() {
                self.pool.cancel(task);
            }
            inner.reader.tell()
        };
        log::info!("Microphone closed, offset={offset}");
        self.emit(
            JsonMessage::new(events::MICROPHONE_CLOSED, Some(json!({ "offset": offset }))).into(),
        );
        (self.on_state_changed)(false);
        true
    }

    /// `OpenMicrophone{timeoutInMilliseconds?}`: the service expects the
    /// device to reopen the microphone; report a timeout if it doesn't.
    pub fn handle_open_microphone(self: &Arc<Self>, payload: Option<&Value>) -> bool {
        let timeout_ms = payload
            .and_then(|p| p.get("timeoutInMilliseconds"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let mut inner = self.lock();
        if inner.open {
            return true;
        }
        if timeout_ms == 0 {
            return true;
        }
        if let Some(task) = inner.open_timeout_task.take() {
            self.pool.cancel(task);
        }
        let manager = Arc::downgrade(self);
        inner.open_timeout_task = Some(self.pool.schedule_once(
            Duration::from_millis(timeout_ms),
            move || {
                if let Some(manager) = manager.upgrade() {
                    manager.on_open_timeout();
                }
            },
        ));
        true
    }

    /// `CloseMicrophone`: close immediately.
    pub fn handle_close_microphone(&self, _payload: Option<&Value>) -> bool {
        self.close_microphone();
        true
    }

    fn on_open_timeout(&self) {
        {
            let mut inner = self.lock();
            inner.open_timeout_task = None;
            if inner.open {
                return;
            }
        }
        log::warn!("OpenMicrophone timed out before the microphone opened");
        self.emit(JsonMessage::new(events::OPEN_MICROPHONE_TIMED_OUT, Some(json!({}))).into());
    }

    /// Drains one chunk of captured audio into the regulator.
    fn publish_captured_audio(&self) {
        let mut inner = self.lock();
        if !inner.open {
            return;
        }
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            match inner.reader.read(&mut buf) {
                Ok(0) => break,
                Ok(read) => {
                    let chunk = match BinaryMessage::new(
                        MICROPHONE_STREAM_TYPE_AUDIO,
                        1,
                        buf[..read].to_vec(),
                    ) {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            log::error!("Failed to build microphone chunk: {e}");
                            break;
                        }
                    };
                    if let Err(e) = self.data_regulator.write(chunk.into()) {
                        log::error!("Microphone regulator refused chunk: {e}");
                        break;
                    }
                    if read < self.chunk_size {
                        break;
                    }
                }
                Err(crate::datastream::ReaderError::WouldBlock) => break,
                Err(crate::datastream::ReaderError::Overrun) => {
                    // Capture outpaced us; jump to the freshest audio.
                    log::warn!("Microphone reader overrun; skipping to live audio");
                    let _ = inner
                        .reader
                        .seek(0, crate::datastream::SeekReference::BeforeWriter);
                    break;
                }
                Err(e) => {
                    log::error!("Microphone read failed: {e}");
                    break;
                }
            }
        }
    }

    fn emit(&self, message: Message) {
        if !(self.emit_event)(message) {
            log::error!("Failed to emit microphone event");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
