//! Speaker playback engine.
//!
//! Sequenced binary speaker-topic messages land in a ring buffer; every
//! 20 ms the engine reads the next compressed frame and hands it to the
//! platform [`AudioOutput`]. Playback position is accounted in absolute
//! stream byte offsets, which is what `OpenSpeaker`/`CloseSpeaker`
//! reference and what offset-scheduled actions key on. Buffer occupancy
//! is sampled on every push and surfaced as `BufferStateChanged` events
//! with hysteresis; a terminal underrun or overrun resets the ring and
//! the speaker sequencer to re-sync with the service.

mod actions;
mod decoder;

pub use actions::ActionHandle;
pub use decoder::{DecodeError, SpeakerDecoder};
#[cfg(feature = "audio-codec")]
pub use decoder::OpusSpeakerDecoder;

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde_json::{json, Value};
use thiserror::Error;

use crate::datastream::{
    DataStream, DataStreamReader, DataStreamWriter, ReaderError, ReaderPolicy, SeekReference,
    WriterPolicy,
};
use crate::events;
use crate::message::{BinaryMessage, JsonMessage, Message};
use crate::tasks::{TaskHandle, TaskPool};

use actions::ActionSet;

/// Fixed frame push cadence.
pub const FRAME_PUSH_CADENCE: Duration = Duration::from_millis(20);

/// Lowest and highest acceptable volume.
pub const MIN_VOLUME: u8 = 0;
pub const MAX_VOLUME: u8 = 100;

/// Binary stream "type" carrying compressed audio.
pub const BINARY_STREAM_TYPE_AUDIO: u8 = 0;
/// Binary stream "type" carrying a 4-byte playback marker.
pub const BINARY_STREAM_TYPE_MARKER: u8 = 1;

#[derive(Error, Debug)]
pub enum SpeakerError {
    #[error("Buffer configuration invalid: {0}")]
    BadConfig(&'static str),
}

/// Speaker buffer states, total-ordered for hysteresis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BufferState {
    Underrun,
    UnderrunWarning,
    None,
    OverrunWarning,
    Overrun,
}

impl BufferState {
    pub fn as_str(self) -> &'static str {
        match self {
            BufferState::Underrun => "UNDERRUN",
            BufferState::UnderrunWarning => "UNDERRUN_WARNING",
            BufferState::None => "NONE",
            BufferState::OverrunWarning => "OVERRUN_WARNING",
            BufferState::Overrun => "OVERRUN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlaybackState {
    Idle,
    Buffering,
    Playing,
}

/// Platform audio hooks. `play_frame` hands over one compressed frame
/// and may refuse it (`false`) when the platform buffer is full; the
/// engine re-offers the same frame after
/// [`SpeakerEngine::on_speaker_ready`].
pub trait AudioOutput: Send + Sync {
    fn play_frame(&self, frame: &[u8]) -> bool;
    fn set_volume(&self, volume: u8);
    fn play_offline_alert_tone(&self, volume: u8) -> bool;
    fn stop_offline_alert_tone(&self);
}

#[derive(Debug, Clone)]
pub struct SpeakerConfig {
    /// Ring buffer size in bytes of compressed audio.
    pub buffer_size: usize,
    /// Occupancy at or below which UNDERRUN_WARNING is reported. Also
    /// the amount buffered before playback starts.
    pub underrun_warning_threshold: u64,
    /// Occupancy at or above which OVERRUN_WARNING is reported.
    pub overrun_warning_threshold: u64,
    /// Bytes handed to the platform per 20 ms push.
    pub frame_size: usize,
    pub initial_volume: u8,
}

impl Default for SpeakerConfig {
    fn default() -> Self {
        SpeakerConfig {
            buffer_size: 64 * 1024,
            underrun_warning_threshold: 4 * 1024,
            overrun_warning_threshold: 56 * 1024,
            frame_size: 1024,
            initial_volume: 50,
        }
    }
}

struct Inner {
    writer: DataStreamWriter,
    reader: DataStreamReader,
    state: PlaybackState,
    open_offset: u64,
    opened_event_emitted: bool,
    pending_close_offset: Option<u64>,
    pending_frame: Option<Vec<u8>>,
    actions: ActionSet,
    last_buffer_state: BufferState,
    volume: u8,
    last_speaker_sequence_number: u32,
    underruns_since_check: u32,
    offline_alert_active: bool,
    tick: Option<TaskHandle>,
}

/// Everything a tick decides while holding the lock, executed after it
/// is released: event emission and action callbacks must not run under
/// the engine mutex.
#[derive(Default)]
struct Effects {
    events: Vec<Message>,
    actions: Vec<(Box<dyn FnOnce(bool) + Send>, bool)>,
    sequencer_reset: Option<u32>,
}

pub struct SpeakerEngine {
    config: SpeakerConfig,
    inner: Mutex<Inner>,
    pool: TaskPool,
    audio: Arc<dyn AudioOutput>,
    emit_event: Box<dyn Fn(Message) -> bool + Send + Sync>,
    reset_sequencer: OnceCell<Box<dyn Fn(u32) + Send + Sync>>,
    stream: Arc<DataStream>,
}

impl SpeakerEngine {
    pub fn new(
        config: SpeakerConfig,
        audio: Arc<dyn AudioOutput>,
        pool: TaskPool,
        emit_event: impl Fn(Message) -> bool + Send + Sync + 'static,
    ) -> Result<Arc<Self>, SpeakerError> {
        if config.frame_size == 0 || config.buffer_size == 0 {
            return Err(SpeakerError::BadConfig("zero-sized buffer or frame"));
        }
        if config.overrun_warning_threshold as usize > config.buffer_size
            || config.underrun_warning_threshold >= config.overrun_warning_threshold
        {
            return Err(SpeakerError::BadConfig("thresholds out of order"));
        }
        if config.initial_volume > MAX_VOLUME {
            return Err(SpeakerError::BadConfig("volume above maximum"));
        }
        let stream = DataStream::create(config.buffer_size, 1, 1)
            .map_err(|_| SpeakerError::BadConfig("buffer allocation"))?;
        let writer = stream
            .create_writer(WriterPolicy::Nonblockable)
            .map_err(|_| SpeakerError::BadConfig("writer"))?;
        let reader = stream
            .create_reader(ReaderPolicy::Nonblocking)
            .map_err(|_| SpeakerError::BadConfig("reader"))?;
        Ok(Arc::new(SpeakerEngine {
            inner: Mutex::new(Inner {
                writer,
                reader,
                state: PlaybackState::Idle,
                open_offset: 0,
                opened_event_emitted: false,
                pending_close_offset: None,
                pending_frame: None,
                actions: ActionSet::default(),
                last_buffer_state: BufferState::None,
                volume: config.initial_volume,
                last_speaker_sequence_number: 0,
                underruns_since_check: 0,
                offline_alert_active: false,
                tick: None,
            }),
            config,
            pool,
            audio,
            emit_event: Box::new(emit_event),
            reset_sequencer: OnceCell::new(),
            stream,
        }))
    }

    /// Wires the hook used to re-sync the speaker sequencer after a
    /// terminal buffer reset. Called once during client assembly.
    pub fn set_sequencer_reset(&self, reset: impl Fn(u32) + Send + Sync + 'static) {
        let _ = self.reset_sequencer.set(Box::new(reset));
    }

    /// Accepts one sequenced speaker-topic message (the decrypted binary
    /// stream). Returns `false` when the stream is malformed.
    pub fn on_speaker_topic_message(&self, data: &[u8], sequence_number: u32) -> bool {
        let mut effects = Effects::default();
        let ok = {
            let mut inner = self.lock();
            inner.last_speaker_sequence_number = sequence_number;
            match BinaryMessage::parse_concatenated(data) {
                Err(e) => {
                    log::error!("Malformed speaker stream, sequenceNumber={sequence_number}: {e}");
                    false
                }
                Ok(messages) => {
                    let mut ok = true;
                    for message in &messages {
                        match message.stream_type() {
                            BINARY_STREAM_TYPE_AUDIO => {
                                if let Err(e) = inner.writer.write(message.data()) {
                                    log::error!("Speaker buffer write failed: {e}");
                                }
                            }
                            BINARY_STREAM_TYPE_MARKER => {
                                if message.data().len() >= 4 {
                                    let marker = u32::from_le_bytes(
                                        message.data()[..4].try_into().expect("4 bytes"),
                                    );
                                    effects.events.push(
                                        JsonMessage::new(
                                            events::SPEAKER_MARKER_ENCOUNTERED,
                                            Some(json!({ "marker": marker })),
                                        )
                                        .into(),
                                    );
                                } else {
                                    log::error!("Marker message too short");
                                    ok = false;
                                }
                            }
                            other => {
                                log::error!("Unknown speaker stream type {other}");
                                ok = false;
                            }
                        }
                    }
                    ok
                }
            }
        };
        self.apply(effects);
        ok
    }

    /// `OpenSpeaker{offset}`: position the stream and start buffering.
    pub fn handle_open_speaker(self: &Arc<Self>, payload: Option<&Value>) -> bool {
        let offset = match payload.and_then(|p| p.get("offset")).and_then(Value::as_u64) {
            Some(offset) => offset,
            None if payload.is_some() => 0,
            None => return false,
        };
        let mut inner = self.lock();
        log::info!("OpenSpeaker at offset {offset}");
        if let Err(e) = inner.reader.seek(offset as i64, SeekReference::Absolute) {
            // The requested offset fell out of the buffer; start from
            // the freshest data instead.
            log::warn!("OpenSpeaker seek failed ({e}); resuming at the writer");
            let _ = inner.reader.seek(0, SeekReference::BeforeWriter);
        }
        inner.state = PlaybackState::Buffering;
        inner.open_offset = offset;
        inner.opened_event_emitted = false;
        inner.pending_close_offset = None;
        inner.pending_frame = None;
        inner.last_buffer_state = BufferState::None;
        self.arm_tick(&mut inner);
        true
    }

    /// `CloseSpeaker{offset?}`: stop at the given stream offset, or
    /// immediately when none is given.
    pub fn handle_close_speaker(self: &Arc<Self>, payload: Option<&Value>) -> bool {
        let offset = payload.and_then(|p| p.get("offset")).and_then(Value::as_u64);
        let mut effects = Effects::default();
        {
            let mut inner = self.lock();
            match offset {
                Some(offset) if offset > current_offset(&inner) => {
                    log::info!("CloseSpeaker scheduled at offset {offset}");
                    inner.pending_close_offset = Some(offset);
                }
                _ => {
                    let at = offset.unwrap_or_else(|| current_offset(&inner));
                    self.close_locked(&mut inner, at, &mut effects);
                }
            }
        }
        self.apply(effects);
        true
    }

    /// `SetVolume{volume, offset?}`: apply now or when the stream
    /// reaches the given offset.
    pub fn handle_set_volume(self: &Arc<Self>, payload: Option<&Value>) -> bool {
        let Some(volume) = payload.and_then(|p| p.get("volume")).and_then(Value::as_u64) else {
            return false;
        };
        if volume > MAX_VOLUME as u64 {
            return false;
        }
        let volume = volume as u8;
        let offset = payload.and_then(|p| p.get("offset")).and_then(Value::as_u64);
        match offset {
            Some(offset) if offset > self.current_offset() => {
                let engine = Arc::downgrade(self);
                self.invoke_action_at_offset(offset, move |valid| {
                    if valid {
                        if let Some(engine) = engine.upgrade() {
                            engine.change_volume(volume);
                        }
                    }
                });
            }
            _ => {
                self.change_volume(volume);
            }
        }
        true
    }

    /// Sets an absolute volume, invoking the platform hook synchronously
    /// and reporting `VolumeChanged` with the offset it takes effect at.
    pub fn change_volume(&self, new_volume: u8) -> bool {
        if new_volume > MAX_VOLUME {
            log::error!("Volume {new_volume} out of range");
            return false;
        }
        let offset = {
            let mut inner = self.lock();
            inner.volume = new_volume;
            current_offset(&inner)
        };
        self.audio.set_volume(new_volume);
        self.emit(
            JsonMessage::new(
                events::VOLUME_CHANGED,
                Some(json!({ "volume": new_volume, "offset": offset })),
            )
            .into(),
        );
        true
    }

    /// Adjusts the volume by a signed delta, clamped to the valid range.
    pub fn adjust_volume(&self, delta: i8) -> bool {
        let current = self.lock().volume;
        let new_volume = (current as i16 + delta as i16).clamp(MIN_VOLUME as i16, MAX_VOLUME as i16);
        self.change_volume(new_volume as u8)
    }

    pub fn volume(&self) -> u8 {
        self.lock().volume
    }

    /// Registers `action` to fire when playback crosses `offset`. An
    /// already-crossed offset fires immediately with `valid = true`.
    pub fn invoke_action_at_offset(
        &self,
        offset: u64,
        action: impl FnOnce(bool) + Send + 'static,
    ) -> ActionHandle {
        let (handle, due) = {
            let mut inner = self.lock();
            let handle = inner.actions.insert(offset, action);
            let current = current_offset(&inner);
            let due = if offset <= current {
                inner.actions.take_due(current)
            } else {
                Vec::new()
            };
            (handle, due)
        };
        for action in due {
            action(true);
        }
        handle
    }

    pub fn cancel_action(&self, handle: ActionHandle) {
        self.lock().actions.cancel(handle);
    }

    /// Local stop (barge-in). Invalidates every pending action and
    /// returns to idle.
    pub fn stop_playback(&self) {
        let mut effects = Effects::default();
        {
            let mut inner = self.lock();
            for action in inner.actions.take_all() {
                effects.actions.push((action, false));
            }
            let at = current_offset(&inner);
            self.close_locked(&mut inner, at, &mut effects);
        }
        self.apply(effects);
    }

    /// The platform is ready for frames again after refusing one.
    pub fn on_speaker_ready(&self) {
        // The pending frame is retried on the next push tick.
        log::debug!("Speaker ready again");
    }

    /// Whether the speaker is streaming or about to stream.
    pub fn can_speaker_stream(&self) -> bool {
        self.lock().state != PlaybackState::Idle
    }

    /// Byte offset of the next frame the engine will emit.
    pub fn current_offset(&self) -> u64 {
        current_offset(&self.lock())
    }

    /// Underruns since this was last called; the alert manager polls it
    /// against the offline-alert limit.
    pub fn take_underruns_since_check(&self) -> u32 {
        std::mem::take(&mut self.lock().underruns_since_check)
    }

    /// Plays the offline alert tone while idle and disconnected.
    pub fn play_offline_alert(&self, volume: u8) -> bool {
        let mut inner = self.lock();
        if inner.state != PlaybackState::Idle {
            log::info!("Offline alert deferred; speaker busy");
            return false;
        }
        if inner.offline_alert_active {
            return true;
        }
        if !self.audio.play_offline_alert_tone(volume.min(MAX_VOLUME)) {
            log::error!("Offline alert tone failed to start");
            return false;
        }
        inner.offline_alert_active = true;
        true
    }

    pub fn stop_offline_alert(&self) {
        let mut inner = self.lock();
        if inner.offline_alert_active {
            self.audio.stop_offline_alert_tone();
            inner.offline_alert_active = false;
        }
    }

    fn arm_tick(self: &Arc<Self>, inner: &mut Inner) {
        if inner.tick.is_some() {
            return;
        }
        let engine: Weak<Self> = Arc::downgrade(self);
        inner.tick = Some(self.pool.schedule_periodic(FRAME_PUSH_CADENCE, move || {
            if let Some(engine) = engine.upgrade() {
                engine.tick();
            }
        }));
    }

    /// One frame push interval.
    fn tick(self: &Arc<Self>) {
        let mut effects = Effects::default();
        {
            let mut inner = self.lock();
            match inner.state {
                PlaybackState::Idle => return,
                PlaybackState::Buffering => {
                    let occupancy = occupancy(&inner);
                    let stream_complete = inner
                        .pending_close_offset
                        .map_or(false, |close| inner.writer.tell() >= close);
                    if occupancy >= self.config.underrun_warning_threshold || stream_complete {
                        log::info!("Speaker buffered ({occupancy} bytes), starting playback");
                        inner.state = PlaybackState::Playing;
                    } else {
                        return;
                    }
                }
                PlaybackState::Playing => {}
            }

            if let Some(close) = inner.pending_close_offset {
                if inner.reader.tell() >= close && inner.pending_frame.is_none() {
                    self.close_locked(&mut inner, close, &mut effects);
                }
            }
            if inner.state == PlaybackState::Playing {
                self.push_frame_locked(&mut inner, &mut effects);
            }
            let close_imminent = inner
                .pending_close_offset
                .map_or(false, |close| inner.reader.tell() >= close);
            if inner.state == PlaybackState::Playing && !close_imminent {
                let occupancy = occupancy(&inner);
                let state = self.classify(occupancy);
                self.publish_buffer_state(&mut inner, state, &mut effects);
            }
        }
        self.apply(effects);
    }

    fn push_frame_locked(self: &Arc<Self>, inner: &mut Inner, effects: &mut Effects) {
        let frame = match inner.pending_frame.take() {
            Some(frame) => Some(frame),
            None => match self.read_frame(inner) {
                FrameRead::Frame(frame) => Some(frame),
                FrameRead::Empty => {
                    self.on_terminal(inner, BufferState::Underrun, effects);
                    None
                }
                FrameRead::Overrun => {
                    self.on_terminal(inner, BufferState::Overrun, effects);
                    None
                }
            },
        };
        let Some(frame) = frame else { return };

        if self.audio.play_frame(&frame) {
            if !inner.opened_event_emitted {
                inner.opened_event_emitted = true;
                effects.events.push(
                    JsonMessage::new(
                        events::SPEAKER_OPENED,
                        Some(json!({ "offset": inner.open_offset })),
                    )
                    .into(),
                );
            }
            let reached = inner.reader.tell();
            for action in inner.actions.take_due(reached) {
                effects.actions.push((action, true));
            }
        } else {
            // The platform refused the frame; re-offer it next tick.
            inner.pending_frame = Some(frame);
        }
    }

    fn read_frame(&self, inner: &mut Inner) -> FrameRead {
        let mut limit = self.config.frame_size as u64;
        if let Some(close) = inner.pending_close_offset {
            limit = limit.min(close.saturating_sub(inner.reader.tell()));
        }
        if limit == 0 {
            return FrameRead::Empty;
        }
        let mut buf = vec![0u8; limit as usize];
        match inner.reader.read(&mut buf) {
            Ok(0) | Err(ReaderError::WouldBlock) => FrameRead::Empty,
            Ok(read) => {
                buf.truncate(read);
                FrameRead::Frame(buf)
            }
            Err(ReaderError::Overrun) => FrameRead::Overrun,
            Err(e) => {
                log::error!("Speaker buffer read failed: {e}");
                FrameRead::Empty
            }
        }
    }

    /// Terminal underrun/overrun: report it, reset the ring to the
    /// freshest data, re-sync the sequencer and drop back to buffering.
    fn on_terminal(&self, inner: &mut Inner, state: BufferState, effects: &mut Effects) {
        if state == BufferState::Underrun {
            inner.underruns_since_check += 1;
        }
        self.publish_buffer_state(inner, state, effects);
        let _ = inner.reader.seek(0, SeekReference::BeforeWriter);
        effects.sequencer_reset = Some(inner.last_speaker_sequence_number.wrapping_add(1));
        inner.state = PlaybackState::Buffering;
    }

    fn classify(&self, occupancy: u64) -> BufferState {
        if occupancy == 0 {
            BufferState::Underrun
        } else if occupancy >= self.stream.data_size() {
            BufferState::Overrun
        } else if occupancy >= self.config.overrun_warning_threshold {
            BufferState::OverrunWarning
        } else if occupancy <= self.config.underrun_warning_threshold {
            BufferState::UnderrunWarning
        } else {
            BufferState::None
        }
    }

    /// Emits `BufferStateChanged` only when the state moved.
    fn publish_buffer_state(&self, inner: &mut Inner, state: BufferState, effects: &mut Effects) {
        if state == inner.last_buffer_state {
            return;
        }
        log::info!(
            "Speaker buffer {} -> {}",
            inner.last_buffer_state.as_str(),
            state.as_str()
        );
        inner.last_buffer_state = state;
        effects.events.push(
            JsonMessage::new(
                events::BUFFER_STATE_CHANGED,
                Some(json!({
                    "state": state.as_str(),
                    "sequenceNumber": inner.last_speaker_sequence_number,
                })),
            )
            .into(),
        );
    }

    fn close_locked(&self, inner: &mut Inner, offset: u64, effects: &mut Effects) {
        if inner.state == PlaybackState::Idle {
            return;
        }
        log::info!("Speaker closed at offset {offset}");
        inner.state = PlaybackState::Idle;
        inner.pending_close_offset = None;
        inner.pending_frame = None;
        if let Some(tick) = inner.tick.take() {
            self.pool.cancel(tick);
        }
        effects.events.push(
            JsonMessage::new(events::SPEAKER_CLOSED, Some(json!({ "offset": offset }))).into(),
        );
    }

    fn apply(&self, effects: Effects) {
        for event in effects.events {
            self.emit(event);
        }
        for (action, valid) in effects.actions {
            action(valid);
        }
        if let Some(next_expected) = effects.sequencer_reset {
            if let Some(reset) = self.reset_sequencer.get() {
                reset(next_expected);
            }
        }
    }

    fn emit(&self, message: Message) {
        if !(self.emit_event)(message) {
            log::error!("Failed to emit speaker event");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

enum FrameRead {
    Frame(Vec<u8>),
    Empty,
    Overrun,
}

/// Unplayed bytes, counting a frame the platform has not yet accepted.
fn occupancy(inner: &Inner) -> u64 {
    inner.writer.tell().saturating_sub(current_offset(inner))
}

/// Offset of the next byte the engine will emit, accounting for a frame
/// read but not yet accepted by the platform.
fn current_offset(inner: &Inner) -> u64 {
    inner
        .reader
        .tell()
        .saturating_sub(inner.pending_frame.as_ref().map_or(0, |f| f.len() as u64))
}
