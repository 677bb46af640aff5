//! Alert (timer/alarm/reminder) management.
//!
//! Alerts arrive via `SetAlert`/`DeleteAlert` directives, persist as
//! fixed 17-byte records so they survive power cycles, and expire 1800
//! seconds past their scheduled time. While disconnected, a periodic
//! status check renders due alerts through the speaker engine's offline
//! tone; while connected, the same check counts speaker underruns and
//! forces the connection offline when audio cannot keep up.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::clock::AlertClock;
use crate::events;
use crate::message::{JsonMessage, Message};
use crate::speaker::SpeakerEngine;
use crate::storage::{self, KeyValueStore, ALERTS_KEY, ALERT_VOLUME_KEY};
use crate::tasks::{TaskHandle, TaskPool};

/// Characters in an alert token.
pub const ALERT_TOKEN_CHARS: usize = 8;

/// How long past its scheduled time an alert stays deliverable.
pub const ALERT_EXPIRATION_DURATION: Duration = Duration::from_secs(1800);

/// Cadence of the offline/underrun status check.
pub const OFFLINE_ALERT_STATUS_CHECK_CADENCE: Duration = Duration::from_millis(4000);

/// Underruns within one status-check window that force the device
/// offline.
pub const SPEAKER_STATUS_UNDERRUN_LIMIT: u32 = 4;

/// Volume used for offline alert playback when none was persisted.
pub const DEFAULT_OFFLINE_ALERT_VOLUME: u8 = 50;

/// Persisted alert record: tag byte, 8 token chars, 4-byte scheduled
/// time, 4-byte duration.
pub const ALERT_RECORD_SIZE: usize = 1 + ALERT_TOKEN_CHARS + 4 + 4;

#[derive(Error, Debug)]
pub enum AlertError {
    #[error("Alert token must be exactly {ALERT_TOKEN_CHARS} characters")]
    BadToken,
    #[error("Unknown alert type: {0}")]
    UnknownType(String),
    #[error("Alert record is corrupt")]
    CorruptRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertType {
    Timer,
    Alarm,
    Reminder,
}

impl AlertType {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertType::Timer => "TIMER",
            AlertType::Alarm => "ALARM",
            AlertType::Reminder => "REMINDER",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, AlertError> {
        match s {
            "TIMER" => Ok(AlertType::Timer),
            "ALARM" => Ok(AlertType::Alarm),
            "REMINDER" => Ok(AlertType::Reminder),
            other => Err(AlertError::UnknownType(other.to_string())),
        }
    }

    fn storage_tag(self) -> u8 {
        match self {
            AlertType::Timer => 0,
            AlertType::Alarm => 1,
            AlertType::Reminder => 2,
        }
    }

    fn from_storage_tag(tag: u8) -> Result<Self, AlertError> {
        match tag {
            0 => Ok(AlertType::Timer),
            1 => Ok(AlertType::Alarm),
            2 => Ok(AlertType::Reminder),
            _ => Err(AlertError::CorruptRecord),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub token: String,
    pub alert_type: AlertType,
    pub scheduled_time_s: u64,
    pub duration_ms: u32,
}

impl Alert {
    pub fn new(
        token: &str,
        alert_type: AlertType,
        scheduled_time_s: u64,
        duration_ms: u32,
    ) -> Result<Self, AlertError> {
        if token.len() != ALERT_TOKEN_CHARS || !token.is_ascii() {
            return Err(AlertError::BadToken);
        }
        Ok(Alert {
            token: token.to_string(),
            alert_type,
            scheduled_time_s,
            duration_ms,
        })
    }

    /// Whether the alert is past its deliverable window at `now`.
    pub fn is_expired(&self, now_s: u64) -> bool {
        now_s >= self.scheduled_time_s + ALERT_EXPIRATION_DURATION.as_secs()
    }

    /// Whether the alert should be sounding at `now`.
    pub fn is_due(&self, now_s: u64) -> bool {
        now_s >= self.scheduled_time_s && !self.is_expired(now_s)
    }

    pub fn encode(&self) -> [u8; ALERT_RECORD_SIZE] {
        let mut record = [0u8; ALERT_RECORD_SIZE];
        record[0] = self.alert_type.storage_tag();
        record[1..1 + ALERT_TOKEN_CHARS].copy_from_slice(self.token.as_bytes());
        record[9..13].copy_from_slice(&(self.scheduled_time_s as u32).to_le_bytes());
        record[13..17].copy_from_slice(&self.duration_ms.to_le_bytes());
        record
    }

    pub fn decode(record: &[u8]) -> Result<Self, AlertError> {
        if record.len() != ALERT_RECORD_SIZE {
            return Err(AlertError::CorruptRecord);
        }
        let alert_type = AlertType::from_storage_tag(record[0])?;
        let token = std::str::from_utf8(&record[1..1 + ALERT_TOKEN_CHARS])
            .map_err(|_| AlertError::CorruptRecord)?
            .to_string();
        let scheduled_time_s = u32::from_le_bytes(record[9..13].try_into().expect("4 bytes")) as u64;
        let duration_ms = u32::from_le_bytes(record[13..17].try_into().expect("4 bytes"));
        Ok(Alert {
            token,
            alert_type,
            scheduled_time_s,
            duration_ms,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AlertManagerConfig {
    pub max_alerts: usize,
    /// Production value is [`OFFLINE_ALERT_STATUS_CHECK_CADENCE`].
    pub status_check_cadence: Duration,
}

impl Default for AlertManagerConfig {
    fn default() -> Self {
        AlertManagerConfig {
            max_alerts: 16,
            status_check_cadence: OFFLINE_ALERT_STATUS_CHECK_CADENCE,
        }
    }
}

struct Inner {
    alerts: Vec<Alert>,
    alert_volume: u8,
    offline_alert_token: Option<String>,
    check_task: Option<TaskHandle>,
}

pub struct AlertManager {
    config: AlertManagerConfig,
    inner: Mutex<Inner>,
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn AlertClock>,
    pool: TaskPool,
    emit_event: Box<dyn Fn(Message) -> bool + Send + Sync>,
    speaker: Option<Arc<SpeakerEngine>>,
    is_connected: Box<dyn Fn() -> bool + Send + Sync>,
    go_offline: Box<dyn Fn() + Send + Sync>,
    on_alert_active: Box<dyn Fn(bool) + Send + Sync>,
}

impl AlertManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AlertManagerConfig,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn AlertClock>,
        pool: TaskPool,
        speaker: Option<Arc<SpeakerEngine>>,
        emit_event: impl Fn(Message) -> bool + Send + Sync + 'static,
        is_connected: impl Fn() -> bool + Send + Sync + 'static,
        go_offline: impl Fn() + Send + Sync + 'static,
        on_alert_active: impl Fn(bool) + Send + Sync + 'static,
    ) -> Arc<Self> {
        let now = clock.now_seconds();
        let alerts = load_alerts(store.as_ref(), now);
        let alert_volume = storage::load_volume(store.as_ref(), ALERT_VOLUME_KEY)
            .unwrap_or(None)
            .unwrap_or(DEFAULT_OFFLINE_ALERT_VOLUME);
        let manager = Arc::new(AlertManager {
            config,
            inner: Mutex::new(Inner {
                alerts,
                alert_volume,
                offline_alert_token: None,
                check_task: None,
            }),
            store,
            clock,
            pool,
            emit_event: Box::new(emit_event),
            speaker,
            is_connected: Box::new(is_connected),
            go_offline: Box::new(go_offline),
            on_alert_active: Box::new(on_alert_active),
        });
        let weak = Arc::downgrade(&manager);
        let task = manager
            .pool
            .schedule_periodic(manager.config.status_check_cadence, move || {
                if let Some(manager) = Weak::upgrade(&weak) {
                    manager.status_check();
                }
            });
        manager.lock().check_task = Some(task);
        manager
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.lock().alerts.clone()
    }

    pub fn alert_volume(&self) -> u8 {
        self.lock().alert_volume
    }

    /// `SetAlert{token, type, scheduledTime, durationInMilliseconds}`.
    pub fn handle_set_alert(&self, payload: Option<&Value>) -> bool {
        let alert = payload.and_then(parse_alert_payload);
        let Some(alert) = alert else {
            let token = payload
                .and_then(|p| p.get("token"))
                .and_then(Value::as_str)
                .unwrap_or("");
            self.emit(
                JsonMessage::new(events::SET_ALERT_FAILED, Some(json!({ "token": token }))).into(),
            );
            return false;
        };
        let token = alert.token.clone();
        let stored = {
            let mut inner = self.lock();
            inner.alerts.retain(|existing| existing.token != alert.token);
            if inner.alerts.len() >= self.config.max_alerts {
                log::error!("Alert store full ({} alerts)", inner.alerts.len());
                false
            } else {
                inner.alerts.push(alert);
                persist_alerts(self.store.as_ref(), &inner.alerts)
            }
        };
        let event = if stored {
            events::SET_ALERT_SUCCEEDED
        } else {
            events::SET_ALERT_FAILED
        };
        self.emit(JsonMessage::new(event, Some(json!({ "token": token }))).into());
        stored
    }

    /// `DeleteAlert{token}`.
    pub fn handle_delete_alert(&self, payload: Option<&Value>) -> bool {
        let Some(token) = payload.and_then(|p| p.get("token")).and_then(Value::as_str) else {
            self.emit(
                JsonMessage::new(events::DELETE_ALERT_FAILED, Some(json!({ "token": "" }))).into(),
            );
            return false;
        };
        let deleted = {
            let mut inner = self.lock();
            let before = inner.alerts.len();
            inner.alerts.retain(|alert| alert.token != token);
            if inner.alerts.len() != before {
                persist_alerts(self.store.as_ref(), &inner.alerts)
            } else {
                log::warn!("DeleteAlert for unknown token {token:?}");
                false
            }
        };
        let event = if deleted {
            events::DELETE_ALERT_SUCCEEDED
        } else {
            events::DELETE_ALERT_FAILED
        };
        self.emit(JsonMessage::new(event, Some(json!({ "token": token }))).into());
        deleted
    }

    /// `SetAlertVolume{volume}`.
    pub fn handle_set_alert_volume(&self, payload: Option<&Value>) -> bool {
        let Some(volume) = payload.and_then(|p| p.get("volume")).and_then(Value::as_u64) else {
            return false;
        };
        if volume > 100 {
            return false;
        }
        let volume = volume as u8;
        self.lock().alert_volume = volume;
        if let Err(e) = storage::store_volume(self.store.as_ref(), ALERT_VOLUME_KEY, volume) {
            log::error!("Failed to persist alert volume: {e}");
        }
        self.emit(
            JsonMessage::new(
                events::ALERT_VOLUME_CHANGED,
                Some(json!({ "volume": volume })),
            )
            .into(),
        );
        true
    }

    /// User dismissed the locally sounding alert.
    pub fn stop_local_alert(&self) {
        let stopped = {
            let mut inner = self.lock();
            match inner.offline_alert_token.take() {
                Some(token) => {
                    inner.alerts.retain(|alert| alert.token != token);
                    persist_alerts(self.store.as_ref(), &inner.alerts);
                    true
                }
                None => false,
            }
        };
        if stopped {
            if let Some(speaker) = &self.speaker {
                speaker.stop_offline_alert();
            }
            (self.on_alert_active)(false);
        }
    }

    /// Periodic status check: offline alert rendering and the
    /// underrun-limit escalation.
    fn status_check(&self) {
        let now = self.clock.now_seconds();
        self.drop_expired(now);

        if (self.is_connected)() {
            // Connected again: the service owns alert rendering.
            let was_sounding = self.lock().offline_alert_token.take().is_some();
            if was_sounding {
                if let Some(speaker) = &self.speaker {
                    speaker.stop_offline_alert();
                }
                (self.on_alert_active)(false);
            }
            if let Some(speaker) = &self.speaker {
                let underruns = speaker.take_underruns_since_check();
                if underruns >= SPEAKER_STATUS_UNDERRUN_LIMIT {
                    log::warn!(
                        "{underruns} speaker underruns inside one status window; going offline"
                    );
                    (self.go_offline)();
                }
            }
            return;
        }

        // Disconnected: render a due alert locally.
        let (due, volume) = {
            let inner = self.lock();
            if inner.offline_alert_token.is_some() {
                return;
            }
            (
                inner.alerts.iter().find(|a| a.is_due(now)).cloned(),
                inner.alert_volume,
            )
        };
        if let (Some(alert), Some(speaker)) = (due, &self.speaker) {
            log::info!(
                "Offline alert {} ({}) due; sounding",
                alert.token,
                alert.alert_type.as_str()
            );
            if speaker.play_offline_alert(volume) {
                self.lock().offline_alert_token = Some(alert.token);
                (self.on_alert_active)(true);
            }
        }
    }

    fn drop_expired(&self, now: u64) {
        let mut inner = self.lock();
        let before = inner.alerts.len();
        inner.alerts.retain(|alert| !alert.is_expired(now));
        if inner.alerts.len() != before {
            log::info!("Dropped {} expired alerts", before - inner.alerts.len());
            persist_alerts(self.store.as_ref(), &inner.alerts);
        }
    }

    fn emit(&self, message: Message) {
        if !(self.emit_event)(message) {
            log::error!("Failed to emit alert event");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for AlertManager {
    fn drop(&mut self) {
        if let Some(task) = self.lock().check_task.take() {
            self.pool.cancel(task);
        }
    }
}

#[derive(Deserialize)]
struct SetAlertPayload {
    token: String,
    #[serde(rename = "type")]
    alert_type: String,
    #[serde(rename = "scheduledTime")]
    scheduled_time: u64,
    #[serde(rename = "durationInMilliseconds", default)]
    duration_ms: u32,
}

fn parse_alert_payload(payload: &Value) -> Option<Alert> {
    let payload: SetAlertPayload = serde_json::from_value(payload.clone()).ok()?;
    let alert_type = AlertType::from_str(&payload.alert_type).ok()?;
    Alert::new(
        &payload.token,
        alert_type,
        payload.scheduled_time,
        payload.duration_ms,
    )
    .ok()
}

fn load_alerts(store: &dyn KeyValueStore, now: u64) -> Vec<Alert> {
    let Ok(Some(blob)) = store.load_blob(ALERTS_KEY) else {
        return Vec::new();
    };
    if blob.len() % ALERT_RECORD_SIZE != 0 {
        log::error!("Alert storage corrupt ({} bytes); discarding", blob.len());
        return Vec::new();
    }
    let mut alerts = Vec::new();
    for record in blob.chunks_exact(ALERT_RECORD_SIZE) {
        match Alert::decode(record) {
            Ok(alert) if alert.is_expired(now) => {
                log::info!("Dropping expired alert {}", alert.token);
            }
            Ok(alert) => alerts.push(alert),
            Err(e) => log::error!("Skipping corrupt alert record: {e}"),
        }
    }
    alerts
}

fn persist_alerts(store: &dyn KeyValueStore, alerts: &[Alert]) -> bool {
    let mut blob = Vec::with_capacity(alerts.len() * ALERT_RECORD_SIZE);
    for alert in alerts {
        blob.extend_from_slice(&alert.encode());
    }
    match store.store_blob(ALERTS_KEY, &blob) {
        Ok(()) => true,
        Err(e) => {
            log::error!("Failed to persist alerts: {e}");
            false
        }
    }
}
