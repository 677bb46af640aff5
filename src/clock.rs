//! Device clock synchronisation with the service.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use serde_json::{json, Value};

use crate::events;
use crate::message::{JsonMessage, Message};

/// Seam to the device's real-time clock. Alert scheduling and `SetClock`
/// both go through it.
pub trait AlertClock: Send + Sync {
    /// Seconds since the Unix epoch.
    fn now_seconds(&self) -> u64;
    /// Applies service-provided time.
    fn set_time(&self, seconds_since_epoch: u64);
}

/// System-clock implementation; `set_time` only records the skew since
/// most platforms do not let a process set the wall clock.
#[derive(Default)]
pub struct SystemClock {
    skew: std::sync::atomic::AtomicI64,
}

impl AlertClock for SystemClock {
    fn now_seconds(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        (now + self.skew.load(std::sync::atomic::Ordering::SeqCst)).max(0) as u64
    }

    fn set_time(&self, seconds_since_epoch: u64) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.skew
            .store(seconds_since_epoch as i64 - now, std::sync::atomic::Ordering::SeqCst);
    }
}

pub struct ClockManager {
    clock: Arc<dyn AlertClock>,
    emit_event: Box<dyn Fn(Message) -> bool + Send + Sync>,
}

impl ClockManager {
    pub fn new(
        clock: Arc<dyn AlertClock>,
        emit_event: impl Fn(Message) -> bool + Send + Sync + 'static,
    ) -> Self {
        ClockManager {
            clock,
            emit_event: Box::new(emit_event),
        }
    }

    /// Asks the service for the current time.
    pub fn synchronize(&self) -> bool {
        let event = JsonMessage::new(events::SYNCHRONIZE_CLOCK, Some(json!({})));
        if !(self.emit_event)(event.into()) {
            log::error!("Failed to emit SynchronizeClock");
            return false;
        }
        true
    }

    /// `SetClock{currentTime}` directive handler.
    pub fn handle_set_clock(&self, payload: Option<&Value>) -> bool {
        let Some(current_time) = payload
            .and_then(|p| p.get("currentTime"))
            .and_then(Value::as_u64)
        else {
            return false;
        };
        self.clock.set_time(current_time);
        match Utc.timestamp_opt(current_time as i64, 0).single() {
            Some(when) => log::info!("Clock set to {when}"),
            None => log::info!("Clock set to {current_time}s since epoch"),
        }
        true
    }
}
