//! UX state derivation.
//!
//! The device-visible UX state combines the service's attention state
//! (`SetAttentionState` directive) with local microphone and alert
//! activity: an open microphone always shows LISTENING, and a ringing
//! alert shows ALERTING unless the user enabled Do Not Disturb.

use std::sync::Mutex;

use serde_json::Value;

/// Attention state as the service reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionState {
    Idle,
    Thinking,
    Speaking,
    Alerting,
    NotificationAvailable,
    DoNotDisturb,
}

impl AttentionState {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "IDLE" => Some(Self::Idle),
            "THINKING" => Some(Self::Thinking),
            "SPEAKING" => Some(Self::Speaking),
            "ALERTING" => Some(Self::Alerting),
            "NOTIFICATION_AVAILABLE" => Some(Self::NotificationAvailable),
            "DO_NOT_DISTURB" => Some(Self::DoNotDisturb),
            _ => None,
        }
    }
}

/// What the device should present to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UXState {
    Idle,
    Listening,
    Thinking,
    Speaking,
    Alerting,
    NotificationAvailable,
    DoNotDisturb,
}

impl UXState {
    pub fn as_str(self) -> &'static str {
        match self {
            UXState::Idle => "IDLE",
            UXState::Listening => "LISTENING",
            UXState::Thinking => "THINKING",
            UXState::Speaking => "SPEAKING",
            UXState::Alerting => "ALERTING",
            UXState::NotificationAvailable => "NOTIFICATION_AVAILABLE",
            UXState::DoNotDisturb => "DO_NOT_DISTURB",
        }
    }
}

struct Inner {
    attention: AttentionState,
    microphone_open: bool,
    alert_active: bool,
    last_published: UXState,
}

pub struct UXManager {
    inner: Mutex<Inner>,
    observer: Box<dyn Fn(UXState) + Send + Sync>,
}

impl UXManager {
    pub fn new(observer: impl Fn(UXState) + Send + Sync + 'static) -> Self {
        UXManager {
            inner: Mutex::new(Inner {
                attention: AttentionState::Idle,
                microphone_open: false,
                alert_active: false,
                last_published: UXState::Idle,
            }),
            observer: Box::new(observer),
        }
    }

    pub fn state(&self) -> UXState {
        derive(&self.lock())
    }

    /// `SetAttentionState{state}` directive handler.
    pub fn handle_set_attention_state(&self, payload: Option<&Value>) -> bool {
        let Some(state) = payload
            .and_then(|p| p.get("state"))
            .and_then(Value::as_str)
            .and_then(AttentionState::from_str)
        else {
            return false;
        };
        self.update(|inner| inner.attention = state);
        true
    }

    /// Local microphone opened or closed.
    pub fn set_microphone_open(&self, open: bool) {
        self.update(|inner| inner.microphone_open = open);
    }

    /// A local alert started or stopped sounding.
    pub fn set_alert_active(&self, active: bool) {
        self.update(|inner| inner.alert_active = active);
    }

    fn update(&self, mutate: impl FnOnce(&mut Inner)) {
        let changed = {
            let mut inner = self.lock();
            mutate(&mut inner);
            let state = derive(&inner);
            if state != inner.last_published {
                inner.last_published = state;
                Some(state)
            } else {
                None
            }
        };
        if let Some(state) = changed {
            log::info!("UX state -> {}", state.as_str());
            (self.observer)(state);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn derive(inner: &Inner) -> UXState {
    if inner.microphone_open {
        return UXState::Listening;
    }
    if inner.alert_active && inner.attention != AttentionState::DoNotDisturb {
        return UXState::Alerting;
    }
    match inner.attention {
        AttentionState::Idle => UXState::Idle,
        AttentionState::Thinking => UXState::Thinking,
        AttentionState::Speaking => UXState::Speaking,
        AttentionState::Alerting => UXState::Alerting,
        AttentionState::NotificationAvailable => UXState::NotificationAvailable,
        AttentionState::DoNotDisturb => UXState::DoNotDisturb,
    }
}
