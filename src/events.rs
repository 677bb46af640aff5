//! Event names published by the device.

pub const SECRET_ROTATED: &str = "SecretRotated";
pub const BUTTON_COMMAND_ISSUED: &str = "ButtonCommandIssued";
pub const SPEAKER_OPENED: &str = "SpeakerOpened";
pub const SPEAKER_CLOSED: &str = "SpeakerClosed";
pub const SPEAKER_MARKER_ENCOUNTERED: &str = "SpeakerMarkerEncountered";
pub const MICROPHONE_OPENED: &str = "MicrophoneOpened";
pub const MICROPHONE_CLOSED: &str = "MicrophoneClosed";
pub const OPEN_MICROPHONE_TIMED_OUT: &str = "OpenMicrophoneTimedOut";
pub const BUFFER_STATE_CHANGED: &str = "BufferStateChanged";
pub const VOLUME_CHANGED: &str = "VolumeChanged";
pub const SYNCHRONIZE_CLOCK: &str = "SynchronizeClock";
pub const SET_ALERT_SUCCEEDED: &str = "SetAlertSucceeded";
pub const SET_ALERT_FAILED: &str = "SetAlertFailed";
pub const DELETE_ALERT_SUCCEEDED: &str = "DeleteAlertSucceeded";
pub const DELETE_ALERT_FAILED: &str = "DeleteAlertFailed";
pub const ALERT_VOLUME_CHANGED: &str = "AlertVolumeChanged";
pub const SYNCHRONIZE_STATE: &str = "SynchronizeState";
pub const EXCEPTION_ENCOUNTERED: &str = "ExceptionEncountered";
