//! Local playback-control buttons.

use std::sync::Arc;

use serde_json::json;

use crate::events;
use crate::message::{JsonMessage, Message};
use crate::speaker::SpeakerEngine;

/// Physical or GUI playback buttons reported to the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonCommand {
    Play,
    Pause,
    Next,
    Previous,
    Stop,
}

impl ButtonCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            ButtonCommand::Play => "PLAY",
            ButtonCommand::Pause => "PAUSE",
            ButtonCommand::Next => "NEXT",
            ButtonCommand::Previous => "PREVIOUS",
            ButtonCommand::Stop => "STOP",
        }
    }
}

/// Publishes `ButtonCommandIssued` events. STOP and PAUSE also stop
/// local playback immediately rather than waiting for the service to
/// close the speaker.
pub struct ButtonCommandSender {
    emit_event: Box<dyn Fn(Message) -> bool + Send + Sync>,
    speaker: Option<Arc<SpeakerEngine>>,
}

impl ButtonCommandSender {
    pub fn new(
        emit_event: impl Fn(Message) -> bool + Send + Sync + 'static,
        speaker: Option<Arc<SpeakerEngine>>,
    ) -> Self {
        ButtonCommandSender {
            emit_event: Box::new(emit_event),
            speaker,
        }
    }

    pub fn on_button_pressed(&self, command: ButtonCommand) -> bool {
        log::info!("Button pressed: {}", command.as_str());
        if matches!(command, ButtonCommand::Stop | ButtonCommand::Pause) {
            if let Some(speaker) = &self.speaker {
                speaker.stop_playback();
            }
        }
        let event = JsonMessage::new(
            events::BUTTON_COMMAND_ISSUED,
            Some(json!({ "command": command.as_str() })),
        );
        if !(self.emit_event)(event.into()) {
            log::error!("Failed to emit ButtonCommandIssued");
            return false;
        }
        true
    }
}
