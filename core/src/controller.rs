//! Bridges a microphone capability to an open conversation session.
//!
//! Acquisition is asynchronous on every platform, so the controller splits it
//! in two: [`ConversationController::start_conversation`] decides whether to
//! ask for the microphone, and the binding reports back through
//! [`ConversationController::media_acquired`] or
//! [`ConversationController::media_denied`].

use std::collections::VecDeque;

use tracing::{debug, info};

use crate::codec::Frame;
use crate::errors::MediaAccessError;
use crate::models::Message;
use crate::session::SessionState;

/// Acquired media: microphone tracks plus any processing graph built on them.
pub trait MediaResource {
    /// Stops every track and tears down processing. Must be idempotent.
    fn release(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConstraints {
    pub sample_rate: u32,
    pub channel_count: u16,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channel_count: 1,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControllerState {
    #[default]
    Inactive,
    Acquiring,
    Active,
}

pub struct ConversationController<R: MediaResource> {
    state: ControllerState,
    resource: Option<R>,
    constraints: AudioConstraints,
    messages: VecDeque<Message>,
}

impl<R: MediaResource> ConversationController<R> {
    pub fn new() -> Self {
        Self::with_constraints(AudioConstraints::default())
    }

    pub fn with_constraints(constraints: AudioConstraints) -> Self {
        Self {
            state: ControllerState::Inactive,
            resource: None,
            constraints,
            messages: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == ControllerState::Active
    }

    pub fn holds_media(&self) -> bool {
        self.resource.is_some()
    }

    /// Returns the constraints to acquire the microphone with, or `None` when
    /// the session is not open or a conversation is already running.
    pub fn start_conversation(&mut self, session: SessionState) -> Option<AudioConstraints> {
        if session != SessionState::Open || self.state != ControllerState::Inactive {
            debug!(%session, state = ?self.state, "Cannot start conversation");
            return None;
        }
        self.state = ControllerState::Acquiring;
        Some(self.constraints)
    }

    pub fn media_acquired(&mut self, mut resource: R, session: SessionState) {
        if self.state != ControllerState::Acquiring {
            // Stopped while the permission prompt was up.
            resource.release();
            return;
        }
        if session != SessionState::Open {
            resource.release();
            self.state = ControllerState::Inactive;
            self.messages
                .push_back(Message::system("Conversation cancelled: not connected"));
            return;
        }

        info!("Conversation started");
        self.resource = Some(resource);
        self.state = ControllerState::Active;
        self.messages.push_back(Message::system(
            "Conversation started! You can now talk naturally with the AI.",
        ));
    }

    pub fn media_denied(&mut self, err: MediaAccessError) {
        if self.state != ControllerState::Acquiring {
            return;
        }
        self.state = ControllerState::Inactive;
        self.messages.push_back(Message::error(format!(
            "Failed to start conversation. Please check microphone permissions. ({err})"
        )));
    }

    /// Releases all media unconditionally.
    pub fn stop_conversation(&mut self) {
        let was_active = self.is_active();
        self.release();
        self.state = ControllerState::Inactive;
        if was_active {
            info!("Conversation stopped");
            self.messages.push_back(Message::system("Conversation stopped."));
        }
    }

    /// Must be called on every session transition; media never outlives `Open`.
    pub fn session_state_changed(&mut self, session: SessionState) {
        if session == SessionState::Open || self.state == ControllerState::Inactive {
            return;
        }
        let was_active = self.is_active();
        self.release();
        self.state = ControllerState::Inactive;
        if was_active {
            self.messages
                .push_back(Message::system("Conversation ended: connection closed."));
        }
    }

    /// Wraps captured audio for the session while a conversation is running.
    pub fn outbound_audio(&self, chunk: Vec<u8>) -> Option<Frame> {
        self.is_active().then(|| Frame::Binary(chunk))
    }

    pub fn take_messages(&mut self) -> Vec<Message> {
        self.messages.drain(..).collect()
    }

    fn release(&mut self) {
        if let Some(mut resource) = self.resource.take() {
            resource.release();
        }
    }
}

impl<R: MediaResource> Default for ConversationController<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: MediaResource> Drop for ConversationController<R> {
    fn drop(&mut self) {
        self.release();
    }
}
