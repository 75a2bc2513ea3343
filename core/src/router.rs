//! Inbound frame classification for the main conversation channel.
//!
//! Frames are classified by transport encoding first (binary vs. text), then
//! text frames are parsed and dispatched on their `type` discriminator. Nothing
//! is dropped: whatever cannot be classified becomes a `system` message.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::codec::{format_delay, Frame, FrameCodec, Notice};
use crate::errors::ProtocolError;
use crate::models::Message;

/// Text events pushed by the backend. Internally tagged on `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerEvent {
    Transcription {
        #[serde(default)]
        text: Option<String>,
    },
    LlmResponse {
        #[serde(default)]
        text: Option<String>,
    },
    ChatResponse {
        #[serde(default)]
        text: Option<String>,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    System {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        text: Option<String>,
    },
    Status {
        #[serde(default)]
        message: Option<String>,
    },
}

/// Events the client sends on the conversation channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Chat { text: String },
}

fn non_empty(text: Option<String>) -> Option<String> {
    text.filter(|t| !t.is_empty())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MessageRouter;

impl MessageRouter {
    pub fn new() -> Self {
        Self
    }

    /// Turns one inbound frame into exactly one message.
    pub fn route(&self, frame: Frame) -> Message {
        match frame {
            // Audio is played by the transport layer; only acknowledge it here.
            Frame::Binary(bytes) => {
                Message::system(format!("Audio data received ({} bytes)", bytes.len()))
            }
            Frame::Text(text) => self.route_text(&text),
        }
    }

    fn route_text(&self, text: &str) -> Message {
        let doc: Value = match serde_json::from_str(text) {
            Ok(doc) => doc,
            Err(e) => {
                debug!("Treating non-JSON frame as plain text: {e}");
                return Message::system(format!("System: {text}"));
            }
        };

        let routed = ServerEvent::deserialize(&doc)
            .ok()
            .and_then(|event| self.dispatch(event));

        routed.unwrap_or_else(|| {
            debug!("Unhandled frame: {doc}");
            Message::system(format!("System: {doc}"))
        })
    }

    fn dispatch(&self, event: ServerEvent) -> Option<Message> {
        match event {
            ServerEvent::Transcription { text } => non_empty(text).map(Message::transcription),
            ServerEvent::LlmResponse { text } | ServerEvent::ChatResponse { text } => {
                non_empty(text).map(Message::assistant)
            }
            ServerEvent::Error { message } => Some(Message::error(
                non_empty(message).unwrap_or_else(|| "Unknown error".to_string()),
            )),
            ServerEvent::System { message, text } => Some(Message::system(
                non_empty(message)
                    .or_else(|| non_empty(text))
                    .unwrap_or_else(|| "System message".to_string()),
            )),
            ServerEvent::Status { message } => non_empty(message).map(Message::system),
        }
    }
}

/// Codec for the main conversation channel: routes frames to [`Message`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConversationCodec {
    router: MessageRouter,
}

impl ConversationCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FrameCodec for ConversationCodec {
    type Inbound = Message;
    type Outbound = ClientEvent;

    fn decode(&self, frame: Frame) -> Option<Message> {
        Some(self.router.route(frame))
    }

    fn encode(&self, event: &ClientEvent) -> Result<Frame, ProtocolError> {
        serde_json::to_string(event)
            .map(Frame::Text)
            .map_err(ProtocolError::Encode)
    }

    fn notice(&self, notice: &Notice) -> Message {
        match notice {
            Notice::Connected { user_id, .. } => {
                Message::system(format!("Connected to voice assistant as user: {user_id}"))
            }
            Notice::Disconnected { .. } => Message::system("Disconnected from voice assistant"),
            Notice::TransportError { detail, .. } if detail.is_empty() => {
                Message::error("Connection error occurred")
            }
            Notice::TransportError { detail, .. } => {
                Message::error(format!("Connection error occurred: {detail}"))
            }
            Notice::DuplicateConnection { .. } => {
                Message::error("Another client is already connected to this endpoint")
            }
            Notice::ReconnectScheduled { attempt, delay, code: 1008, .. } => Message::error(format!(
                "Connection rejected: user_id parameter is required. Retrying in {} (attempt {attempt})",
                format_delay(*delay)
            )),
            Notice::ReconnectScheduled { attempt, delay, code, .. } => Message::system(format!(
                "Connection lost (code {code}). Reconnecting in {} (attempt {attempt})",
                format_delay(*delay)
            )),
            Notice::ReconnectExhausted { attempts, code, .. } => Message::error(format!(
                "Connection lost (code {code}). Gave up after {attempts} reconnect attempts"
            )),
            Notice::MissingIdentity { .. } => {
                Message::error("Please set a User ID before connecting")
            }
        }
    }
}
