//! Frame codecs: the pluggable boundary between a session and its wire format.

use std::fmt;
use std::time::Duration;

use serde_json::{json, Value};

use crate::config::Endpoint;
use crate::errors::ProtocolError;
use crate::models::ToolEvent;

/// One discrete unit received from or sent to a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// Lifecycle transitions a session reports to its log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Connected { endpoint: Endpoint, user_id: String },
    Disconnected { endpoint: Endpoint },
    TransportError { endpoint: Endpoint, detail: String },
    DuplicateConnection { endpoint: Endpoint },
    ReconnectScheduled {
        endpoint: Endpoint,
        attempt: u32,
        delay: Duration,
        code: u16,
        reason: String,
    },
    ReconnectExhausted { endpoint: Endpoint, attempts: u32, code: u16 },
    MissingIdentity { endpoint: Endpoint },
}

/// Capability a session is parameterised by.
///
/// `decode` returning `None` drops the frame; the codecs in this crate never do.
pub trait FrameCodec {
    type Inbound: Clone + fmt::Debug;
    type Outbound;

    fn decode(&self, frame: Frame) -> Option<Self::Inbound>;

    fn encode(&self, event: &Self::Outbound) -> Result<Frame, ProtocolError>;

    /// Renders a lifecycle notice as a log entry.
    fn notice(&self, notice: &Notice) -> Self::Inbound;
}

pub(crate) fn format_delay(delay: Duration) -> String {
    let ms = delay.as_millis();
    if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{ms}ms")
    }
}

/// What a side-channel codec does with text that is not JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawTextPolicy {
    /// Log a `parse_error` entry carrying the raw text.
    Reject,
    /// Keep the text as `{"raw": text}` under the default category.
    Wrap,
}

/// Decodes side-channel frames into [`ToolEvent`]s.
#[derive(Debug, Clone)]
pub struct ToolEventCodec {
    endpoint: Endpoint,
    default_category: &'static str,
    default_action: &'static str,
    raw_text: RawTextPolicy,
}

impl ToolEventCodec {
    pub fn tools() -> Self {
        Self {
            endpoint: Endpoint::Tools,
            default_category: "unknown",
            default_action: "unknown",
            raw_text: RawTextPolicy::Reject,
        }
    }

    pub fn product_info() -> Self {
        Self {
            endpoint: Endpoint::ProductInfo,
            default_category: "product_info",
            default_action: "update",
            raw_text: RawTextPolicy::Wrap,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    fn from_document(&self, doc: Value) -> ToolEvent {
        let category = doc
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or(self.default_category)
            .to_string();
        let action = doc
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or(self.default_action)
            .to_string();
        ToolEvent::new(category, action, doc)
    }
}

impl FrameCodec for ToolEventCodec {
    type Inbound = ToolEvent;
    type Outbound = Value;

    fn decode(&self, frame: Frame) -> Option<ToolEvent> {
        let text = match frame {
            Frame::Text(text) => text,
            Frame::Binary(bytes) => {
                return Some(ToolEvent::new("binary", "received", json!({ "bytes": bytes.len() })));
            }
        };

        match serde_json::from_str::<Value>(&text) {
            Ok(doc) => Some(self.from_document(doc)),
            Err(e) => {
                tracing::debug!(endpoint = %self.endpoint, "Non-JSON side-channel frame: {e}");
                Some(match self.raw_text {
                    RawTextPolicy::Reject => ToolEvent::new(
                        "error",
                        "parse_error",
                        json!({ "error": "Failed to parse message", "raw": text }),
                    ),
                    RawTextPolicy::Wrap => ToolEvent::new(
                        self.default_category,
                        self.default_action,
                        json!({ "raw": text }),
                    ),
                })
            }
        }
    }

    fn encode(&self, event: &Value) -> Result<Frame, ProtocolError> {
        serde_json::to_string(event)
            .map(Frame::Text)
            .map_err(ProtocolError::Encode)
    }

    fn notice(&self, notice: &Notice) -> ToolEvent {
        match notice {
            Notice::Connected { endpoint, user_id } => ToolEvent::new(
                "connection",
                "connected",
                json!({ "status": format!("Connected to {endpoint}"), "user_id": user_id }),
            ),
            Notice::Disconnected { endpoint } => ToolEvent::new(
                "connection",
                "disconnected",
                json!({ "status": format!("Disconnected from {endpoint}") }),
            ),
            Notice::TransportError { detail, .. } => ToolEvent::new(
                "error",
                "websocket_error",
                json!({ "error": "WebSocket connection error", "detail": detail }),
            ),
            Notice::DuplicateConnection { .. } => ToolEvent::new(
                "error",
                "duplicate_connection",
                json!({ "error": "Another client is already connected to this endpoint" }),
            ),
            Notice::ReconnectScheduled { attempt, delay, code, reason, .. } => ToolEvent::new(
                "connection",
                "reconnect_scheduled",
                json!({
                    "attempt": attempt,
                    "delay_ms": delay.as_millis() as u64,
                    "code": code,
                    "reason": reason,
                }),
            ),
            Notice::ReconnectExhausted { attempts, code, .. } => ToolEvent::new(
                "error",
                "reconnect_exhausted",
                json!({ "attempts": attempts, "code": code }),
            ),
            Notice::MissingIdentity { .. } => ToolEvent::new(
                "error",
                "missing_user_id",
                json!({ "error": "User ID is required for connection" }),
            ),
        }
    }
}
