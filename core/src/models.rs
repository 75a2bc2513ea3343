use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    User,
    Assistant,
    System,
    Error,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::User => "user",
            MessageKind::Assistant => "assistant",
            MessageKind::System => "system",
            MessageKind::Error => "error",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A UI-facing conversation entry. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub kind: MessageKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_audio_origin: bool,
}

impl Message {
    pub fn new(kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            content: content.into(),
            timestamp: Utc::now(),
            is_audio_origin: false,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageKind::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageKind::System, content)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Error, content)
    }

    /// A user message transcribed from speech.
    pub fn transcription(content: impl Into<String>) -> Self {
        Self {
            is_audio_origin: true,
            ..Self::user(content)
        }
    }
}

/// An entry from a side-channel stream (tools, product info).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub category: String,
    pub action: String,
    pub payload: Value,
}

impl ToolEvent {
    pub fn new(category: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            category: category.into(),
            action: action.into(),
            payload,
        }
    }
}

/// Append-only, insertion-ordered log. Only an explicit `clear` removes entries.
#[derive(Debug, Clone, PartialEq)]
pub struct EventLog<T> {
    entries: Vec<T>,
}

impl<T> EventLog<T> {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn push(&mut self, entry: T) {
        self.entries.push(entry);
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = T>) {
        self.entries.extend(entries);
    }

    pub fn entries(&self) -> &[T] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<T> Default for EventLog<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Streaming status reported by `GET /product-info-status`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamingStatus {
    #[serde(default)]
    pub is_streaming: bool,
    #[serde(default)]
    pub external_connected: bool,
    #[serde(default)]
    pub has_clients: bool,
    #[serde(default)]
    pub last_message: Option<Value>,
}

impl StreamingStatus {
    /// Accepts the bare status object or the `{"data": {...}}` envelope.
    pub fn from_json(value: Value) -> Result<Self, serde_json::Error> {
        match value {
            Value::Object(mut map) if map.contains_key("data") => {
                serde_json::from_value(map.remove("data").unwrap_or_default())
            }
            other => serde_json::from_value(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_transcription_is_audio_origin() {
        let msg = Message::transcription("hi");
        assert_eq!(msg.kind, MessageKind::User);
        assert!(msg.is_audio_origin);
        assert!(!Message::user("typed").is_audio_origin);
    }

    #[test]
    fn test_message_ids_are_unique() {
        let a = Message::system("x");
        let b = Message::system("x");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_event_log_keeps_insertion_order() {
        let mut log = EventLog::new();
        log.push(1);
        log.extend([2, 3]);
        assert_eq!(log.entries(), &[1, 2, 3]);
        log.clear();
        assert!(log.is_empty());
    }

    #[test]
    fn test_streaming_status_accepts_envelope() {
        let wrapped = json!({
            "success": true,
            "data": {
                "is_streaming": true,
                "external_connected": false,
                "has_clients": true,
                "last_message": {"sku": "A1"}
            }
        });
        let status = StreamingStatus::from_json(wrapped).unwrap();
        assert!(status.is_streaming);
        assert!(status.has_clients);
        assert_eq!(status.last_message, Some(json!({"sku": "A1"})));

        let bare = json!({"is_streaming": false, "external_connected": true, "has_clients": false, "last_message": null});
        let status = StreamingStatus::from_json(bare).unwrap();
        assert!(status.external_connected);
        assert_eq!(status.last_message, None);
    }
}
