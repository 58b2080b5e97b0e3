use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::claude::error::ErrorDetail;
use crate::claude::types::{AssistantRole, ContentBlock, MessageType, StopReason};

/// Usage as it appears in stream events; absent counters are omitted on the
/// wire rather than sent as zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u32>,
}

/// The `message` payload of a `message_start` event: an empty assistant
/// message shell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub r#type: MessageType,
    pub role: AssistantRole,
    pub model: String,
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub stop_reason: Option<StopReason>,
    #[serde(default)]
    pub stop_sequence: Option<String>,
    #[serde(default)]
    pub usage: StreamUsage,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageDeltaBody {
    pub stop_reason: Option<StopReason>,
    pub stop_sequence: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlockDelta {
    TextDelta {
        text: String,
    },
    /// Accumulated argument JSON; each payload is itself a valid JSON string.
    InputJsonDelta {
        partial_json: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEventKind {
    MessageStart {
        message: StreamMessage,
    },
    ContentBlockStart {
        index: u32,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: ContentBlockDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        usage: StreamUsage,
    },
    MessageStop,
    Ping,
    Error {
        error: ErrorDetail,
    },
}

impl StreamEventKind {
    /// SSE event name; identical to the serialized `type` tag.
    pub fn event_name(&self) -> &'static str {
        match self {
            StreamEventKind::MessageStart { .. } => "message_start",
            StreamEventKind::ContentBlockStart { .. } => "content_block_start",
            StreamEventKind::ContentBlockDelta { .. } => "content_block_delta",
            StreamEventKind::ContentBlockStop { .. } => "content_block_stop",
            StreamEventKind::MessageDelta { .. } => "message_delta",
            StreamEventKind::MessageStop => "message_stop",
            StreamEventKind::Ping => "ping",
            StreamEventKind::Error { .. } => "error",
        }
    }
}

/// A stream event as decoded off the wire. Events this gateway does not model
/// are carried as raw JSON so passthrough streams lose nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
#[allow(clippy::large_enum_variant)]
pub enum StreamEvent {
    Known(StreamEventKind),
    Unknown(JsonValue),
}
