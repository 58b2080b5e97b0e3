use bytes::Bytes;

use vdm_protocol::claude::error::ErrorEnvelope;
use vdm_protocol::claude::stream::StreamEventKind;
use vdm_protocol::openai::stream::ChatCompletionChunk;
use vdm_protocol::sse;

pub use vdm_protocol::sse::encode_done;

/// Claude-format SSE: named event plus the serialized payload.
pub fn encode_claude_event(event: &StreamEventKind) -> Bytes {
    let data = serde_json::to_string(event).unwrap_or_default();
    sse::encode_frame(Some(event.event_name()), &data)
}

/// OpenAI-format SSE: data-only frames.
pub fn encode_openai_chunk(chunk: &ChatCompletionChunk) -> Bytes {
    let data = serde_json::to_string(chunk).unwrap_or_default();
    sse::encode_frame(None, &data)
}

/// In-band error frame, identical framing for both client formats.
pub fn encode_error_frame(kind: &str, message: &str) -> Bytes {
    let envelope = ErrorEnvelope::new(kind, message);
    let data = serde_json::to_string(&envelope).unwrap_or_default();
    sse::encode_frame(Some("error"), &data)
}
