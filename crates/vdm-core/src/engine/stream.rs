use bytes::Bytes;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;

use vdm_protocol::claude::stream::{StreamEvent, StreamUsage};
use vdm_protocol::openai::stream::ChatCompletionChunk;
use vdm_protocol::sse::{SseFrame, SseParser, encode_frame};
use vdm_transform::stream::claude_to_openai::{ClaudeToOpenAiStream, StreamOutput};
use vdm_transform::stream::openai_to_claude::OpenAiToClaudeStream;

use crate::engine::wire::{encode_claude_event, encode_done, encode_error_frame, encode_openai_chunk};
use crate::metrics::{ErrorKind, MetricsHub, RequestMetrics};
use crate::upstream::UpstreamStream;

const DONE_SENTINEL: &str = "[DONE]";

/// One upstream-to-downstream stream translation, chosen per request from
/// the (client format, provider format) pair.
pub enum StreamTransformer {
    /// Anthropic client, Anthropic provider: frames re-encode unchanged.
    ClaudePassthrough,
    /// OpenAI client, OpenAI provider: data frames re-encode, `[DONE]` ends.
    OpenAiPassthrough { done_sent: bool },
    /// OpenAI provider feeding an Anthropic client.
    OpenAiToClaude {
        machine: OpenAiToClaudeStream,
        terminated: bool,
    },
    /// Anthropic provider feeding an OpenAI client.
    ClaudeToOpenAi(ClaudeToOpenAiStream),
}

pub struct StepOutput {
    pub frames: Vec<Bytes>,
    pub done: bool,
}

impl StepOutput {
    fn none() -> Self {
        Self {
            frames: Vec::new(),
            done: false,
        }
    }
}

pub enum StreamFailure {
    /// Malformed upstream frame; surfaced as one in-band error event.
    Parse(String),
    /// Upstream emitted an in-band error event; forwarded, then the stream ends.
    UpstreamError(String),
}

impl StreamTransformer {
    pub fn openai_to_claude(machine: OpenAiToClaudeStream) -> Self {
        StreamTransformer::OpenAiToClaude {
            machine,
            terminated: false,
        }
    }

    /// Frames to send before any upstream data.
    pub fn begin(&mut self) -> Vec<Bytes> {
        match self {
            StreamTransformer::OpenAiToClaude { machine, .. } => {
                machine.begin().iter().map(encode_claude_event).collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn on_frame(&mut self, frame: &SseFrame) -> Result<StepOutput, StreamFailure> {
        let data = frame.data.trim();
        if data.is_empty() && frame.event.is_none() {
            return Ok(StepOutput::none());
        }

        match self {
            StreamTransformer::ClaudePassthrough => {
                if data == DONE_SENTINEL {
                    // Not part of the Anthropic protocol; swallow it.
                    return Ok(StepOutput {
                        frames: Vec::new(),
                        done: true,
                    });
                }
                let event_name = frame.event.clone().or_else(|| {
                    serde_json::from_str::<JsonValue>(data)
                        .ok()
                        .and_then(|value| value.get("type")?.as_str().map(str::to_string))
                });
                let done = event_name.as_deref() == Some("message_stop");
                Ok(StepOutput {
                    frames: vec![encode_frame(event_name.as_deref(), data)],
                    done,
                })
            }
            StreamTransformer::OpenAiPassthrough { done_sent } => {
                if data == DONE_SENTINEL {
                    *done_sent = true;
                    return Ok(StepOutput {
                        frames: vec![encode_done()],
                        done: true,
                    });
                }
                Ok(StepOutput {
                    frames: vec![encode_frame(None, data)],
                    done: false,
                })
            }
            StreamTransformer::OpenAiToClaude {
                machine,
                terminated,
            } => {
                if data == DONE_SENTINEL {
                    *terminated = true;
                    return Ok(StepOutput {
                        frames: machine.finish().iter().map(encode_claude_event).collect(),
                        done: true,
                    });
                }
                let value: JsonValue = serde_json::from_str(data).map_err(|err| {
                    StreamFailure::Parse(format!("failed to parse upstream chunk as JSON: {err}"))
                })?;
                // Frames that parse as JSON but not as a chat chunk are
                // skipped rather than failing the stream.
                let Ok(chunk) = serde_json::from_value::<ChatCompletionChunk>(value) else {
                    return Ok(StepOutput::none());
                };
                Ok(StepOutput {
                    frames: machine
                        .on_chunk(&chunk)
                        .iter()
                        .map(encode_claude_event)
                        .collect(),
                    done: false,
                })
            }
            StreamTransformer::ClaudeToOpenAi(machine) => {
                if data == DONE_SENTINEL {
                    return Ok(StepOutput {
                        frames: Vec::new(),
                        done: true,
                    });
                }
                let value: JsonValue = serde_json::from_str(data).map_err(|err| {
                    StreamFailure::Parse(format!("failed to parse upstream event as JSON: {err}"))
                })?;
                let Ok(StreamEvent::Known(event)) = serde_json::from_value::<StreamEvent>(value)
                else {
                    return Ok(StepOutput::none());
                };

                let mut frames = Vec::new();
                let mut done = false;
                for output in machine.on_event(&event) {
                    match output {
                        StreamOutput::Chunk(chunk) => frames.push(encode_openai_chunk(&chunk)),
                        StreamOutput::Done => {
                            frames.push(encode_done());
                            done = true;
                        }
                        StreamOutput::Error(detail) => {
                            return Err(StreamFailure::UpstreamError(detail.message));
                        }
                    }
                }
                Ok(StepOutput { frames, done })
            }
        }
    }

    /// Frames to send when the upstream closes without its own terminator.
    pub fn on_upstream_close(&mut self) -> Vec<Bytes> {
        match self {
            StreamTransformer::ClaudePassthrough => Vec::new(),
            StreamTransformer::OpenAiPassthrough { done_sent } => {
                if *done_sent {
                    Vec::new()
                } else {
                    *done_sent = true;
                    vec![encode_done()]
                }
            }
            StreamTransformer::OpenAiToClaude {
                machine,
                terminated,
            } => {
                if *terminated {
                    Vec::new()
                } else {
                    *terminated = true;
                    machine.finish().iter().map(encode_claude_event).collect()
                }
            }
            StreamTransformer::ClaudeToOpenAi(machine) => machine
                .finish()
                .iter()
                .filter_map(|output| match output {
                    StreamOutput::Chunk(chunk) => Some(encode_openai_chunk(chunk)),
                    StreamOutput::Done => Some(encode_done()),
                    StreamOutput::Error(_) => None,
                })
                .collect(),
        }
    }

    fn usage(&self) -> Option<StreamUsage> {
        match self {
            StreamTransformer::OpenAiToClaude { machine, .. } => Some(machine.usage().clone()),
            StreamTransformer::ClaudeToOpenAi(machine) => Some(machine.usage().clone()),
            _ => None,
        }
    }
}

enum PumpOutcome {
    Completed,
    Cancelled,
    Parse(String),
    Upstream(String),
}

/// Drive one upstream stream to completion: decode SSE, translate, forward.
///
/// A failed downstream send means the client disconnected: the upstream call
/// is cancelled, one `event: error` frame is written best-effort, and the
/// normal termination events are skipped. This is the only task that touches
/// the request's metrics after the response is committed, and it guarantees
/// a terminal metrics update on every exit path.
pub async fn run_stream_pump(
    mut upstream: UpstreamStream,
    mut transformer: StreamTransformer,
    tx: mpsc::Sender<Bytes>,
    mut metrics: RequestMetrics,
    hub: MetricsHub,
) {
    let mut parser = SseParser::new();

    let outcome = 'pump: {
        for frame in transformer.begin() {
            if tx.send(frame).await.is_err() {
                break 'pump PumpOutcome::Cancelled;
            }
        }

        let mut done = false;
        while !done {
            let Some(chunk) = upstream.next_chunk().await else {
                break;
            };
            for frame in parser.push_bytes(&chunk) {
                match transformer.on_frame(&frame) {
                    Ok(step) => {
                        for bytes in step.frames {
                            if tx.send(bytes).await.is_err() {
                                break 'pump PumpOutcome::Cancelled;
                            }
                        }
                        if step.done {
                            done = true;
                            break;
                        }
                    }
                    Err(StreamFailure::Parse(message)) => {
                        break 'pump PumpOutcome::Parse(message);
                    }
                    Err(StreamFailure::UpstreamError(message)) => {
                        break 'pump PumpOutcome::Upstream(message);
                    }
                }
            }
        }

        if !done {
            for frame in parser.finish() {
                if let Ok(step) = transformer.on_frame(&frame) {
                    for bytes in step.frames {
                        if tx.send(bytes).await.is_err() {
                            break 'pump PumpOutcome::Cancelled;
                        }
                    }
                    if step.done {
                        done = true;
                    }
                }
            }
            if !done {
                for bytes in transformer.on_upstream_close() {
                    if tx.send(bytes).await.is_err() {
                        break 'pump PumpOutcome::Cancelled;
                    }
                }
            }
        }

        PumpOutcome::Completed
    };

    if let Some(usage) = transformer.usage() {
        metrics.input_tokens = usage.input_tokens.unwrap_or(0);
        metrics.output_tokens = usage.output_tokens.unwrap_or(0);
        metrics.cache_read_tokens = usage.cache_read_input_tokens.unwrap_or(0);
        metrics.cache_creation_tokens = usage.cache_creation_input_tokens.unwrap_or(0);
    }

    match outcome {
        PumpOutcome::Completed => {}
        PumpOutcome::Cancelled => {
            upstream.cancel();
            metrics.fail(ErrorKind::Cancelled, "Request was cancelled by client");
            let frame = encode_error_frame("cancelled", "Request was cancelled by client");
            let _ = tx.try_send(frame);
        }
        PumpOutcome::Parse(message) => {
            metrics.fail(ErrorKind::SseParse, message.clone());
            let frame = encode_error_frame("api_error", &message);
            let _ = tx.send(frame).await;
        }
        PumpOutcome::Upstream(message) => {
            metrics.fail(ErrorKind::UpstreamError, message.clone());
            let frame = encode_error_frame("api_error", &message);
            let _ = tx.send(frame).await;
        }
    }

    hub.finish(&mut metrics);
}
