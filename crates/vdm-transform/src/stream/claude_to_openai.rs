use std::collections::BTreeMap;

use vdm_protocol::claude::error::ErrorDetail;
use vdm_protocol::claude::stream::{ContentBlockDelta, StreamEventKind, StreamUsage};
use vdm_protocol::claude::types::{ContentBlock, KnownContentBlock};
use vdm_protocol::openai::response::ResponseRole;
use vdm_protocol::openai::stream::{
    ChatCompletionChunk, ChunkChoice, ChunkObject, FunctionCallDelta, MessageDelta, ToolCallDelta,
};
use vdm_protocol::openai::types::{
    CompletionUsage, FinishReason, PromptTokensDetails, ToolCallType,
};

/// Output of the Claude→OpenAI stream translation for one input event.
#[derive(Debug, Clone)]
pub enum StreamOutput {
    Chunk(ChatCompletionChunk),
    /// The upstream message finished; the caller emits `data: [DONE]`.
    Done,
    /// In-band upstream error to surface as an SSE error frame.
    Error(ErrorDetail),
}

#[derive(Debug, Clone)]
struct ToolSlot {
    openai_index: i64,
    id: String,
}

/// Streaming state machine: Anthropic message events in, OpenAI
/// chat-completion chunks out.
#[derive(Debug)]
pub struct ClaudeToOpenAiStream {
    completion_id: String,
    model: String,
    created: i64,
    tools: BTreeMap<u32, ToolSlot>,
    next_tool_index: i64,
    role_emitted: bool,
    finish_emitted: bool,
    usage: StreamUsage,
}

impl ClaudeToOpenAiStream {
    pub fn new(completion_id: impl Into<String>, model: impl Into<String>, created: i64) -> Self {
        Self {
            completion_id: completion_id.into(),
            model: model.into(),
            created,
            tools: BTreeMap::new(),
            next_tool_index: 0,
            role_emitted: false,
            finish_emitted: false,
            usage: StreamUsage::default(),
        }
    }

    /// Usage as reported by the last `message_delta` event.
    pub fn usage(&self) -> &StreamUsage {
        &self.usage
    }

    pub fn on_event(&mut self, event: &StreamEventKind) -> Vec<StreamOutput> {
        let mut out = Vec::new();

        match event {
            StreamEventKind::MessageStart { .. } | StreamEventKind::Ping => {
                self.emit_role(&mut out);
            }
            StreamEventKind::ContentBlockStart {
                index,
                content_block,
            } => {
                self.emit_role(&mut out);
                match content_block {
                    ContentBlock::Known(KnownContentBlock::Text { text }) => {
                        if !text.is_empty() {
                            out.push(StreamOutput::Chunk(self.text_chunk(text.clone())));
                        }
                    }
                    ContentBlock::Known(KnownContentBlock::ToolUse { id, name, .. }) => {
                        let (openai_index, id) = self.register_tool(*index, Some(id.clone()));
                        out.push(StreamOutput::Chunk(self.tool_chunk(
                            openai_index,
                            id,
                            Some(name.clone()),
                            None,
                        )));
                    }
                    ContentBlock::Unknown(_) => {}
                }
            }
            StreamEventKind::ContentBlockDelta { index, delta } => {
                self.emit_role(&mut out);
                match delta {
                    ContentBlockDelta::TextDelta { text } => {
                        if !text.is_empty() {
                            out.push(StreamOutput::Chunk(self.text_chunk(text.clone())));
                        }
                    }
                    ContentBlockDelta::InputJsonDelta { partial_json } => {
                        if !partial_json.is_empty() {
                            // Tolerate a missing content_block_start by
                            // fabricating the tool entry on first delta.
                            let fresh = !self.tools.contains_key(index);
                            let (openai_index, id) = self.register_tool(*index, None);
                            if fresh {
                                out.push(StreamOutput::Chunk(self.tool_chunk(
                                    openai_index,
                                    id.clone(),
                                    None,
                                    None,
                                )));
                            }
                            out.push(StreamOutput::Chunk(self.tool_chunk(
                                openai_index,
                                id,
                                None,
                                Some(partial_json.clone()),
                            )));
                        }
                    }
                }
            }
            StreamEventKind::ContentBlockStop { .. } => {}
            StreamEventKind::MessageDelta { delta, usage } => {
                if usage.input_tokens.is_some() || usage.output_tokens.is_some() {
                    self.usage = usage.clone();
                }
                if let Some(stop_reason) = delta.stop_reason
                    && !self.finish_emitted
                {
                    self.finish_emitted = true;
                    let finish =
                        crate::response::claude_to_openai::map_stop_reason(Some(stop_reason));
                    out.push(StreamOutput::Chunk(
                        self.finish_chunk(finish, map_usage(usage)),
                    ));
                }
            }
            StreamEventKind::MessageStop => {
                if !self.finish_emitted {
                    self.finish_emitted = true;
                    out.push(StreamOutput::Chunk(self.finish_chunk(FinishReason::Stop, None)));
                }
                out.push(StreamOutput::Done);
            }
            StreamEventKind::Error { error } => {
                out.push(StreamOutput::Error(error.clone()));
            }
        }

        out
    }

    /// Close out a stream whose upstream ended without `message_stop`.
    pub fn finish(&mut self) -> Vec<StreamOutput> {
        let mut out = Vec::new();
        if !self.finish_emitted {
            self.finish_emitted = true;
            out.push(StreamOutput::Chunk(self.finish_chunk(FinishReason::Stop, None)));
        }
        out.push(StreamOutput::Done);
        out
    }

    fn emit_role(&mut self, out: &mut Vec<StreamOutput>) {
        if self.role_emitted {
            return;
        }
        self.role_emitted = true;
        out.push(StreamOutput::Chunk(self.chunk(
            MessageDelta {
                role: Some(ResponseRole::Assistant),
                ..MessageDelta::default()
            },
            None,
            None,
        )));
    }

    fn register_tool(&mut self, block_index: u32, id: Option<String>) -> (i64, String) {
        let next_index = &mut self.next_tool_index;
        let completion_id = &self.completion_id;
        let slot = self.tools.entry(block_index).or_insert_with(|| {
            let openai_index = *next_index;
            *next_index += 1;
            ToolSlot {
                openai_index,
                id: id.unwrap_or_else(|| format!("call-{completion_id}-{block_index}")),
            }
        });
        (slot.openai_index, slot.id.clone())
    }

    fn text_chunk(&self, text: String) -> ChatCompletionChunk {
        self.chunk(
            MessageDelta {
                content: Some(text),
                ..MessageDelta::default()
            },
            None,
            None,
        )
    }

    fn tool_chunk(
        &self,
        index: i64,
        id: String,
        name: Option<String>,
        arguments: Option<String>,
    ) -> ChatCompletionChunk {
        let function = (name.is_some() || arguments.is_some()).then(|| FunctionCallDelta {
            name,
            arguments,
        });
        self.chunk(
            MessageDelta {
                tool_calls: Some(vec![ToolCallDelta {
                    index,
                    id: Some(id),
                    r#type: Some(ToolCallType::Function),
                    function,
                }]),
                ..MessageDelta::default()
            },
            None,
            None,
        )
    }

    fn finish_chunk(
        &self,
        finish: FinishReason,
        usage: Option<CompletionUsage>,
    ) -> ChatCompletionChunk {
        self.chunk(MessageDelta::default(), Some(finish), usage)
    }

    fn chunk(
        &self,
        delta: MessageDelta,
        finish_reason: Option<FinishReason>,
        usage: Option<CompletionUsage>,
    ) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.completion_id.clone(),
            object: Some(ChunkObject::ChatCompletionChunk),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
        }
    }
}

fn map_usage(usage: &StreamUsage) -> Option<CompletionUsage> {
    if usage.input_tokens.is_none() && usage.output_tokens.is_none() {
        return None;
    }
    let prompt_tokens = usage.input_tokens.unwrap_or(0);
    let completion_tokens = usage.output_tokens.unwrap_or(0);
    Some(CompletionUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
        prompt_tokens_details: usage.cache_read_input_tokens.map(|cached_tokens| {
            PromptTokensDetails {
                cached_tokens: Some(cached_tokens),
            }
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdm_protocol::claude::stream::{MessageDeltaBody, StreamMessage};
    use vdm_protocol::claude::types::{AssistantRole, MessageType, StopReason};

    fn message_start() -> StreamEventKind {
        StreamEventKind::MessageStart {
            message: StreamMessage {
                id: "msg_1".to_string(),
                r#type: MessageType::Message,
                role: AssistantRole::Assistant,
                model: "claude-sonnet".to_string(),
                content: Vec::new(),
                stop_reason: None,
                stop_sequence: None,
                usage: StreamUsage::default(),
            },
        }
    }

    fn text_delta(index: u32, text: &str) -> StreamEventKind {
        StreamEventKind::ContentBlockDelta {
            index,
            delta: ContentBlockDelta::TextDelta {
                text: text.to_string(),
            },
        }
    }

    fn chunks(outputs: Vec<StreamOutput>) -> Vec<ChatCompletionChunk> {
        outputs
            .into_iter()
            .filter_map(|output| match output {
                StreamOutput::Chunk(chunk) => Some(chunk),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn role_chunk_comes_first() {
        let mut machine = ClaudeToOpenAiStream::new("chatcmpl-1", "gpt-4", 0);
        let outputs = chunks(machine.on_event(&message_start()));
        assert_eq!(outputs.len(), 1);
        assert_eq!(
            outputs[0].choices[0].delta.role,
            Some(ResponseRole::Assistant)
        );
    }

    #[test]
    fn text_deltas_become_content_chunks() {
        let mut machine = ClaudeToOpenAiStream::new("chatcmpl-1", "gpt-4", 0);
        machine.on_event(&message_start());
        let outputs = chunks(machine.on_event(&text_delta(0, "Hello")));
        assert_eq!(outputs[0].choices[0].delta.content.as_deref(), Some("Hello"));
        assert_eq!(outputs[0].model, "gpt-4");
    }

    #[test]
    fn tool_use_block_maps_to_indexed_tool_call() {
        let mut machine = ClaudeToOpenAiStream::new("chatcmpl-1", "gpt-4", 0);
        machine.on_event(&message_start());

        let start = StreamEventKind::ContentBlockStart {
            index: 1,
            content_block: ContentBlock::Known(KnownContentBlock::ToolUse {
                id: "toolu_9".to_string(),
                name: "calc".to_string(),
                input: serde_json::json!({}),
            }),
        };
        let outputs = chunks(machine.on_event(&start));
        let calls = outputs[0].choices[0].delta.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].index, 0);
        assert_eq!(calls[0].id.as_deref(), Some("toolu_9"));
        assert_eq!(
            calls[0].function.as_ref().unwrap().name.as_deref(),
            Some("calc")
        );

        let delta = StreamEventKind::ContentBlockDelta {
            index: 1,
            delta: ContentBlockDelta::InputJsonDelta {
                partial_json: "{\"a\":1}".to_string(),
            },
        };
        let outputs = chunks(machine.on_event(&delta));
        let calls = outputs[0].choices[0].delta.tool_calls.as_ref().unwrap();
        assert_eq!(
            calls[0].function.as_ref().unwrap().arguments.as_deref(),
            Some("{\"a\":1}")
        );
    }

    #[test]
    fn stop_reason_maps_to_finish_then_done() {
        let mut machine = ClaudeToOpenAiStream::new("chatcmpl-1", "gpt-4", 0);
        machine.on_event(&message_start());

        let outputs = machine.on_event(&StreamEventKind::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(StopReason::ToolUse),
                stop_sequence: None,
            },
            usage: StreamUsage {
                input_tokens: Some(10),
                output_tokens: Some(2),
                cache_creation_input_tokens: None,
                cache_read_input_tokens: None,
            },
        });
        let outputs = chunks(outputs);
        assert_eq!(
            outputs[0].choices[0].finish_reason,
            Some(FinishReason::ToolCalls)
        );
        assert_eq!(outputs[0].usage.as_ref().unwrap().total_tokens, 12);

        let outputs = machine.on_event(&StreamEventKind::MessageStop);
        assert!(matches!(outputs.last(), Some(StreamOutput::Done)));
        assert_eq!(chunks(outputs).len(), 0);
    }

    #[test]
    fn missing_message_stop_still_finishes() {
        let mut machine = ClaudeToOpenAiStream::new("chatcmpl-1", "gpt-4", 0);
        machine.on_event(&message_start());
        machine.on_event(&text_delta(0, "hi"));
        let outputs = machine.finish();
        let finish = chunks(outputs.clone());
        assert_eq!(
            finish[0].choices[0].finish_reason,
            Some(FinishReason::Stop)
        );
        assert!(matches!(outputs.last(), Some(StreamOutput::Done)));
    }
}
