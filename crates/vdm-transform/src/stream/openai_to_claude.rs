use std::collections::BTreeMap;

use serde_json::{Value as JsonValue, json};

use vdm_protocol::claude::stream::{
    ContentBlockDelta, MessageDeltaBody, StreamEventKind, StreamMessage, StreamUsage,
};
use vdm_protocol::claude::types::{
    AssistantRole, ContentBlock, KnownContentBlock, MessageType, StopReason,
};
use vdm_protocol::openai::stream::{ChatCompletionChunk, ToolCallDelta};
use vdm_protocol::openai::types::FinishReason;

use crate::sanitize::ToolNameMap;

/// Per-tool-call carry state, one per upstream tool index.
#[derive(Debug, Clone, Default)]
struct ToolCallSlot {
    tool_id: Option<String>,
    tool_name: Option<String>,
    args_buffer: String,
    started: bool,
    json_sent: bool,
    output_index: u32,
}

/// Streaming state machine: OpenAI chat-completion chunks in, Anthropic
/// message events out.
///
/// One text block lives at index 0; each tool call gets the next index as it
/// starts. Argument fragments are buffered until the buffer parses as
/// complete JSON, at which point exactly one `input_json_delta` is emitted.
#[derive(Debug)]
pub struct OpenAiToClaudeStream {
    message_id: String,
    model: String,
    tool_names: ToolNameMap,
    text_block_index: u32,
    tool_block_counter: u32,
    tool_calls: BTreeMap<i64, ToolCallSlot>,
    final_stop_reason: StopReason,
    usage: StreamUsage,
    finished: bool,
}

impl OpenAiToClaudeStream {
    pub fn new(message_id: impl Into<String>, model: impl Into<String>, tool_names: ToolNameMap) -> Self {
        Self {
            message_id: message_id.into(),
            model: model.into(),
            tool_names,
            text_block_index: 0,
            tool_block_counter: 0,
            tool_calls: BTreeMap::new(),
            final_stop_reason: StopReason::EndTurn,
            usage: StreamUsage {
                input_tokens: Some(0),
                output_tokens: Some(0),
                cache_creation_input_tokens: None,
                cache_read_input_tokens: None,
            },
            finished: false,
        }
    }

    /// Initial events, emitted exactly once before any delta.
    pub fn begin(&self) -> Vec<StreamEventKind> {
        vec![
            StreamEventKind::MessageStart {
                message: StreamMessage {
                    id: self.message_id.clone(),
                    r#type: MessageType::Message,
                    role: AssistantRole::Assistant,
                    model: self.model.clone(),
                    content: Vec::new(),
                    stop_reason: None,
                    stop_sequence: None,
                    usage: StreamUsage {
                        input_tokens: Some(0),
                        output_tokens: Some(0),
                        cache_creation_input_tokens: None,
                        cache_read_input_tokens: None,
                    },
                },
            },
            StreamEventKind::ContentBlockStart {
                index: self.text_block_index,
                content_block: ContentBlock::Known(KnownContentBlock::Text {
                    text: String::new(),
                }),
            },
            StreamEventKind::Ping,
        ]
    }

    /// Process one upstream chunk. After a chunk carries a finish reason the
    /// stream is content-complete; later chunks only contribute usage
    /// counters (providers send usage in a trailing chunk).
    pub fn on_chunk(&mut self, chunk: &ChatCompletionChunk) -> Vec<StreamEventKind> {
        let mut events = Vec::new();

        if let Some(usage) = &chunk.usage {
            self.usage = StreamUsage {
                input_tokens: Some(usage.prompt_tokens),
                output_tokens: Some(usage.completion_tokens),
                cache_creation_input_tokens: None,
                cache_read_input_tokens: usage
                    .prompt_tokens_details
                    .as_ref()
                    .and_then(|details| details.cached_tokens),
            };
        }

        if self.finished {
            return events;
        }

        let Some(choice) = chunk.choices.first() else {
            return events;
        };

        if let Some(text) = &choice.delta.content {
            events.push(StreamEventKind::ContentBlockDelta {
                index: self.text_block_index,
                delta: ContentBlockDelta::TextDelta { text: text.clone() },
            });
        }

        if let Some(tool_calls) = &choice.delta.tool_calls {
            for delta in tool_calls {
                self.on_tool_delta(delta, &mut events);
            }
        }

        if let Some(reason) = choice.finish_reason {
            self.final_stop_reason = map_finish_reason(reason);
            self.finished = true;
        }

        events
    }

    fn on_tool_delta(&mut self, delta: &ToolCallDelta, events: &mut Vec<StreamEventKind>) {
        let slot = self.tool_calls.entry(delta.index).or_default();

        if slot.tool_id.is_none() {
            slot.tool_id = match delta.id.as_deref() {
                Some(id) if !id.is_empty() => Some(id.to_string()),
                _ => Some(format!("toolu_{}_{}", self.message_id, delta.index)),
            };
        }

        if let Some(function) = &delta.function {
            if let Some(name) = function.name.as_deref()
                && !name.is_empty()
            {
                slot.tool_name = Some(self.tool_names.original(name));
            }

            if let Some(arguments) = &function.arguments {
                slot.args_buffer.push_str(arguments);
            }
        }

        if !slot.started
            && let (Some(id), Some(name)) = (slot.tool_id.clone(), slot.tool_name.clone())
        {
            self.tool_block_counter += 1;
            slot.output_index = self.text_block_index + self.tool_block_counter;
            slot.started = true;
            events.push(StreamEventKind::ContentBlockStart {
                index: slot.output_index,
                content_block: ContentBlock::Known(KnownContentBlock::ToolUse {
                    id,
                    name,
                    input: json!({}),
                }),
            });
        }

        if slot.started
            && !slot.json_sent
            && !slot.args_buffer.is_empty()
            && serde_json::from_str::<JsonValue>(&slot.args_buffer).is_ok()
        {
            events.push(StreamEventKind::ContentBlockDelta {
                index: slot.output_index,
                delta: ContentBlockDelta::InputJsonDelta {
                    partial_json: slot.args_buffer.clone(),
                },
            });
            slot.json_sent = true;
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Usage as accumulated from upstream chunks so far.
    pub fn usage(&self) -> &StreamUsage {
        &self.usage
    }

    /// Termination events: close the text block, close every started tool
    /// block, then `message_delta` with the recorded stop reason and usage,
    /// then `message_stop`.
    pub fn finish(&mut self) -> Vec<StreamEventKind> {
        let mut events = vec![StreamEventKind::ContentBlockStop {
            index: self.text_block_index,
        }];

        for slot in self.tool_calls.values() {
            if slot.started {
                events.push(StreamEventKind::ContentBlockStop {
                    index: slot.output_index,
                });
            }
        }

        events.push(StreamEventKind::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(self.final_stop_reason),
                stop_sequence: None,
            },
            usage: self.usage.clone(),
        });
        events.push(StreamEventKind::MessageStop);
        events
    }
}

fn map_finish_reason(reason: FinishReason) -> StopReason {
    match reason {
        FinishReason::Length => StopReason::MaxTokens,
        FinishReason::ToolCalls | FinishReason::FunctionCall => StopReason::ToolUse,
        FinishReason::ContentFilter => StopReason::Refusal,
        FinishReason::Stop => StopReason::EndTurn,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdm_protocol::openai::stream::{ChunkChoice, FunctionCallDelta, MessageDelta};
    use vdm_protocol::openai::types::CompletionUsage;

    fn chunk(delta: MessageDelta, finish: Option<FinishReason>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish,
            }],
            ..ChatCompletionChunk::default()
        }
    }

    fn text_chunk(text: &str) -> ChatCompletionChunk {
        chunk(
            MessageDelta {
                content: Some(text.to_string()),
                ..MessageDelta::default()
            },
            None,
        )
    }

    fn tool_chunk(index: i64, id: Option<&str>, name: Option<&str>, args: Option<&str>) -> ChatCompletionChunk {
        chunk(
            MessageDelta {
                tool_calls: Some(vec![ToolCallDelta {
                    index,
                    id: id.map(str::to_string),
                    r#type: None,
                    function: Some(FunctionCallDelta {
                        name: name.map(str::to_string),
                        arguments: args.map(str::to_string),
                    }),
                }]),
                ..MessageDelta::default()
            },
            None,
        )
    }

    fn finish_chunk(reason: FinishReason) -> ChatCompletionChunk {
        chunk(MessageDelta::default(), Some(reason))
    }

    fn event_names(events: &[StreamEventKind]) -> Vec<&'static str> {
        events.iter().map(|event| event.event_name()).collect()
    }

    #[test]
    fn initial_events_in_order() {
        let machine = OpenAiToClaudeStream::new("msg_1", "fast", ToolNameMap::new());
        assert_eq!(
            event_names(&machine.begin()),
            vec!["message_start", "content_block_start", "ping"]
        );
    }

    #[test]
    fn text_stream_produces_ordered_claude_events() {
        let mut machine = OpenAiToClaudeStream::new("msg_1", "fast", ToolNameMap::new());
        let mut events = machine.begin();
        events.extend(machine.on_chunk(&text_chunk("He")));
        events.extend(machine.on_chunk(&text_chunk("llo")));
        events.extend(machine.on_chunk(&finish_chunk(FinishReason::Stop)));
        assert!(machine.is_finished());
        events.extend(machine.finish());

        assert_eq!(
            event_names(&events),
            vec![
                "message_start",
                "content_block_start",
                "ping",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        let StreamEventKind::MessageDelta { delta, .. } = &events[6] else {
            panic!("expected message_delta");
        };
        assert_eq!(delta.stop_reason, Some(StopReason::EndTurn));
    }

    #[test]
    fn split_tool_arguments_emit_one_json_delta() {
        let mut machine = OpenAiToClaudeStream::new("msg_1", "fast", ToolNameMap::new());
        machine.begin();

        let mut events = machine.on_chunk(&tool_chunk(0, Some("call_1"), Some("calc"), None));
        events.extend(machine.on_chunk(&tool_chunk(0, None, None, Some("{\"ex"))));
        events.extend(machine.on_chunk(&tool_chunk(0, None, None, Some("pression\":"))));
        events.extend(machine.on_chunk(&tool_chunk(0, None, None, Some(" \"2+2\"}"))));
        events.extend(machine.on_chunk(&finish_chunk(FinishReason::ToolCalls)));
        events.extend(machine.finish());

        let starts: Vec<_> = events
            .iter()
            .filter(|event| matches!(event, StreamEventKind::ContentBlockStart { .. }))
            .collect();
        assert_eq!(starts.len(), 1);
        let StreamEventKind::ContentBlockStart {
            index,
            content_block,
        } = starts[0]
        else {
            unreachable!();
        };
        assert_eq!(*index, 1);
        assert!(matches!(
            content_block,
            ContentBlock::Known(KnownContentBlock::ToolUse { id, name, .. })
                if id == "call_1" && name == "calc"
        ));

        let json_deltas: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                StreamEventKind::ContentBlockDelta {
                    delta: ContentBlockDelta::InputJsonDelta { partial_json },
                    index,
                } => Some((*index, partial_json.as_str())),
                _ => None,
            })
            .collect();
        assert_eq!(json_deltas, vec![(1, "{\"expression\": \"2+2\"}")]);

        let StreamEventKind::MessageDelta { delta, .. } = events
            .iter()
            .find(|event| matches!(event, StreamEventKind::MessageDelta { .. }))
            .unwrap()
        else {
            unreachable!();
        };
        assert_eq!(delta.stop_reason, Some(StopReason::ToolUse));

        let stops: Vec<u32> = events
            .iter()
            .filter_map(|event| match event {
                StreamEventKind::ContentBlockStop { index } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(stops, vec![0, 1]);
    }

    #[test]
    fn tool_id_is_allocated_when_upstream_omits_it() {
        let mut machine = OpenAiToClaudeStream::new("msg_1", "fast", ToolNameMap::new());
        machine.begin();
        let events = machine.on_chunk(&tool_chunk(0, None, Some("calc"), Some("{}")));
        let StreamEventKind::ContentBlockStart { content_block, .. } = &events[0] else {
            panic!("expected content_block_start");
        };
        assert!(matches!(
            content_block,
            ContentBlock::Known(KnownContentBlock::ToolUse { id, .. }) if id == "toolu_msg_1_0"
        ));
    }

    #[test]
    fn incomplete_json_keeps_buffering() {
        let mut machine = OpenAiToClaudeStream::new("msg_1", "fast", ToolNameMap::new());
        machine.begin();
        machine.on_chunk(&tool_chunk(0, Some("call_1"), Some("calc"), None));
        let events = machine.on_chunk(&tool_chunk(0, None, None, Some("{\"a\":")));
        assert!(
            events
                .iter()
                .all(|event| !matches!(event, StreamEventKind::ContentBlockDelta { .. }))
        );
    }

    #[test]
    fn usage_chunk_lands_in_message_delta() {
        let mut machine = OpenAiToClaudeStream::new("msg_1", "fast", ToolNameMap::new());
        machine.begin();
        machine.on_chunk(&text_chunk("hi"));
        machine.on_chunk(&finish_chunk(FinishReason::Stop));
        let usage_chunk = ChatCompletionChunk {
            usage: Some(CompletionUsage {
                prompt_tokens: 12,
                completion_tokens: 3,
                total_tokens: 15,
                prompt_tokens_details: None,
            }),
            ..ChatCompletionChunk::default()
        };
        machine.on_chunk(&usage_chunk);
        let events = machine.finish();
        let StreamEventKind::MessageDelta { usage, .. } = events
            .iter()
            .find(|event| matches!(event, StreamEventKind::MessageDelta { .. }))
            .unwrap()
        else {
            unreachable!();
        };
        assert_eq!(usage.input_tokens, Some(12));
        assert_eq!(usage.output_tokens, Some(3));
    }

    #[test]
    fn two_tool_calls_get_distinct_indices() {
        let mut machine = OpenAiToClaudeStream::new("msg_1", "fast", ToolNameMap::new());
        machine.begin();
        let first = machine.on_chunk(&tool_chunk(0, Some("a"), Some("one"), Some("{}")));
        let second = machine.on_chunk(&tool_chunk(1, Some("b"), Some("two"), Some("{}")));

        let index_of = |events: &[StreamEventKind]| match events
            .iter()
            .find(|event| matches!(event, StreamEventKind::ContentBlockStart { .. }))
        {
            Some(StreamEventKind::ContentBlockStart { index, .. }) => *index,
            _ => panic!("expected start"),
        };
        assert_eq!(index_of(&first), 1);
        assert_eq!(index_of(&second), 2);
    }
}
