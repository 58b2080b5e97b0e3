use vdm_protocol::claude::request::MessagesRequest;
use vdm_protocol::claude::types::{
    ContentBlockParam, MessageContent, MessageParam, MessageRole, ToolResultContent,
};
use vdm_protocol::openai::request::ChatCompletionRequest;
use vdm_protocol::openai::types::{
    AssistantMessage, ChatMessage, FunctionCall, FunctionObject, StopConfig, SystemMessage,
    TextContent, ToolCallParam, ToolDefinition, ToolMessage, UserMessage,
};

use crate::sanitize::ToolNameMap;

/// An OpenAI request plus the tool-name mapping needed to translate the
/// provider's answer back to the client's names.
#[derive(Debug, Clone)]
pub struct OpenAiRequestPlan {
    pub request: ChatCompletionRequest,
    pub tool_names: ToolNameMap,
}

/// Convert an Anthropic messages request into an OpenAI chat-completions
/// request targeting `resolved_model`. When `sanitize_tool_names` is set,
/// tool names are rewritten to the provider-safe alphabet and the inverse
/// mapping is returned in the plan.
pub fn transform_request(
    request: &MessagesRequest,
    resolved_model: &str,
    sanitize_tool_names: bool,
) -> OpenAiRequestPlan {
    let mut tool_names = ToolNameMap::new();
    let mut wire_name = |name: &str| -> String {
        if sanitize_tool_names {
            tool_names.sanitize(name)
        } else {
            name.to_string()
        }
    };

    let mut messages: Vec<ChatMessage> = Vec::new();

    if let Some(system) = &request.system {
        let text = system.joined("\n\n");
        if !text.is_empty() {
            messages.push(ChatMessage::System(SystemMessage {
                content: TextContent::Text(text),
                name: None,
            }));
        }
    }

    for message in &request.messages {
        match (&message.role, &message.content) {
            (MessageRole::User, MessageContent::Text(text)) => {
                messages.push(user_message(text.clone()));
            }
            (MessageRole::User, MessageContent::Blocks(blocks)) => {
                map_user_blocks(blocks, &mut messages);
            }
            (MessageRole::Assistant, MessageContent::Text(text)) => {
                messages.push(assistant_message(Some(text.clone()), None));
            }
            (MessageRole::Assistant, MessageContent::Blocks(blocks)) => {
                messages.push(map_assistant_blocks(blocks, &mut wire_name));
            }
        }
    }

    let tools = request.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|tool| {
                ToolDefinition::function(FunctionObject {
                    name: wire_name(&tool.name),
                    description: tool.description.clone(),
                    parameters: Some(tool.input_schema.clone()),
                })
            })
            .collect::<Vec<_>>()
    });

    let request = ChatCompletionRequest {
        model: resolved_model.to_string(),
        messages,
        max_tokens: Some(request.max_tokens),
        max_completion_tokens: None,
        temperature: request.temperature,
        top_p: request.top_p,
        stream: request.stream,
        stop: request
            .stop_sequences
            .clone()
            .filter(|sequences| !sequences.is_empty())
            .map(StopConfig::Many),
        tools,
        tool_choice: None,
        user: None,
    };

    OpenAiRequestPlan {
        request,
        tool_names,
    }
}

/// `tool_result` blocks become `role:tool` messages in block order; any text
/// blocks merge into a single trailing user message.
fn map_user_blocks(blocks: &[ContentBlockParam], messages: &mut Vec<ChatMessage>) {
    let mut text_parts: Vec<&str> = Vec::new();

    for block in blocks {
        match block {
            ContentBlockParam::Text { text } => text_parts.push(text),
            ContentBlockParam::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                messages.push(ChatMessage::Tool(ToolMessage {
                    content: TextContent::Text(tool_result_text(content.as_ref())),
                    tool_call_id: tool_use_id.clone(),
                }));
            }
            ContentBlockParam::ToolUse { .. } => {}
        }
    }

    if !text_parts.is_empty() {
        messages.push(user_message(text_parts.join("\n")));
    }
}

fn map_assistant_blocks(
    blocks: &[ContentBlockParam],
    wire_name: &mut impl FnMut(&str) -> String,
) -> ChatMessage {
    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<ToolCallParam> = Vec::new();

    for block in blocks {
        match block {
            ContentBlockParam::Text { text } => text_parts.push(text),
            ContentBlockParam::ToolUse { id, name, input } => {
                tool_calls.push(ToolCallParam {
                    id: id.clone(),
                    r#type: "function".to_string(),
                    function: Some(FunctionCall {
                        name: wire_name(name),
                        arguments: serde_json::to_string(input)
                            .unwrap_or_else(|_| "{}".to_string()),
                    }),
                });
            }
            ContentBlockParam::ToolResult { .. } => {}
        }
    }

    let content = (!text_parts.is_empty()).then(|| text_parts.join("\n"));
    assistant_message(content, (!tool_calls.is_empty()).then_some(tool_calls))
}

fn tool_result_text(content: Option<&ToolResultContent>) -> String {
    match content {
        None => String::new(),
        Some(ToolResultContent::Text(text)) => text.clone(),
        Some(ToolResultContent::Blocks(blocks)) => blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlockParam::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn user_message(text: String) -> ChatMessage {
    ChatMessage::User(UserMessage {
        content: TextContent::Text(text),
        name: None,
    })
}

fn assistant_message(content: Option<String>, tool_calls: Option<Vec<ToolCallParam>>) -> ChatMessage {
    ChatMessage::Assistant(AssistantMessage {
        content: content.map(TextContent::Text),
        tool_calls,
        name: None,
    })
}
