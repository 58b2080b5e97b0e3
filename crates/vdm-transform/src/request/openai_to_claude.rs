use serde_json::{Value as JsonValue, json};

use vdm_protocol::claude::request::MessagesRequest;
use vdm_protocol::claude::types::{
    ContentBlockParam, MessageContent, MessageParam, MessageRole, SystemParam, Tool,
    ToolResultContent,
};
use vdm_protocol::openai::request::ChatCompletionRequest;
use vdm_protocol::openai::types::{
    AssistantMessage, ChatMessage, StopConfig, TextContent, ToolMessage,
};

use crate::error::TransformError;

/// Convert an OpenAI chat-completions request into an Anthropic messages
/// request, targeting `resolved_model`.
pub fn transform_request(
    request: &ChatCompletionRequest,
    resolved_model: &str,
) -> Result<MessagesRequest, TransformError> {
    let max_tokens = request
        .output_token_cap()
        .ok_or(TransformError::MissingMaxTokens)?;

    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<MessageParam> = Vec::new();

    for message in &request.messages {
        match message {
            ChatMessage::System(system) | ChatMessage::Developer(system) => {
                // Every system text part joins with a blank line, whether it
                // came from one message's part list or separate messages.
                let text = system.content.joined("\n\n");
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            ChatMessage::User(user) => {
                messages.push(MessageParam {
                    role: MessageRole::User,
                    content: MessageContent::Text(user.content.joined("\n")),
                });
            }
            ChatMessage::Assistant(assistant) => {
                messages.push(map_assistant_message(assistant));
            }
            ChatMessage::Tool(tool) => {
                messages.push(map_tool_message(tool));
            }
        }
    }

    let system = (!system_parts.is_empty()).then(|| SystemParam::Text(system_parts.join("\n\n")));

    Ok(MessagesRequest {
        model: resolved_model.to_string(),
        max_tokens,
        messages,
        system,
        stream: request.stream,
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: None,
        stop_sequences: map_stop(request.stop.as_ref()),
        tools: map_tools(request.tools.as_deref()),
        tool_choice: None,
        metadata: None,
    })
}

fn map_assistant_message(
    assistant: &vdm_protocol::openai::types::AssistantMessage,
) -> MessageParam {
    let AssistantMessage {
        content,
        tool_calls,
        ..
    } = assistant;

    let mut blocks: Vec<ContentBlockParam> = Vec::new();

    if let Some(content) = content {
        let text = content.joined("\n");
        if !text.is_empty() {
            blocks.push(ContentBlockParam::Text { text });
        }
    }

    if let Some(tool_calls) = tool_calls {
        for call in tool_calls {
            if !call.is_function() {
                continue;
            }
            let Some(function) = &call.function else {
                continue;
            };
            blocks.push(ContentBlockParam::ToolUse {
                id: call.id.clone(),
                name: function.name.clone(),
                input: parse_arguments(&function.arguments),
            });
        }
    }

    // A lone text block collapses to the plain-string content form.
    let content = if blocks.len() == 1
        && let ContentBlockParam::Text { text } = &blocks[0]
    {
        MessageContent::Text(text.clone())
    } else {
        MessageContent::Blocks(blocks)
    };

    MessageParam {
        role: MessageRole::Assistant,
        content,
    }
}

fn map_tool_message(tool: &ToolMessage) -> MessageParam {
    let content = match &tool.content {
        TextContent::Text(text) => text.clone(),
        TextContent::Parts(_) => tool.content.joined("\n"),
    };

    MessageParam {
        role: MessageRole::User,
        content: MessageContent::Blocks(vec![ContentBlockParam::ToolResult {
            tool_use_id: tool.tool_call_id.clone(),
            content: Some(ToolResultContent::Text(content)),
            is_error: None,
        }]),
    }
}

/// Tool call arguments arrive as a JSON-encoded string; an unparseable
/// string degrades to an empty input object.
fn parse_arguments(arguments: &str) -> JsonValue {
    if arguments.is_empty() {
        return json!({});
    }
    match serde_json::from_str::<JsonValue>(arguments) {
        Ok(value @ JsonValue::Object(_)) => value,
        _ => json!({}),
    }
}

fn map_tools(tools: Option<&[vdm_protocol::openai::types::ToolDefinition]>) -> Option<Vec<Tool>> {
    let tools = tools?;
    let mapped: Vec<Tool> = tools
        .iter()
        .filter(|tool| tool.r#type == "function")
        .filter_map(|tool| tool.function.as_ref())
        .map(|function| Tool {
            name: function.name.clone(),
            description: function.description.clone(),
            input_schema: function
                .parameters
                .clone()
                .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
        })
        .collect();

    (!mapped.is_empty()).then_some(mapped)
}

fn map_stop(stop: Option<&StopConfig>) -> Option<Vec<String>> {
    let sequences: Vec<String> = match stop? {
        StopConfig::Single(value) => vec![value.clone()],
        StopConfig::Many(values) => values.clone(),
    }
    .into_iter()
    .map(|value| value.trim().to_string())
    .filter(|value| !value.is_empty())
    .collect();

    (!sequences.is_empty()).then_some(sequences)
}
