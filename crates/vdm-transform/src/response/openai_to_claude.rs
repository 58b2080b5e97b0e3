use serde_json::{Value as JsonValue, json};

use vdm_protocol::claude::response::MessagesResponse;
use vdm_protocol::claude::types::{
    AssistantRole, ContentBlock, KnownContentBlock, MessageType, StopReason, Usage,
};
use vdm_protocol::openai::response::ChatCompletionResponse;
use vdm_protocol::openai::types::FinishReason;

use crate::error::TransformError;
use crate::sanitize::ToolNameMap;

/// Convert a unary OpenAI chat-completions response into an Anthropic
/// message, reporting `client_model` as the model the client asked for.
pub fn transform_response(
    response: &ChatCompletionResponse,
    client_model: &str,
    tool_names: &ToolNameMap,
) -> Result<MessagesResponse, TransformError> {
    let choice = response.choices.first().ok_or(TransformError::NoChoices)?;

    let mut content: Vec<ContentBlock> = Vec::new();

    if let Some(text) = &choice.message.content {
        content.push(ContentBlock::Known(KnownContentBlock::Text {
            text: text.clone(),
        }));
    }

    if let Some(tool_calls) = &choice.message.tool_calls {
        for call in tool_calls {
            content.push(ContentBlock::Known(KnownContentBlock::ToolUse {
                id: call.id.clone(),
                name: tool_names.original(&call.function.name),
                input: parse_arguments(&call.function.arguments),
            }));
        }
    }

    if content.is_empty() {
        content.push(ContentBlock::Known(KnownContentBlock::Text {
            text: String::new(),
        }));
    }

    let usage = response
        .usage
        .as_ref()
        .map(|usage| Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            cache_creation_input_tokens: None,
            cache_read_input_tokens: usage
                .prompt_tokens_details
                .as_ref()
                .and_then(|details| details.cached_tokens),
        })
        .unwrap_or_default();

    Ok(MessagesResponse {
        id: response.id.clone(),
        r#type: MessageType::Message,
        role: AssistantRole::Assistant,
        model: client_model.to_string(),
        content,
        stop_reason: Some(map_finish_reason(choice.finish_reason)),
        stop_sequence: None,
        usage,
    })
}

pub(crate) fn map_finish_reason(reason: Option<FinishReason>) -> StopReason {
    match reason {
        Some(FinishReason::Length) => StopReason::MaxTokens,
        Some(FinishReason::ToolCalls) | Some(FinishReason::FunctionCall) => StopReason::ToolUse,
        Some(FinishReason::ContentFilter) => StopReason::Refusal,
        Some(FinishReason::Stop) | None => StopReason::EndTurn,
    }
}

/// Unary responses keep unparseable argument strings visible to the client
/// instead of dropping them.
fn parse_arguments(arguments: &str) -> JsonValue {
    if arguments.is_empty() {
        return json!({});
    }
    match serde_json::from_str::<JsonValue>(arguments) {
        Ok(value @ JsonValue::Object(_)) => value,
        _ => json!({"raw_arguments": arguments}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdm_protocol::openai::response::{
        ChatChoice, ChatCompletionObject, ChatCompletionResponse, ResponseMessage, ResponseRole,
    };
    use vdm_protocol::openai::types::{
        CompletionUsage, FunctionCall, ToolCall, ToolCallType,
    };

    fn response_with(message: ResponseMessage, finish: FinishReason) -> ChatCompletionResponse {
        ChatCompletionResponse {
            id: "chatcmpl-1".to_string(),
            object: ChatCompletionObject::ChatCompletion,
            created: 0,
            model: "gpt-4".to_string(),
            choices: vec![ChatChoice {
                index: 0,
                message,
                finish_reason: Some(finish),
            }],
            usage: Some(CompletionUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
                prompt_tokens_details: None,
            }),
            system_fingerprint: None,
        }
    }

    #[test]
    fn text_response_maps_to_claude_message() {
        let response = response_with(
            ResponseMessage {
                role: ResponseRole::Assistant,
                content: Some("Hello!".to_string()),
                tool_calls: None,
                refusal: None,
            },
            FinishReason::Stop,
        );
        let out = transform_response(&response, "fast", &ToolNameMap::new()).unwrap();
        assert_eq!(out.model, "fast");
        assert_eq!(out.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(out.usage.input_tokens, 10);
        assert_eq!(out.usage.output_tokens, 5);
        assert_eq!(
            out.content[0],
            ContentBlock::Known(KnownContentBlock::Text {
                text: "Hello!".to_string()
            })
        );
    }

    #[test]
    fn tool_calls_map_to_tool_use_with_original_names() {
        let mut names = ToolNameMap::new();
        names.sanitize("repo.search");

        let response = response_with(
            ResponseMessage {
                role: ResponseRole::Assistant,
                content: None,
                tool_calls: Some(vec![ToolCall {
                    id: "call_9".to_string(),
                    r#type: ToolCallType::Function,
                    function: FunctionCall {
                        name: "repo_search".to_string(),
                        arguments: "{\"q\": \"sse\"}".to_string(),
                    },
                }]),
                refusal: None,
            },
            FinishReason::ToolCalls,
        );
        let out = transform_response(&response, "fast", &names).unwrap();
        assert_eq!(out.stop_reason, Some(StopReason::ToolUse));
        assert_eq!(
            out.content[0],
            ContentBlock::Known(KnownContentBlock::ToolUse {
                id: "call_9".to_string(),
                name: "repo.search".to_string(),
                input: json!({"q": "sse"}),
            })
        );
    }

    #[test]
    fn unparseable_arguments_kept_raw() {
        let response = response_with(
            ResponseMessage {
                role: ResponseRole::Assistant,
                content: None,
                tool_calls: Some(vec![ToolCall {
                    id: "call_9".to_string(),
                    r#type: ToolCallType::Function,
                    function: FunctionCall {
                        name: "calc".to_string(),
                        arguments: "{oops".to_string(),
                    },
                }]),
                refusal: None,
            },
            FinishReason::ToolCalls,
        );
        let out = transform_response(&response, "fast", &ToolNameMap::new()).unwrap();
        let ContentBlock::Known(KnownContentBlock::ToolUse { input, .. }) = &out.content[0] else {
            panic!("expected tool_use");
        };
        assert_eq!(*input, json!({"raw_arguments": "{oops"}));
    }

    #[test]
    fn empty_message_gets_empty_text_block() {
        let response = response_with(
            ResponseMessage {
                role: ResponseRole::Assistant,
                content: None,
                tool_calls: None,
                refusal: None,
            },
            FinishReason::Stop,
        );
        let out = transform_response(&response, "fast", &ToolNameMap::new()).unwrap();
        assert_eq!(
            out.content,
            vec![ContentBlock::Known(KnownContentBlock::Text {
                text: String::new()
            })]
        );
    }

    #[test]
    fn no_choices_is_an_error() {
        let response = ChatCompletionResponse {
            id: "chatcmpl-1".to_string(),
            object: ChatCompletionObject::ChatCompletion,
            created: 0,
            model: "gpt-4".to_string(),
            choices: Vec::new(),
            usage: None,
            system_fingerprint: None,
        };
        assert_eq!(
            transform_response(&response, "fast", &ToolNameMap::new()).unwrap_err(),
            TransformError::NoChoices
        );
    }
}
