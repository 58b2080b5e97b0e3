use vdm_protocol::claude::response::MessagesResponse;
use vdm_protocol::claude::types::{ContentBlock, KnownContentBlock, StopReason};
use vdm_protocol::openai::response::{
    ChatChoice, ChatCompletionObject, ChatCompletionResponse, ResponseMessage, ResponseRole,
};
use vdm_protocol::openai::types::{
    CompletionUsage, FinishReason, FunctionCall, PromptTokensDetails, ToolCall, ToolCallType,
};

/// Convert a unary Anthropic message into an OpenAI chat-completions
/// response, reporting `client_model` and the supplied `created` timestamp.
pub fn transform_response(
    response: &MessagesResponse,
    client_model: &str,
    created: i64,
) -> ChatCompletionResponse {
    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for block in &response.content {
        match block {
            ContentBlock::Known(KnownContentBlock::Text { text }) => text_parts.push(text),
            ContentBlock::Known(KnownContentBlock::ToolUse { id, name, input }) => {
                tool_calls.push(ToolCall {
                    id: id.clone(),
                    r#type: ToolCallType::Function,
                    function: FunctionCall {
                        name: name.clone(),
                        arguments: serde_json::to_string(input)
                            .unwrap_or_else(|_| "{}".to_string()),
                    },
                });
            }
            ContentBlock::Unknown(_) => {}
        }
    }

    let message = ResponseMessage {
        role: ResponseRole::Assistant,
        content: Some(text_parts.concat()),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        refusal: None,
    };

    let cache_read = response.usage.cache_read_input_tokens;
    let usage = CompletionUsage {
        prompt_tokens: response.usage.input_tokens,
        completion_tokens: response.usage.output_tokens,
        total_tokens: response.usage.input_tokens + response.usage.output_tokens,
        prompt_tokens_details: cache_read.map(|cached_tokens| PromptTokensDetails {
            cached_tokens: Some(cached_tokens),
        }),
    };

    ChatCompletionResponse {
        id: response.id.clone(),
        object: ChatCompletionObject::ChatCompletion,
        created,
        model: client_model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message,
            finish_reason: Some(map_stop_reason(response.stop_reason)),
        }],
        usage: Some(usage),
        system_fingerprint: None,
    }
}

pub(crate) fn map_stop_reason(reason: Option<StopReason>) -> FinishReason {
    match reason {
        Some(StopReason::MaxTokens) => FinishReason::Length,
        Some(StopReason::ToolUse) => FinishReason::ToolCalls,
        Some(StopReason::Refusal) => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}
