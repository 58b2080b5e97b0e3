use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde_json::{Value as JsonValue, json};
use tokio::sync::mpsc;
use uuid::Uuid;

use vdm_protocol::claude::count_tokens::{CountTokensRequest, CountTokensResponse};
use vdm_protocol::claude::request::MessagesRequest;
use vdm_protocol::claude::response::MessagesResponse;
use vdm_protocol::claude::types::{ContentBlockParam, MessageContent, SystemParam};
use vdm_protocol::openai::request::ChatCompletionRequest;
use vdm_protocol::openai::response::ChatCompletionResponse;
use vdm_transform::TransformError;
use vdm_transform::stream::claude_to_openai::ClaudeToOpenAiStream;
use vdm_transform::stream::openai_to_claude::OpenAiToClaudeStream;

use crate::alias::{AliasResolver, Resolution};
use crate::auth::OAuthTokenSource;
use crate::config::{ApiFormat, Config, ProviderConfig, Settings};
use crate::error::GatewayError;
use crate::metrics::{MetricsHub, MetricsRegistry, MetricsSink, RequestMetrics, TracingSink};
use crate::registry::ProviderRegistry;
use crate::rotation::KeyRotator;
use crate::upstream::{UpstreamClient, UpstreamPath};

pub mod stream;
pub mod wire;

use stream::{StreamTransformer, run_stream_pump};

const STREAM_CHANNEL_CAPACITY: usize = 32;

/// Response handed to the HTTP layer.
pub enum GatewayResponse {
    Json { status: u16, body: Bytes },
    /// SSE body; the router adds the event-stream headers.
    Stream { rx: mpsc::Receiver<Bytes> },
}

/// The per-request orchestrator: alias resolution, provider lookup, format
/// translation, upstream dispatch, metrics lifecycle.
pub struct Gateway {
    settings: Settings,
    registry: Arc<ProviderRegistry>,
    rotator: Arc<KeyRotator>,
    resolver: AliasResolver,
    client: UpstreamClient,
    metrics: MetricsHub,
    aggregates: Arc<MetricsRegistry>,
}

impl Gateway {
    pub fn new(config: Config, oauth: Arc<dyn OAuthTokenSource>) -> Self {
        let Config {
            settings,
            providers,
            aliases,
        } = config;

        let registry = Arc::new(ProviderRegistry::from_configs(providers));
        let rotator = Arc::new(KeyRotator::new(&registry));
        let resolver = AliasResolver::new(
            aliases,
            registry.names(),
            settings.default_provider.clone(),
            settings.alias_max_chain_length,
        );
        let client = UpstreamClient::new(&settings, rotator.clone(), oauth);

        let aggregates = Arc::new(MetricsRegistry::new());
        let mut sinks: Vec<Arc<dyn MetricsSink>> = vec![aggregates.clone()];
        if settings.log_request_metrics {
            sinks.push(Arc::new(TracingSink));
        }

        Self {
            settings,
            registry,
            rotator,
            resolver,
            client,
            metrics: MetricsHub::new(sinks),
            aggregates,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn rotator(&self) -> &KeyRotator {
        &self.rotator
    }

    pub fn metrics_snapshot(&self) -> JsonValue {
        self.aggregates.snapshot()
    }

    /// `POST /v1/messages` — Anthropic Messages in, Anthropic Messages out.
    pub async fn handle_messages(
        &self,
        body: Bytes,
        client_api_key: Option<String>,
    ) -> GatewayResponse {
        let raw: JsonValue = match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(err) => return invalid_body(err),
        };
        let request: MessagesRequest = match serde_json::from_value(raw.clone()) {
            Ok(request) => request,
            Err(err) => return invalid_body(err),
        };

        let request_id = Uuid::new_v4().to_string();
        let mut metrics =
            RequestMetrics::new(&request_id, &request.model, request.is_streaming());
        self.metrics.on_start(&metrics);

        let resolution = self.resolver.resolve(&request.model, None);
        let provider = match self.registry.get(&resolution.provider) {
            Some(provider) => provider,
            None => {
                return self.fail_json(
                    metrics,
                    GatewayError::ProviderNotFound(resolution.provider),
                );
            }
        };
        metrics.resolve(&provider.name, &resolution.model);
        tracing::debug!(
            %request_id,
            model = %request.model,
            provider = %provider.name,
            resolved = %resolution.model,
            resolved_via_alias = resolution.was_resolved,
            streaming = request.is_streaming(),
            "messages request"
        );

        if request.is_streaming() {
            self.stream_messages(
                &request_id,
                &request,
                raw,
                &resolution,
                &provider,
                client_api_key.as_deref(),
                metrics,
            )
            .await
        } else {

            match self
                .unary_messages(
                    &request_id,
                    &request,
                    raw,
                    &resolution,
                    &provider,
                    client_api_key.as_deref(),
                    &mut metrics,
                )
                .await
            {
                Ok(response) => {
                    self.metrics.finish(&mut metrics);
                    response
                }
                Err(err) => self.fail_json(metrics, err),
            }
        }
    }

    /// `POST /v1/chat/completions` — OpenAI in, OpenAI out.
    pub async fn handle_chat_completions(
        &self,
        body: Bytes,
        client_api_key: Option<String>,
    ) -> GatewayResponse {
        let raw: JsonValue = match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(err) => return invalid_body(err),
        };
        let request: ChatCompletionRequest = match serde_json::from_value(raw.clone()) {
            Ok(request) => request,
            Err(err) => return invalid_body(err),
        };

        let request_id = Uuid::new_v4().to_string();
        let mut metrics =
            RequestMetrics::new(&request_id, &request.model, request.is_streaming());
        self.metrics.on_start(&metrics);

        let resolution = self.resolver.resolve(&request.model, None);
        let provider = match self.registry.get(&resolution.provider) {
            Some(provider) => provider,
            None => {
                return self.fail_json(
                    metrics,
                    GatewayError::ProviderNotFound(resolution.provider),
                );
            }
        };
        metrics.resolve(&provider.name, &resolution.model);
        tracing::debug!(
            %request_id,
            model = %request.model,
            provider = %provider.name,
            resolved = %resolution.model,
            resolved_via_alias = resolution.was_resolved,
            streaming = request.is_streaming(),
            "chat completions request"
        );

        if request.is_streaming() {
            self.stream_chat(
                &request_id,
                &request,
                raw,
                &resolution,
                &provider,
                client_api_key.as_deref(),
                metrics,
            )
            .await
        } else {

            match self
                .unary_chat(
                    &request_id,
                    &request,
                    raw,
                    &resolution,
                    &provider,
                    client_api_key.as_deref(),
                    &mut metrics,
                )
                .await
            {
                Ok(response) => {
                    self.metrics.finish(&mut metrics);
                    response
                }
                Err(err) => self.fail_json(metrics, err),
            }
        }
    }

    /// `POST /v1/messages/count_tokens`. Uses the provider's counting
    /// endpoint when it speaks the Anthropic format, otherwise estimates.
    pub async fn count_tokens(
        &self,
        body: Bytes,
        client_api_key: Option<String>,
    ) -> GatewayResponse {
        let request: CountTokensRequest = match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(err) => return invalid_body(err),
        };

        let request_id = Uuid::new_v4().to_string();
        let resolution = self.resolver.resolve(&request.model, None);

        if let Some(provider) = self.registry.get(&resolution.provider)
            && provider.api_format == ApiFormat::Anthropic
        {
            let mut upstream_body = json!({
                "model": resolution.model,
                "messages": request.messages,
            });
            if let Some(object) = upstream_body.as_object_mut() {
                if let Some(system) = &request.system {
                    object.insert("system".to_string(), json!(system));
                }
                if let Some(tools) = &request.tools {
                    object.insert("tools".to_string(), json!(tools));
                }
            }
            match self
                .client
                .unary(
                    &provider,
                    &upstream_body,
                    &request_id,
                    client_api_key.as_deref(),
                    UpstreamPath::CountTokens,
                )
                .await
            {
                Ok(response) => {
                    if let Ok(counted) =
                        serde_json::from_slice::<CountTokensResponse>(&response.body)
                    {
                        return json_response(200, &counted);
                    }
                }
                Err(err) => {
                    tracing::debug!(
                        %request_id,
                        provider = %provider.name,
                        error = %err,
                        "upstream token count failed, falling back to estimate"
                    );
                }
            }
        }

        let counted = CountTokensResponse {
            input_tokens: estimate_tokens(&request),
        };
        json_response(200, &counted)
    }

    #[allow(clippy::too_many_arguments)]
    async fn unary_messages(
        &self,
        request_id: &str,
        request: &MessagesRequest,
        raw: JsonValue,
        resolution: &Resolution,
        provider: &ProviderConfig,
        client_api_key: Option<&str>,
        metrics: &mut RequestMetrics,
    ) -> Result<GatewayResponse, GatewayError> {
        match provider.api_format {
            ApiFormat::Anthropic => {
                let body = with_model(raw, &resolution.model);
                let response = self
                    .client
                    .unary(
                        provider,
                        &body,
                        request_id,
                        client_api_key,
                        UpstreamPath::Generate,
                    )
                    .await?;
                record_claude_usage(metrics, &response.body);
                Ok(GatewayResponse::Json {
                    status: response.status,
                    body: response.body,
                })
            }
            ApiFormat::OpenAi => {
                let plan = vdm_transform::request::claude_to_openai::transform_request(
                    request,
                    &resolution.model,
                    provider.tool_name_sanitize,
                );
                let body = to_json(&plan.request)?;
                let response = self
                    .client
                    .unary(
                        provider,
                        &body,
                        request_id,
                        client_api_key,
                        UpstreamPath::Generate,
                    )
                    .await?;
                let upstream: ChatCompletionResponse = serde_json::from_slice(&response.body)
                    .map_err(|err| {
                        GatewayError::UpstreamProtocol(format!(
                            "failed to decode upstream response: {err}"
                        ))
                    })?;
                let translated = vdm_transform::response::openai_to_claude::transform_response(
                    &upstream,
                    &request.model,
                    &plan.tool_names,
                )
                .map_err(map_transform_error)?;

                metrics.input_tokens = translated.usage.input_tokens;
                metrics.output_tokens = translated.usage.output_tokens;
                metrics.cache_read_tokens =
                    translated.usage.cache_read_input_tokens.unwrap_or(0);
                metrics.tool_call_count = translated
                    .content
                    .iter()
                    .filter(|block| {
                        matches!(
                            block,
                            vdm_protocol::claude::types::ContentBlock::Known(
                                vdm_protocol::claude::types::KnownContentBlock::ToolUse { .. }
                            )
                        )
                    })
                    .count() as u32;

                json_result(200, &translated)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream_messages(
        &self,
        request_id: &str,
        request: &MessagesRequest,
        raw: JsonValue,
        resolution: &Resolution,
        provider: &ProviderConfig,
        client_api_key: Option<&str>,
        metrics: RequestMetrics,
    ) -> GatewayResponse {
        let (body, transformer) = match provider.api_format {
            ApiFormat::Anthropic => (
                with_model(raw, &resolution.model),
                StreamTransformer::ClaudePassthrough,
            ),
            ApiFormat::OpenAi => {
                let plan = vdm_transform::request::claude_to_openai::transform_request(
                    request,
                    &resolution.model,
                    provider.tool_name_sanitize,
                );
                let mut openai_request = plan.request;
                openai_request.stream = Some(true);
                let body = match to_json(&openai_request) {
                    Ok(body) => body,
                    Err(err) => return self.fail_json(metrics, err),
                };
                let machine = OpenAiToClaudeStream::new(
                    new_message_id(),
                    request.model.clone(),
                    plan.tool_names,
                );
                (body, StreamTransformer::openai_to_claude(machine))
            }
        };

        self.spawn_stream(request_id, provider, body, transformer, client_api_key, metrics)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn unary_chat(
        &self,
        request_id: &str,
        request: &ChatCompletionRequest,
        raw: JsonValue,
        resolution: &Resolution,
        provider: &ProviderConfig,
        client_api_key: Option<&str>,
        metrics: &mut RequestMetrics,
    ) -> Result<GatewayResponse, GatewayError> {
        match provider.api_format {
            ApiFormat::OpenAi => {
                let body = with_model(raw, &resolution.model);
                let response = self
                    .client
                    .unary(
                        provider,
                        &body,
                        request_id,
                        client_api_key,
                        UpstreamPath::Generate,
                    )
                    .await?;
                record_openai_usage(metrics, &response.body);
                Ok(GatewayResponse::Json {
                    status: response.status,
                    body: response.body,
                })
            }
            ApiFormat::Anthropic => {
                let claude_request = vdm_transform::request::openai_to_claude::transform_request(
                    request,
                    &resolution.model,
                )
                .map_err(map_transform_error)?;
                let body = to_json(&claude_request)?;
                let response = self
                    .client
                    .unary(
                        provider,
                        &body,
                        request_id,
                        client_api_key,
                        UpstreamPath::Generate,
                    )
                    .await?;
                let upstream: MessagesResponse =
                    serde_json::from_slice(&response.body).map_err(|err| {
                        GatewayError::UpstreamProtocol(format!(
                            "failed to decode upstream response: {err}"
                        ))
                    })?;
                let translated = vdm_transform::response::claude_to_openai::transform_response(
                    &upstream,
                    &request.model,
                    unix_now(),
                );

                metrics.input_tokens = upstream.usage.input_tokens;
                metrics.output_tokens = upstream.usage.output_tokens;
                metrics.cache_read_tokens = upstream.usage.cache_read_input_tokens.unwrap_or(0);

                json_result(200, &translated)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream_chat(
        &self,
        request_id: &str,
        request: &ChatCompletionRequest,
        raw: JsonValue,
        resolution: &Resolution,
        provider: &ProviderConfig,
        client_api_key: Option<&str>,
        metrics: RequestMetrics,
    ) -> GatewayResponse {
        let (body, transformer) = match provider.api_format {
            ApiFormat::OpenAi => (
                with_model(raw, &resolution.model),
                StreamTransformer::OpenAiPassthrough { done_sent: false },
            ),
            ApiFormat::Anthropic => {
                let claude_request =
                    match vdm_transform::request::openai_to_claude::transform_request(
                        request,
                        &resolution.model,
                    ) {
                        Ok(claude_request) => claude_request,
                        Err(err) => return self.fail_json(metrics, map_transform_error(err)),
                    };
                let mut claude_request = claude_request;
                claude_request.stream = Some(true);
                let body = match to_json(&claude_request) {
                    Ok(body) => body,
                    Err(err) => return self.fail_json(metrics, err),
                };
                let machine = ClaudeToOpenAiStream::new(
                    new_completion_id(),
                    request.model.clone(),
                    unix_now(),
                );
                (body, StreamTransformer::ClaudeToOpenAi(machine))
            }
        };

        self.spawn_stream(request_id, provider, body, transformer, client_api_key, metrics)
            .await
    }

    async fn spawn_stream(
        &self,
        request_id: &str,
        provider: &ProviderConfig,
        body: JsonValue,
        transformer: StreamTransformer,
        client_api_key: Option<&str>,
        metrics: RequestMetrics,
    ) -> GatewayResponse {
        let upstream = match self
            .client
            .stream(provider, &body, request_id, client_api_key)
            .await
        {
            Ok(upstream) => upstream,
            Err(err) => return self.fail_json(metrics, err),
        };

        let (tx, rx) = mpsc::channel::<Bytes>(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(run_stream_pump(
            upstream,
            transformer,
            tx,
            metrics,
            self.metrics.clone(),
        ));
        GatewayResponse::Stream { rx }
    }

    fn fail_json(&self, mut metrics: RequestMetrics, err: GatewayError) -> GatewayResponse {
        metrics.fail(err.kind(), err.to_string());
        self.metrics.finish(&mut metrics);
        GatewayResponse::Json {
            status: err.status(),
            body: err.body(),
        }
    }
}

fn map_transform_error(err: TransformError) -> GatewayError {
    match err {
        TransformError::MissingMaxTokens => GatewayError::Validation(err.to_string()),
        TransformError::NoChoices => GatewayError::UpstreamProtocol(err.to_string()),
    }
}

fn invalid_body(err: serde_json::Error) -> GatewayResponse {
    let err = GatewayError::Validation(format!("invalid request body: {err}"));
    GatewayResponse::Json {
        status: err.status(),
        body: err.body(),
    }
}

fn json_response<T: serde::Serialize>(status: u16, value: &T) -> GatewayResponse {
    match serde_json::to_vec(value) {
        Ok(body) => GatewayResponse::Json {
            status,
            body: Bytes::from(body),
        },
        Err(err) => {
            let err = GatewayError::Unexpected(format!("failed to encode response: {err}"));
            GatewayResponse::Json {
                status: err.status(),
                body: err.body(),
            }
        }
    }
}

fn json_result<T: serde::Serialize>(
    status: u16,
    value: &T,
) -> Result<GatewayResponse, GatewayError> {
    let body = serde_json::to_vec(value)
        .map_err(|err| GatewayError::Unexpected(format!("failed to encode response: {err}")))?;
    Ok(GatewayResponse::Json {
        status,
        body: Bytes::from(body),
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<JsonValue, GatewayError> {
    serde_json::to_value(value)
        .map_err(|err| GatewayError::Unexpected(format!("failed to encode request: {err}")))
}

/// Passthrough bodies keep every client field; only the model is rewritten.
fn with_model(mut value: JsonValue, model: &str) -> JsonValue {
    if let Some(object) = value.as_object_mut() {
        object.insert("model".to_string(), json!(model));
    }
    value
}

fn record_claude_usage(metrics: &mut RequestMetrics, body: &Bytes) {
    let Ok(value) = serde_json::from_slice::<JsonValue>(body) else {
        return;
    };
    let usage = &value["usage"];
    metrics.input_tokens = usage["input_tokens"].as_u64().unwrap_or(0) as u32;
    metrics.output_tokens = usage["output_tokens"].as_u64().unwrap_or(0) as u32;
    metrics.cache_read_tokens = usage["cache_read_input_tokens"].as_u64().unwrap_or(0) as u32;
    metrics.cache_creation_tokens =
        usage["cache_creation_input_tokens"].as_u64().unwrap_or(0) as u32;
}

fn record_openai_usage(metrics: &mut RequestMetrics, body: &Bytes) {
    let Ok(value) = serde_json::from_slice::<JsonValue>(body) else {
        return;
    };
    let usage = &value["usage"];
    metrics.input_tokens = usage["prompt_tokens"].as_u64().unwrap_or(0) as u32;
    metrics.output_tokens = usage["completion_tokens"].as_u64().unwrap_or(0) as u32;
    metrics.cache_read_tokens = usage["prompt_tokens_details"]["cached_tokens"]
        .as_u64()
        .unwrap_or(0) as u32;
}

fn new_message_id() -> String {
    format!("msg_{}", Uuid::new_v4().simple())
}

fn new_completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4().simple())
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

/// Character-count estimate, roughly four characters per token, minimum one.
fn estimate_tokens(request: &CountTokensRequest) -> u32 {
    let mut chars = 0usize;

    if let Some(system) = &request.system {
        chars += match system {
            SystemParam::Text(text) => text.len(),
            SystemParam::Blocks(_) => system.joined("").len(),
        };
    }

    for message in &request.messages {
        match &message.content {
            MessageContent::Text(text) => chars += text.len(),
            MessageContent::Blocks(blocks) => {
                for block in blocks {
                    if let ContentBlockParam::Text { text } = block {
                        chars += text.len();
                    }
                }
            }
        }
    }

    ((chars / 4) as u32).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdm_protocol::claude::types::{MessageParam, MessageRole};

    #[test]
    fn estimate_is_chars_over_four_with_floor_of_one() {
        let request = CountTokensRequest {
            model: "fast".to_string(),
            messages: vec![MessageParam {
                role: MessageRole::User,
                content: MessageContent::Text("x".repeat(40)),
            }],
            system: Some(SystemParam::Text("y".repeat(8))),
            tools: None,
        };
        assert_eq!(estimate_tokens(&request), 12);

        let tiny = CountTokensRequest {
            model: "fast".to_string(),
            messages: vec![MessageParam {
                role: MessageRole::User,
                content: MessageContent::Text("hi".to_string()),
            }],
            system: None,
            tools: None,
        };
        assert_eq!(estimate_tokens(&tiny), 1);
    }

    #[test]
    fn with_model_rewrites_only_the_model_field() {
        let body = json!({"model": "fast", "max_tokens": 10, "extra": {"keep": true}});
        let out = with_model(body, "openai:gpt-4");
        assert_eq!(out["model"], "openai:gpt-4");
        assert_eq!(out["max_tokens"], 10);
        assert_eq!(out["extra"]["keep"], true);
    }
}
