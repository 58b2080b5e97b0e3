use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use wreq::Client;

use crate::auth::{OAuthAccess, OAuthTokenSource};
use crate::config::{ApiFormat, AuthMode, ProviderConfig, Settings};
use crate::error::GatewayError;
use crate::rotation::{KeyRotator, RotationError};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Which upstream operation to hit; the URL depends on the provider format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamPath {
    Generate,
    CountTokens,
}

#[derive(Debug)]
pub struct UnaryResponse {
    pub status: u16,
    pub body: Bytes,
}

/// A committed upstream byte stream. Dropping it (or calling `cancel`)
/// aborts the reader task; the connection is torn down best-effort.
pub struct UpstreamStream {
    pub status: u16,
    rx: mpsc::Receiver<Bytes>,
    task: JoinHandle<()>,
}

impl UpstreamStream {
    /// Assemble from raw parts; lets tests substitute an in-memory upstream.
    pub fn from_parts(status: u16, rx: mpsc::Receiver<Bytes>, task: JoinHandle<()>) -> Self {
        Self { status, rx, task }
    }

    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for UpstreamStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum Credential {
    ApiKey(String),
    Passthrough(String),
    OAuth(OAuthAccess),
}

/// HTTP client for upstream providers. One cached `wreq::Client` per
/// `(provider, streaming)` pair; key rotation happens inside the attempt
/// loops per the retry policy: fail over on 401/403/429 or an
/// `insufficient_quota` detail, never after the response body is committed.
pub struct UpstreamClient {
    rotator: Arc<KeyRotator>,
    oauth: Arc<dyn OAuthTokenSource>,
    request_timeout: Duration,
    connect_timeout: Duration,
    read_timeout: Option<Duration>,
    clients: Mutex<HashMap<(String, bool), Client>>,
}

impl UpstreamClient {
    pub fn new(
        settings: &Settings,
        rotator: Arc<KeyRotator>,
        oauth: Arc<dyn OAuthTokenSource>,
    ) -> Self {
        Self {
            rotator,
            oauth,
            request_timeout: settings.request_timeout,
            connect_timeout: settings.streaming_connect_timeout,
            read_timeout: settings.streaming_read_timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub async fn unary(
        &self,
        provider: &ProviderConfig,
        body: &JsonValue,
        request_id: &str,
        client_api_key: Option<&str>,
        path: UpstreamPath,
    ) -> Result<UnaryResponse, GatewayError> {
        let url = self.url_for(provider, path);
        let client = self.client_for(provider, false)?;
        let mut attempted: HashSet<String> = HashSet::new();

        loop {
            let credential = self.credential(provider, client_api_key, &attempted)?;
            if let Credential::ApiKey(key) = &credential {
                attempted.insert(key.clone());
            }
            tracing::debug!(
                request_id,
                provider = %provider.name,
                attempt = attempted.len().max(1),
                %url,
                "upstream request"
            );

            let request = apply_headers(client.post(&url), provider, &credential).json(body);
            let response = request.send().await.map_err(classify_transport)?;
            let status = response.status().as_u16();
            let body_bytes = response.bytes().await.map_err(classify_transport)?;

            if (200..300).contains(&status) {
                return Ok(UnaryResponse {
                    status,
                    body: body_bytes,
                });
            }
            if provider.auth_mode == AuthMode::ApiKey && should_rotate(status, &body_bytes) {
                tracing::warn!(
                    request_id,
                    provider = %provider.name,
                    status,
                    "upstream rejected key, rotating"
                );
                continue;
            }
            return Err(GatewayError::UpstreamStatus {
                status,
                body: body_bytes,
            });
        }
    }

    /// Open a streaming upstream call. Key fail-over happens only on the
    /// status line; once a 2xx response is accepted the stream is committed
    /// and later failures surface in-band.
    pub async fn stream(
        &self,
        provider: &ProviderConfig,
        body: &JsonValue,
        request_id: &str,
        client_api_key: Option<&str>,
    ) -> Result<UpstreamStream, GatewayError> {
        let url = self.url_for(provider, UpstreamPath::Generate);
        let client = self.client_for(provider, true)?;
        let mut attempted: HashSet<String> = HashSet::new();

        loop {
            let credential = self.credential(provider, client_api_key, &attempted)?;
            if let Credential::ApiKey(key) = &credential {
                attempted.insert(key.clone());
            }
            tracing::debug!(
                request_id,
                provider = %provider.name,
                attempt = attempted.len().max(1),
                %url,
                "upstream stream request"
            );

            let request = apply_headers(client.post(&url), provider, &credential).json(body);
            let response = request.send().await.map_err(classify_transport)?;
            let status = response.status().as_u16();

            if !(200..300).contains(&status) {
                let body_bytes = response.bytes().await.unwrap_or_default();
                if provider.auth_mode == AuthMode::ApiKey && should_rotate(status, &body_bytes) {
                    tracing::warn!(
                        request_id,
                        provider = %provider.name,
                        status,
                        "upstream rejected key, rotating"
                    );
                    continue;
                }
                return Err(GatewayError::UpstreamStatus {
                    status,
                    body: body_bytes,
                });
            }

            let (tx, rx) = mpsc::channel::<Bytes>(32);
            let read_timeout = self.read_timeout;
            let task = tokio::spawn(async move {
                let mut stream = response.bytes_stream();
                loop {
                    let next = match read_timeout {
                        Some(limit) => match tokio::time::timeout(limit, stream.next()).await {
                            Ok(item) => item,
                            Err(_) => break,
                        },
                        None => stream.next().await,
                    };
                    let Some(item) = next else { break };
                    let Ok(chunk) = item else { break };
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
            });

            return Ok(UpstreamStream { status, rx, task });
        }
    }

    fn credential(
        &self,
        provider: &ProviderConfig,
        client_api_key: Option<&str>,
        attempted: &HashSet<String>,
    ) -> Result<Credential, GatewayError> {
        match provider.auth_mode {
            AuthMode::Passthrough => client_api_key
                .map(|key| Credential::Passthrough(key.to_string()))
                .ok_or_else(|| {
                    GatewayError::Validation(format!(
                        "provider '{}' forwards the client API key, but none was supplied",
                        provider.name
                    ))
                }),
            AuthMode::OAuth => Ok(Credential::OAuth(self.oauth.access(&provider.name)?)),
            AuthMode::ApiKey => self
                .rotator
                .next(provider, attempted)
                .map(Credential::ApiKey)
                .map_err(|err| match err {
                    RotationError::Exhausted => GatewayError::KeysExhausted,
                    RotationError::NoKeys(name) => GatewayError::Validation(format!(
                        "provider '{name}' has no API keys configured"
                    )),
                }),
        }
    }

    fn client_for(
        &self,
        provider: &ProviderConfig,
        streaming: bool,
    ) -> Result<Client, GatewayError> {
        let key = (provider.name.clone(), streaming);
        let mut cache = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = cache.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder().connect_timeout(self.connect_timeout);
        if streaming {
            if let Some(read_timeout) = self.read_timeout {
                builder = builder.read_timeout(read_timeout);
            }
        } else {
            builder = builder.timeout(provider.timeout.max(self.request_timeout));
        }
        let client = builder
            .build()
            .map_err(|err| GatewayError::Transport(err.to_string()))?;
        cache.insert(key, client.clone());
        Ok(client)
    }

    fn url_for(&self, provider: &ProviderConfig, path: UpstreamPath) -> String {
        let base = provider.base_url.trim_end_matches('/');
        match (provider.api_format, path) {
            (ApiFormat::OpenAi, UpstreamPath::Generate) => format!("{base}/chat/completions"),
            // OpenAI has no counting endpoint; callers fall back to estimation.
            (ApiFormat::OpenAi, UpstreamPath::CountTokens) => format!("{base}/chat/completions"),
            (ApiFormat::Anthropic, UpstreamPath::Generate) => format!("{base}/v1/messages"),
            (ApiFormat::Anthropic, UpstreamPath::CountTokens) => {
                format!("{base}/v1/messages/count_tokens")
            }
        }
    }
}

fn apply_headers(
    mut request: wreq::RequestBuilder,
    provider: &ProviderConfig,
    credential: &Credential,
) -> wreq::RequestBuilder {
    request = request.header("content-type", "application/json");

    if provider.api_format == ApiFormat::Anthropic {
        request = request.header("anthropic-version", ANTHROPIC_VERSION);
    }

    request = match credential {
        Credential::ApiKey(key) | Credential::Passthrough(key) => match provider.api_format {
            ApiFormat::OpenAi => request.header("authorization", format!("Bearer {key}")),
            ApiFormat::Anthropic => request.header("x-api-key", key),
        },
        Credential::OAuth(access) => request
            .header("authorization", format!("Bearer {}", access.access_token))
            .header("x-account-id", &access.account_id),
    };

    // Custom headers merge after defaults so operators can override them.
    for (name, value) in &provider.custom_headers {
        request = request.header(name, value);
    }
    request
}

/// Key fail-over policy: auth and quota failures only.
pub(crate) fn should_rotate(status: u16, body: &Bytes) -> bool {
    if matches!(status, 401 | 403 | 429) {
        return true;
    }
    String::from_utf8_lossy(body)
        .to_lowercase()
        .contains("insufficient_quota")
}

fn classify_transport(err: wreq::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout
    } else {
        GatewayError::Transport(err.to_string())
    }
}
