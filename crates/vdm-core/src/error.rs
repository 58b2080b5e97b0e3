use bytes::Bytes;
use thiserror::Error;

use vdm_protocol::claude::error::ErrorEnvelope;

use crate::metrics::ErrorKind;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    Validation(String),
    #[error("provider '{0}' is not configured")]
    ProviderNotFound(String),
    #[error("All provider API keys exhausted")]
    KeysExhausted,
    #[error("Upstream request timed out; consider raising REQUEST_TIMEOUT")]
    Timeout,
    /// Non-2xx upstream response; status and body propagate to the client.
    #[error("upstream returned status {status}")]
    UpstreamStatus { status: u16, body: Bytes },
    #[error("upstream protocol error: {0}")]
    UpstreamProtocol(String),
    #[error("upstream transport error: {0}")]
    Transport(String),
    #[error("{0}")]
    Unexpected(String),
}

impl GatewayError {
    pub fn status(&self) -> u16 {
        match self {
            GatewayError::Validation(_) => 400,
            GatewayError::ProviderNotFound(_) => 404,
            GatewayError::KeysExhausted => 429,
            GatewayError::Timeout => 504,
            GatewayError::UpstreamStatus { status, .. } => *status,
            GatewayError::UpstreamProtocol(_) => 502,
            GatewayError::Transport(_) => 502,
            GatewayError::Unexpected(_) => 500,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Validation(_) => ErrorKind::Validation,
            GatewayError::ProviderNotFound(_) => ErrorKind::Validation,
            GatewayError::KeysExhausted => ErrorKind::Auth,
            GatewayError::Timeout => ErrorKind::Timeout,
            GatewayError::UpstreamStatus { status, .. } => match status {
                401 | 403 => ErrorKind::Auth,
                429 => ErrorKind::RateLimit,
                _ => ErrorKind::UpstreamError,
            },
            GatewayError::UpstreamProtocol(_) => ErrorKind::UpstreamError,
            GatewayError::Transport(_) => ErrorKind::UpstreamError,
            GatewayError::Unexpected(_) => ErrorKind::Unexpected,
        }
    }

    /// Wire name for the Claude error envelope.
    pub fn envelope_kind(&self) -> &'static str {
        match self {
            GatewayError::Validation(_) | GatewayError::ProviderNotFound(_) => {
                "invalid_request_error"
            }
            GatewayError::KeysExhausted => "rate_limit_error",
            GatewayError::Timeout => "timeout_error",
            GatewayError::UpstreamStatus { status, .. } => match status {
                401 | 403 => "authentication_error",
                429 => "rate_limit_error",
                _ => "api_error",
            },
            GatewayError::UpstreamProtocol(_) | GatewayError::Transport(_) => "api_error",
            GatewayError::Unexpected(_) => "api_error",
        }
    }

    /// HTTP body for this error. Upstream JSON bodies propagate verbatim;
    /// everything else is wrapped in the Claude error envelope.
    pub fn body(&self) -> Bytes {
        if let GatewayError::UpstreamStatus { body, .. } = self
            && !body.is_empty()
            && serde_json::from_slice::<serde_json::Value>(body).is_ok()
        {
            return body.clone();
        }
        let envelope = ErrorEnvelope::new(self.envelope_kind(), self.to_string());
        serde_json::to_vec(&envelope).map(Bytes::from).unwrap_or_default()
    }
}
