use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorEnvelopeType {
    #[serde(rename = "error")]
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

/// The `{type:"error", error:{...}}` envelope used for HTTP error bodies and
/// in-band SSE error frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    #[serde(rename = "type")]
    pub r#type: ErrorEnvelopeType,
    pub error: ErrorDetail,
}

impl ErrorEnvelope {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            r#type: ErrorEnvelopeType::Error,
            error: ErrorDetail {
                kind: kind.into(),
                message: message.into(),
            },
        }
    }
}
