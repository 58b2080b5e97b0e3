use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransformError {
    /// Anthropic requires `max_tokens`; the OpenAI request carried neither
    /// `max_tokens` nor `max_completion_tokens`.
    #[error("request is missing max_tokens (or max_completion_tokens)")]
    MissingMaxTokens,
    /// The upstream response had an empty `choices` array.
    #[error("upstream response contained no choices")]
    NoChoices,
}
