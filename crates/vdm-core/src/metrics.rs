use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde_json::{Value as JsonValue, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Auth,
    RateLimit,
    Timeout,
    UpstreamError,
    Cancelled,
    SseParse,
    Unexpected,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::Auth => "AUTH",
            ErrorKind::RateLimit => "RATE_LIMIT",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::UpstreamError => "UPSTREAM_ERROR",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::SseParse => "SSE_PARSE",
            ErrorKind::Unexpected => "UNEXPECTED_ERROR",
        }
    }
}

/// Per-request lifecycle record, owned by the engine for the life of one
/// request.
#[derive(Debug, Clone)]
pub struct RequestMetrics {
    pub request_id: String,
    pub provider: String,
    pub client_model: String,
    pub resolved_model: String,
    pub is_streaming: bool,
    pub start_time: Instant,
    pub end_time: Option<Instant>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_read_tokens: u32,
    pub cache_creation_tokens: u32,
    pub tool_call_count: u32,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl RequestMetrics {
    pub fn new(request_id: impl Into<String>, client_model: impl Into<String>, is_streaming: bool) -> Self {
        Self {
            request_id: request_id.into(),
            provider: String::new(),
            client_model: client_model.into(),
            resolved_model: String::new(),
            is_streaming,
            start_time: Instant::now(),
            end_time: None,
            input_tokens: 0,
            output_tokens: 0,
            cache_read_tokens: 0,
            cache_creation_tokens: 0,
            tool_call_count: 0,
            error: None,
            error_kind: None,
        }
    }

    pub fn resolve(&mut self, provider: &str, resolved_model: &str) {
        self.provider = provider.to_string();
        self.resolved_model = resolved_model.to_string();
    }

    pub fn fail(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.error = Some(message.into());
        self.error_kind = Some(kind);
    }

    /// Stamp the terminal time; idempotent so a finalizer guard and an error
    /// path cannot double-close.
    pub fn close(&mut self) {
        if self.end_time.is_none() {
            self.end_time = Some(Instant::now());
        }
    }

    pub fn duration_ms(&self) -> u128 {
        self.end_time
            .unwrap_or_else(Instant::now)
            .duration_since(self.start_time)
            .as_millis()
    }
}

/// One lifecycle observer. The engine always runs the same code path and the
/// "disabled" configuration is just the absence of the logging sink.
pub trait MetricsSink: Send + Sync {
    fn on_start(&self, metrics: &RequestMetrics);
    fn on_finish(&self, metrics: &RequestMetrics);
}

pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn on_start(&self, _metrics: &RequestMetrics) {}
    fn on_finish(&self, _metrics: &RequestMetrics) {}
}

/// Logs request lifecycles through `tracing`.
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn on_start(&self, metrics: &RequestMetrics) {
        tracing::debug!(
            request_id = %metrics.request_id,
            model = %metrics.client_model,
            streaming = metrics.is_streaming,
            "request started"
        );
    }

    fn on_finish(&self, metrics: &RequestMetrics) {
        match (&metrics.error, metrics.error_kind) {
            (Some(error), kind) => tracing::warn!(
                request_id = %metrics.request_id,
                provider = %metrics.provider,
                model = %metrics.resolved_model,
                duration_ms = metrics.duration_ms() as u64,
                error_type = kind.map(|k| k.as_str()).unwrap_or("UNKNOWN"),
                error = %error,
                "request failed"
            ),
            (None, _) => tracing::info!(
                request_id = %metrics.request_id,
                provider = %metrics.provider,
                model = %metrics.resolved_model,
                duration_ms = metrics.duration_ms() as u64,
                input_tokens = metrics.input_tokens,
                output_tokens = metrics.output_tokens,
                "request completed"
            ),
        }
    }
}

#[derive(Debug, Default)]
struct ProviderCounters {
    requests: u64,
    errors: u64,
    input_tokens: u64,
    output_tokens: u64,
}

/// Process-wide aggregate backing `GET /metrics`. Counter updates are atomic
/// or behind a short lock; nothing here runs per SSE frame.
#[derive(Default)]
pub struct MetricsRegistry {
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    active_requests: AtomicI64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    per_provider: Mutex<BTreeMap<String, ProviderCounters>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> JsonValue {
        let per_provider = self
            .per_provider
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let providers: BTreeMap<&String, JsonValue> = per_provider
            .iter()
            .map(|(name, counters)| {
                (
                    name,
                    json!({
                        "requests": counters.requests,
                        "errors": counters.errors,
                        "input_tokens": counters.input_tokens,
                        "output_tokens": counters.output_tokens,
                    }),
                )
            })
            .collect();

        json!({
            "total_requests": self.total_requests.load(Ordering::Relaxed),
            "total_errors": self.total_errors.load(Ordering::Relaxed),
            "active_requests": self.active_requests.load(Ordering::Relaxed),
            "input_tokens": self.input_tokens.load(Ordering::Relaxed),
            "output_tokens": self.output_tokens.load(Ordering::Relaxed),
            "providers": providers,
        })
    }
}

impl MetricsSink for MetricsRegistry {
    fn on_start(&self, _metrics: &RequestMetrics) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    fn on_finish(&self, metrics: &RequestMetrics) {
        self.active_requests.fetch_sub(1, Ordering::Relaxed);
        self.input_tokens
            .fetch_add(metrics.input_tokens as u64, Ordering::Relaxed);
        self.output_tokens
            .fetch_add(metrics.output_tokens as u64, Ordering::Relaxed);
        if metrics.error.is_some() {
            self.total_errors.fetch_add(1, Ordering::Relaxed);
        }

        if metrics.provider.is_empty() {
            return;
        }
        let mut per_provider = self
            .per_provider
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let counters = per_provider.entry(metrics.provider.clone()).or_default();
        counters.requests += 1;
        counters.input_tokens += metrics.input_tokens as u64;
        counters.output_tokens += metrics.output_tokens as u64;
        if metrics.error.is_some() {
            counters.errors += 1;
        }
    }
}

/// Fan-out over the configured sinks.
#[derive(Clone, Default)]
pub struct MetricsHub {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl MetricsHub {
    pub fn new(sinks: Vec<Arc<dyn MetricsSink>>) -> Self {
        Self { sinks }
    }

    pub fn on_start(&self, metrics: &RequestMetrics) {
        for sink in &self.sinks {
            sink.on_start(metrics);
        }
    }

    /// Terminal update; closes the metrics record first.
    pub fn finish(&self, metrics: &mut RequestMetrics) {
        metrics.close();
        for sink in &self.sinks {
            sink.on_finish(metrics);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_tracks_totals_and_providers() {
        let registry = MetricsRegistry::new();
        let mut metrics = RequestMetrics::new("r1", "fast", false);
        metrics.resolve("openai", "gpt-4o-mini");
        registry.on_start(&metrics);
        metrics.input_tokens = 10;
        metrics.output_tokens = 4;
        metrics.close();
        registry.on_finish(&metrics);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot["total_requests"], 1);
        assert_eq!(snapshot["active_requests"], 0);
        assert_eq!(snapshot["providers"]["openai"]["input_tokens"], 10);
    }

    #[test]
    fn close_is_idempotent() {
        let mut metrics = RequestMetrics::new("r1", "fast", true);
        metrics.close();
        let first = metrics.end_time;
        metrics.close();
        assert_eq!(first, metrics.end_time);
    }
}
