use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::timeout;

use vdm_core::engine::stream::{StreamTransformer, run_stream_pump};
use vdm_core::metrics::{ErrorKind, MetricsHub, MetricsSink, RequestMetrics};
use vdm_core::upstream::UpstreamStream;
use vdm_protocol::sse::{SseFrame, SseParser};
use vdm_transform::sanitize::ToolNameMap;
use vdm_transform::stream::claude_to_openai::ClaudeToOpenAiStream;
use vdm_transform::stream::openai_to_claude::OpenAiToClaudeStream;

/// Captures the terminal metrics update so tests can assert on it.
#[derive(Default)]
struct RecordingSink {
    finished: Mutex<Option<RequestMetrics>>,
}

impl MetricsSink for RecordingSink {
    fn on_start(&self, _metrics: &RequestMetrics) {}
    fn on_finish(&self, metrics: &RequestMetrics) {
        *self.finished.lock().unwrap() = Some(metrics.clone());
    }
}

fn upstream_from(frames: Vec<&str>) -> UpstreamStream {
    let (tx, rx) = mpsc::channel::<Bytes>(16);
    let chunks: Vec<Bytes> = frames
        .into_iter()
        .map(|frame| Bytes::from(frame.to_string()))
        .collect();
    let task = tokio::spawn(async move {
        for chunk in chunks {
            if tx.send(chunk).await.is_err() {
                return;
            }
        }
    });
    UpstreamStream::from_parts(200, rx, task)
}

fn openai_to_claude_transformer() -> StreamTransformer {
    StreamTransformer::openai_to_claude(OpenAiToClaudeStream::new(
        "msg_test",
        "fast",
        ToolNameMap::new(),
    ))
}

async fn collect_frames(mut rx: mpsc::Receiver<Bytes>) -> Vec<SseFrame> {
    let mut parser = SseParser::new();
    let mut frames = Vec::new();
    while let Some(chunk) = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("stream stalled")
    {
        frames.extend(parser.push_bytes(&chunk));
    }
    frames.extend(parser.finish());
    frames
}

fn event_names(frames: &[SseFrame]) -> Vec<String> {
    frames
        .iter()
        .map(|frame| {
            frame.event.clone().unwrap_or_else(|| {
                if frame.data == "[DONE]" {
                    "[DONE]".to_string()
                } else {
                    "data".to_string()
                }
            })
        })
        .collect()
}

#[tokio::test]
async fn openai_stream_translates_to_ordered_claude_events() {
    let upstream = upstream_from(vec![
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"He\"}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"llo\"}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    ]);

    let sink = Arc::new(RecordingSink::default());
    let hub = MetricsHub::new(vec![sink.clone()]);
    let (tx, rx) = mpsc::channel::<Bytes>(32);
    let metrics = RequestMetrics::new("r1", "fast", true);

    let pump = tokio::spawn(run_stream_pump(
        upstream,
        openai_to_claude_transformer(),
        tx,
        metrics,
        hub,
    ));

    let frames = collect_frames(rx).await;
    pump.await.unwrap();

    assert_eq!(
        event_names(&frames),
        vec![
            "message_start",
            "content_block_start",
            "ping",
            "content_block_delta",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );
    assert!(frames[3].data.contains("\"text\":\"He\""));
    assert!(frames[6].data.contains("\"stop_reason\":\"end_turn\""));

    let finished = sink.finished.lock().unwrap().clone().unwrap();
    assert!(finished.error.is_none());
    assert!(finished.end_time.is_some());
}

#[tokio::test]
async fn split_tool_arguments_produce_one_json_delta() {
    let upstream = upstream_from(vec![
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"calc\"}}]}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"ex\"}}]}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"pression\\\":\"}}]}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\" \\\"2+2\\\"}\"}}]}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n",
        "data: [DONE]\n\n",
    ]);

    let (tx, rx) = mpsc::channel::<Bytes>(32);
    let pump = tokio::spawn(run_stream_pump(
        upstream,
        openai_to_claude_transformer(),
        tx,
        RequestMetrics::new("r1", "fast", true),
        MetricsHub::default(),
    ));

    let frames = collect_frames(rx).await;
    pump.await.unwrap();

    let json_deltas: Vec<&SseFrame> = frames
        .iter()
        .filter(|frame| frame.data.contains("input_json_delta"))
        .collect();
    assert_eq!(json_deltas.len(), 1);
    assert!(
        json_deltas[0]
            .data
            .contains("{\\\"expression\\\": \\\"2+2\\\"}")
    );

    let names = event_names(&frames);
    let start_count = names
        .iter()
        .filter(|name| *name == "content_block_start")
        .count();
    // Text block at index 0 plus one tool block.
    assert_eq!(start_count, 2);
    assert!(
        frames
            .iter()
            .any(|frame| frame.data.contains("\"stop_reason\":\"tool_use\""))
    );
}

#[tokio::test]
async fn client_disconnect_cancels_with_single_error_frame() {
    let (upstream_tx, upstream_rx) = mpsc::channel::<Bytes>(16);
    let upstream = UpstreamStream::from_parts(200, upstream_rx, tokio::spawn(async {}));

    let sink = Arc::new(RecordingSink::default());
    let hub = MetricsHub::new(vec![sink.clone()]);
    let (tx, mut rx) = mpsc::channel::<Bytes>(32);

    let pump = tokio::spawn(run_stream_pump(
        upstream,
        openai_to_claude_transformer(),
        tx,
        RequestMetrics::new("r1", "fast", true),
        hub,
    ));

    upstream_tx
        .send(Bytes::from_static(
            b"data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"He\"}}]}\n\n",
        ))
        .await
        .unwrap();

    // Wait for the first text delta to arrive downstream, then disconnect.
    let mut parser = SseParser::new();
    let mut saw_delta = false;
    while !saw_delta {
        let chunk = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no frames before disconnect")
            .expect("stream closed early");
        for frame in parser.push_bytes(&chunk) {
            if frame.event.as_deref() == Some("content_block_delta") {
                saw_delta = true;
            }
            assert_ne!(frame.event.as_deref(), Some("message_stop"));
        }
    }
    drop(rx);

    // The next upstream chunk forces a downstream write, which now fails.
    upstream_tx
        .send(Bytes::from_static(
            b"data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"llo\"}}]}\n\n",
        ))
        .await
        .unwrap();
    drop(upstream_tx);

    timeout(Duration::from_secs(5), pump)
        .await
        .expect("pump did not stop after disconnect")
        .unwrap();

    let finished = sink.finished.lock().unwrap().clone().unwrap();
    assert_eq!(finished.error_kind, Some(ErrorKind::Cancelled));
    assert!(finished.end_time.is_some());
}

#[tokio::test]
async fn malformed_upstream_json_ends_with_error_event() {
    let upstream = upstream_from(vec![
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"ok\"}}]}\n\n",
        "data: {not json\n\n",
    ]);

    let sink = Arc::new(RecordingSink::default());
    let hub = MetricsHub::new(vec![sink.clone()]);
    let (tx, rx) = mpsc::channel::<Bytes>(32);
    let pump = tokio::spawn(run_stream_pump(
        upstream,
        openai_to_claude_transformer(),
        tx,
        RequestMetrics::new("r1", "fast", true),
        hub,
    ));

    let frames = collect_frames(rx).await;
    pump.await.unwrap();

    let error_frames: Vec<&SseFrame> = frames
        .iter()
        .filter(|frame| frame.event.as_deref() == Some("error"))
        .collect();
    assert_eq!(error_frames.len(), 1);
    assert!(error_frames[0].data.contains("api_error"));
    assert!(
        !frames
            .iter()
            .any(|frame| frame.event.as_deref() == Some("message_stop"))
    );

    let finished = sink.finished.lock().unwrap().clone().unwrap();
    assert_eq!(finished.error_kind, Some(ErrorKind::SseParse));
}

#[tokio::test]
async fn claude_stream_translates_to_openai_chunks() {
    let upstream = upstream_from(vec![
        "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"type\":\"message\",\"role\":\"assistant\",\"model\":\"claude-sonnet\",\"content\":[],\"stop_reason\":null,\"stop_sequence\":null,\"usage\":{\"input_tokens\":0,\"output_tokens\":0}}}\n\n",
        "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
        "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n\n",
        "event: content_block_stop\ndata: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
        "event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\",\"stop_sequence\":null},\"usage\":{\"input_tokens\":9,\"output_tokens\":2}}\n\n",
        "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
    ]);

    let (tx, rx) = mpsc::channel::<Bytes>(32);
    let transformer =
        StreamTransformer::ClaudeToOpenAi(ClaudeToOpenAiStream::new("chatcmpl-1", "gpt-4", 3));
    let pump = tokio::spawn(run_stream_pump(
        upstream,
        transformer,
        tx,
        RequestMetrics::new("r1", "gpt-4", true),
        MetricsHub::default(),
    ));

    let frames = collect_frames(rx).await;
    pump.await.unwrap();

    assert!(frames[0].data.contains("\"role\":\"assistant\""));
    assert!(
        frames
            .iter()
            .any(|frame| frame.data.contains("\"content\":\"Hello\""))
    );
    assert!(
        frames
            .iter()
            .any(|frame| frame.data.contains("\"finish_reason\":\"stop\""))
    );
    assert_eq!(frames.last().unwrap().data, "[DONE]");
}

#[tokio::test]
async fn openai_passthrough_appends_done_when_upstream_drops() {
    let upstream = upstream_from(vec![
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"hi\"}}]}\n\n",
    ]);

    let (tx, rx) = mpsc::channel::<Bytes>(32);
    let pump = tokio::spawn(run_stream_pump(
        upstream,
        StreamTransformer::OpenAiPassthrough { done_sent: false },
        tx,
        RequestMetrics::new("r1", "gpt-4", true),
        MetricsHub::default(),
    ));

    let frames = collect_frames(rx).await;
    pump.await.unwrap();

    assert_eq!(frames.len(), 2);
    assert!(frames[0].data.contains("\"content\":\"hi\""));
    assert_eq!(frames[1].data, "[DONE]");
}
