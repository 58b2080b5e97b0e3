use bytes::Bytes;

/// One server-sent event: optional `event:` name plus the joined `data:` payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE decoder.
///
/// Bytes accumulate in one pending buffer and frames are cut only at blank
/// lines; field lines are read per completed frame, never as they trickle
/// in. Because nothing is interpreted before the frame boundary, upstreams
/// that deliver the `event:` and `data:` lines of one frame in separate
/// chunks decode the same as well-behaved ones.
#[derive(Debug, Default)]
pub struct SseParser {
    pending: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<SseFrame> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.pending.push_str(chunk);

        let mut frames = Vec::new();
        while let Some((end, terminator)) = frame_boundary(&self.pending) {
            let block = self.pending[..end].to_string();
            self.pending.drain(..end + terminator);
            frames.extend(parse_block(&block));
        }
        frames
    }

    /// Flush an unterminated trailing frame when the upstream closes without
    /// a final blank line.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        let tail = std::mem::take(&mut self.pending);
        parse_block(&tail).into_iter().collect()
    }
}

/// Byte offset of the earliest blank-line terminator, plus the terminator's
/// own width (`\n\n` or `\n\r\n`).
fn frame_boundary(text: &str) -> Option<(usize, usize)> {
    let bare = text.find("\n\n").map(|at| (at, 2));
    let carriage = text.find("\n\r\n").map(|at| (at, 3));
    match (bare, carriage) {
        (Some(bare), Some(carriage)) => Some(if carriage.0 < bare.0 { carriage } else { bare }),
        (bare, carriage) => bare.or(carriage),
    }
}

/// Read one frame's fields. Blocks carrying neither an event name nor data
/// (comments, unknown fields) yield nothing.
fn parse_block(block: &str) -> Option<SseFrame> {
    let mut event: Option<String> = None;
    let mut data: Option<String> = None;

    for line in block.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        // Field name before the first ':'; the value sheds one leading
        // space. A line with no ':' is a field name with an empty value.
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = (!value.is_empty()).then(|| value.to_string()),
            "data" => match &mut data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => data = Some(value.to_string()),
            },
            // Comment lines have an empty field name; anything else is an
            // unrecognized field.
            _ => {}
        }
    }

    if event.is_none() && data.is_none() {
        return None;
    }
    Some(SseFrame {
        event,
        data: data.unwrap_or_default(),
    })
}

/// Encode one outbound frame. Multi-line data becomes one `data:` line per
/// line so the frame survives re-parsing.
pub fn encode_frame(event: Option<&str>, data: &str) -> Bytes {
    let head = event
        .map(|name| format!("event: {name}\n"))
        .unwrap_or_default();
    let body: String = data.split('\n').map(|line| format!("data: {line}\n")).collect();
    Bytes::from(format!("{head}{body}\n"))
}

/// Terminal sentinel for OpenAI-format streams.
pub fn encode_done() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_with_event_and_data() {
        let mut parser = SseParser::new();
        let frames = parser.push_str("event: message_start\ndata: {\"a\":1}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("message_start"));
        assert_eq!(frames[0].data, "{\"a\":1}");
    }

    #[test]
    fn data_only_frames_and_crlf() {
        let mut parser = SseParser::new();
        let frames = parser.push_str("data: one\r\n\r\ndata: two\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event, None);
        assert_eq!(frames[0].data, "one");
        assert_eq!(frames[1].data, "two");
    }

    #[test]
    fn event_and_data_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("event: content_block_delta\n").is_empty());
        assert!(parser.push_str("data: {\"x\"").is_empty());
        let frames = parser.push_str(":2}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("content_block_delta"));
        assert_eq!(frames[0].data, "{\"x\":2}");
    }

    #[test]
    fn multi_line_data_joined_with_newline() {
        let mut parser = SseParser::new();
        let frames = parser.push_str("data: a\ndata: b\n\n");
        assert_eq!(frames[0].data, "a\nb");
    }

    #[test]
    fn comments_are_skipped() {
        let mut parser = SseParser::new();
        let frames = parser.push_str(": keep-alive\n\ndata: x\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "x");
    }

    #[test]
    fn colonless_lines_are_empty_valued_fields() {
        let mut parser = SseParser::new();
        let frames = parser.push_str("data\ndata: x\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "\nx");
    }

    #[test]
    fn finish_flushes_unterminated_frame() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("data: tail").is_empty());
        let frames = parser.finish();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "tail");
    }

    #[test]
    fn encode_round_trip() {
        let bytes = encode_frame(Some("ping"), "{\"type\":\"ping\"}");
        let mut parser = SseParser::new();
        let frames = parser.push_bytes(&bytes);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("ping"));
        assert_eq!(frames[0].data, "{\"type\":\"ping\"}");
    }
}
