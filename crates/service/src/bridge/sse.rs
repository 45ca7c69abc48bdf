//! SSE frame decoding: bytes -> `(event type, data json)` pairs.
//!
//! A live upstream byte stream must be split only at frame boundaries
//! (`\n\n` or `\r\n\r\n`); a trailing partial frame at end-of-stream is
//! flushed explicitly rather than silently dropped.

use serde_json::Value;

/// One decoded SSE frame: an optional `event:` line plus the JSON payload
/// assembled from one or more concatenated `data:` lines.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub event: Option<String>,
    pub data: Value,
}

/// Stateful byte-buffer decoder. Feed it chunks as they arrive over the
/// wire; it holds any incomplete trailing bytes across calls.
#[derive(Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and returns every complete frame now available.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();
        while let Some((frame_end, next_start)) = find_boundary(&self.buf) {
            let raw: Vec<u8> = self.buf[..frame_end].to_vec();
            self.buf.drain(..next_start);
            if let Some(frame) = parse_raw_frame(&raw) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Parses whatever is left in the buffer as a final, possibly
    /// boundary-less frame. Call once at end-of-stream.
    pub fn flush(&mut self) -> Option<Frame> {
        if self.buf.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.buf);
        parse_raw_frame(&raw)
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Returns `(frame_end, next_frame_start)` for the earliest boundary.
fn find_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = find_subslice(buf, b"\n\n");
    let crlf = find_subslice(buf, b"\r\n\r\n");
    match (lf, crlf) {
        (Some(a), Some(b)) if b < a => Some((b, b + 4)),
        (Some(a), _) => Some((a, a + 2)),
        (None, Some(b)) => Some((b, b + 4)),
        (None, None) => None,
    }
}

fn parse_raw_frame(raw: &[u8]) -> Option<Frame> {
    let text = String::from_utf8_lossy(raw);
    let mut event = None;
    let mut data_lines = Vec::new();
    for line in text.split(['\n']) {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if data_lines.is_empty() {
        return None;
    }
    let joined = data_lines.join("\n");
    if joined.trim() == "[DONE]" {
        return None;
    }
    let data: Value = serde_json::from_str(&joined).ok()?;
    Some(Frame { event, data })
}

/// The `type` field on a Responses-API event, read uniformly whether it
/// came from the `event:` line or the JSON payload's own `type` field
/// (upstream sets both; we trust the payload as authoritative).
pub fn event_type(frame: &Frame) -> String {
    frame
        .data
        .get("type")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| frame.event.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_single_frame_with_event_and_data() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"event: response.output_text.delta\ndata: {\"type\":\"response.output_text.delta\",\"delta\":\"hi\"}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("response.output_text.delta"));
        assert_eq!(event_type(&frames[0]), "response.output_text.delta");
    }

    #[test]
    fn frame_split_across_multiple_pushes_is_held_until_boundary() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"type\":\"a\"").is_empty());
        let frames = decoder.push(b",\"delta\":\"x\"}\n\n");
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn crlf_boundary_is_recognized() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"data: {\"type\":\"a\"}\r\n\r\n");
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn multiple_data_lines_concatenate_with_newline() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"data: {\"type\":\"a\",\n data: \"delta\":\"x\"}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data.get("delta").and_then(Value::as_str), Some("x"));
    }

    #[test]
    fn done_sentinel_yields_no_frame() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"data: [DONE]\n\n");
        assert!(frames.is_empty());
    }

    #[test]
    fn trailing_partial_frame_flushed_at_end_of_stream() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"type\":\"a\"}").is_empty());
        let flushed = decoder.flush().expect("trailing frame");
        assert_eq!(event_type(&flushed), "a");
        assert!(decoder.flush().is_none());
    }

    #[test]
    fn two_frames_in_one_push_are_both_decoded() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"data: {\"type\":\"a\"}\n\ndata: {\"type\":\"b\"}\n\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(event_type(&frames[0]), "a");
        assert_eq!(event_type(&frames[1]), "b");
    }
}
