use bytes::Bytes;
use futures::stream::Stream;
use pin_project::pin_project;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

/// SSE event from the upstream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    /// Format as SSE output for client
    pub fn to_sse_string(&self) -> String {
        let mut output = String::new();

        if let Some(ref event_type) = self.event {
            output.push_str(&format!("event: {}\n", event_type));
        }

        for line in self.data.split('\n') {
            output.push_str(&format!("data: {}\n", line));
        }
        output.push('\n');
        output
    }
}

/// Incremental SSE decoder.
///
/// Bytes may arrive split anywhere, including inside a UTF-8 sequence or between
/// `\r` and `\n`. Only complete lines are interpreted; the rest stays buffered.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no newline
    scanned: usize,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every event completed by it
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = self.buffer[from..].iter().position(|b| *b == b'\n') {
            let pos = from + offset;
            let mut line = &self.buffer[start..pos];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            let line = String::from_utf8_lossy(line).into_owned();
            start = pos + 1;
            from = start;
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();
        events
    }

    /// Flush whatever is left once the byte stream has ended
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            self.scanned = 0;
            let line = String::from_utf8_lossy(&rest);
            let line = line.trim_end_matches('\r');
            if let Some(event) = self.process_line(line) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            // Empty line marks end of event
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            // Ignore other fields like "id:", "retry:", etc.
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: self.event.take(),
            data,
        })
    }
}

/// Parse SSE events from a complete buffer
pub fn parse_sse_events(input: &str) -> Vec<SseEvent> {
    let mut decoder = SseDecoder::new();
    let mut events = decoder.feed(input.as_bytes());
    events.extend(decoder.finish());
    events
}

/// Stream adapter that converts a byte stream into SSE events
#[pin_project]
pub struct SseStream<S> {
    #[pin]
    inner: S,
    decoder: SseDecoder,
    ready: VecDeque<SseEvent>,
    done: bool,
}

impl<S> SseStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            inner: stream,
            decoder: SseDecoder::new(),
            ready: VecDeque::new(),
            done: false,
        }
    }
}

impl<S, E> Stream for SseStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
{
    type Item = Result<SseEvent, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if let Some(event) = this.ready.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
            if *this.done {
                return Poll::Ready(None);
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.ready.extend(this.decoder.feed(&bytes));
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => {
                    // Stream ended - emit a trailing event without blank line
                    *this.done = true;
                    this.ready.extend(this.decoder.finish());
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_parse_sse_single_event() {
        let input = "event: message\ndata: {\"test\":\"value\"}\n\n";
        let events = parse_sse_events(input);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message"));
        assert_eq!(events[0].data, "{\"test\":\"value\"}");
    }

    #[test]
    fn test_parse_sse_multiple_events() {
        let input = "event: start\ndata: {\"a\":1}\n\nevent: delta\ndata: {\"b\":2}\n\n";
        let events = parse_sse_events(input);

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("start"));
        assert_eq!(events[1].event.as_deref(), Some("delta"));
    }

    #[test]
    fn test_parse_sse_no_event_type() {
        let input = "data: plain data\n\n";
        let events = parse_sse_events(input);

        assert_eq!(events.len(), 1);
        assert!(events[0].event.is_none());
        assert_eq!(events[0].data, "plain data");
    }

    #[test]
    fn test_decoder_handles_split_frames_and_crlf() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: {\"a\":").is_empty());
        assert!(decoder.feed(b"1}\r").is_empty());
        let events = decoder.feed(b"\n\r\ndata: second\r\n\r\n");

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "{\"a\":1}");
        assert_eq!(events[1].data, "second");
    }

    #[test]
    fn test_decoder_handles_split_utf8() {
        let bytes = "data: 你好\n\n".as_bytes();
        // Split inside the first multi-byte character
        let (head, tail) = bytes.split_at(7);

        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(head).is_empty());
        let events = decoder.feed(tail);
        assert_eq!(events[0].data, "你好");
    }

    #[test]
    fn test_long_line_in_small_chunks() {
        let payload = "x".repeat(4096);
        let frame = format!("data: {}\n\n", payload);

        let mut decoder = SseDecoder::new();
        let mut events = Vec::new();
        for piece in frame.as_bytes().chunks(3) {
            events.extend(decoder.feed(piece));
            // Only the unfinished tail is ever kept
            assert_eq!(decoder.scanned, decoder.buffer.len());
        }

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, payload);
        assert!(decoder.buffer.is_empty());
    }

    #[test]
    fn test_multiline_data_and_comments() {
        let events = parse_sse_events(": keep-alive\ndata: line1\ndata: line2\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "line1\nline2");
        assert_eq!(events[0].to_sse_string(), "data: line1\ndata: line2\n\n");
    }

    #[tokio::test]
    async fn test_stream_yields_every_event_of_a_chunk() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"data: 1\n\ndata: 2\n\nda")),
            Ok(Bytes::from_static(b"ta: 3")),
        ];
        let events: Vec<_> = SseStream::new(futures::stream::iter(chunks))
            .map(|e| e.unwrap().data)
            .collect()
            .await;

        assert_eq!(events, vec!["1", "2", "3"]);
    }
}
