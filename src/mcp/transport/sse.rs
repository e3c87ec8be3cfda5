//! Incremental server-sent-events decoding shared by the HTTP transports.

/// Splits an arbitrary byte stream into complete lines.
///
/// SSE frames arrive in network-sized chunks that need not align with line
/// boundaries; this buffer carries the remainder across chunks. Carriage
/// returns before the newline are stripped. Empty lines are preserved
/// because they delimit events.
#[derive(Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        self.drain_lines(false)
    }

    pub fn finish(&mut self) -> Vec<String> {
        self.drain_lines(true)
    }

    fn drain_lines(&mut self, flush: bool) -> Vec<String> {
        let mut lines = Vec::new();
        let mut search_index = 0;

        while let Some(relative_pos) = self.buffer[search_index..].iter().position(|b| *b == b'\n')
        {
            let newline_index = search_index + relative_pos;
            let mut line_end = newline_index;
            if line_end > search_index && self.buffer[line_end - 1] == b'\r' {
                line_end -= 1;
            }

            if let Ok(text) = std::str::from_utf8(&self.buffer[search_index..line_end]) {
                lines.push(text.to_string());
            }

            search_index = newline_index + 1;
        }

        if flush {
            if let Ok(text) = std::str::from_utf8(&self.buffer[search_index..]) {
                if !text.is_empty() {
                    lines.push(text.to_string());
                }
            }
            self.buffer.clear();
        } else if search_index > 0 {
            self.buffer.drain(..search_index);
        }

        lines
    }
}

/// One decoded SSE event: the optional `event:` name and the joined `data:`
/// payload.
#[derive(Debug, PartialEq)]
pub struct SseEvent {
    pub name: Option<String>,
    pub data: String,
}

/// Assembles lines into events per the SSE framing rules: comment lines are
/// dropped, `event:`/`data:` fields accumulate, and a blank line dispatches
/// the pending event.
#[derive(Default)]
pub struct SseEventParser {
    event_name: Option<String>,
    data: Vec<String>,
}

impl SseEventParser {
    pub fn feed_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            if self.data.is_empty() {
                self.event_name = None;
                return None;
            }
            let event = SseEvent {
                name: self.event_name.take(),
                data: self.data.join("\n"),
            };
            self.data.clear();
            return Some(event);
        }

        if line.starts_with(':') {
            return None;
        }

        if let Some(value) = line.strip_prefix("event:") {
            self.event_name = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            self.data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
        // Other fields (id:, retry:) are irrelevant to this client.
        None
    }

    /// Dispatch whatever is buffered when the stream ends mid-event.
    pub fn finish(&mut self) -> Option<SseEvent> {
        self.feed_line("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_spans_chunk_boundaries() {
        let mut buffer = SseLineBuffer::default();
        assert!(buffer.push(b"data: par").is_empty());
        let lines = buffer.push(b"tial\r\n\n");
        assert_eq!(lines, vec!["data: partial", ""]);
    }

    #[test]
    fn event_parser_joins_multiple_data_lines() {
        let mut parser = SseEventParser::default();
        assert!(parser.feed_line("data: first").is_none());
        assert!(parser.feed_line("data: second").is_none());
        let event = parser.feed_line("").unwrap();
        assert_eq!(event.name, None);
        assert_eq!(event.data, "first\nsecond");
    }

    #[test]
    fn event_parser_carries_event_name() {
        let mut parser = SseEventParser::default();
        parser.feed_line("event: endpoint");
        parser.feed_line("data: /message?session=abc");
        let event = parser.feed_line("").unwrap();
        assert_eq!(event.name.as_deref(), Some("endpoint"));
        assert_eq!(event.data, "/message?session=abc");
    }

    #[test]
    fn comments_and_bare_blanks_are_skipped() {
        let mut parser = SseEventParser::default();
        assert!(parser.feed_line(": keep-alive").is_none());
        assert!(parser.feed_line("").is_none());
        parser.feed_line("data: x");
        assert!(parser.feed_line("").is_some());
    }
}
