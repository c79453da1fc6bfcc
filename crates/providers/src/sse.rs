//! Incremental server-sent-events decoder.
//!
//! Works on raw bytes so a UTF-8 sequence split across network chunks is
//! reassembled before decoding.

/// One dispatched SSE message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseMessage {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl SseMessage {
    pub fn is_error(&self) -> bool {
        self.event.as_deref() == Some("error")
    }
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning every message completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseMessage> {
        self.buffer.extend_from_slice(bytes);
        let mut messages = Vec::new();

        while let Some(line_end) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=line_end).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(message) = self.process_line(&line) {
                messages.push(message);
            }
        }
        messages
    }

    /// Flush a trailing message the server did not terminate with a blank line.
    pub fn finish(&mut self) -> Option<SseMessage> {
        if !self.buffer.is_empty() {
            let line = String::from_utf8_lossy(&std::mem::take(&mut self.buffer)).into_owned();
            if let Some(message) = self.process_line(line.trim_end_matches('\r')) {
                return Some(message);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseMessage> {
        if line.is_empty() {
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
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            // "retry" and unknown fields are ignored
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseMessage> {
        if self.data.is_empty() && self.event.is_none() {
            return None;
        }
        let message = SseMessage {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
            id: self.id.take(),
        };
        Some(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_events_split_anywhere() {
        let raw = b"event: message\ndata: {\"a\":1}\n\n: keep-alive\ndata: second\r\n\r\n";
        for split in 1..raw.len() {
            let mut decoder = SseDecoder::new();
            let mut messages = decoder.push(&raw[..split]);
            messages.extend(decoder.push(&raw[split..]));
            assert_eq!(messages.len(), 2, "split at {split}");
            assert_eq!(messages[0].event.as_deref(), Some("message"));
            assert_eq!(messages[0].data, "{\"a\":1}");
            assert_eq!(messages[1].event, None);
            assert_eq!(messages[1].data, "second");
        }
    }

    #[test]
    fn multi_line_data_and_id() {
        let mut decoder = SseDecoder::new();
        let messages = decoder.push(b"id: 7\ndata: line one\ndata:line two\n\n");
        assert_eq!(
            messages,
            vec![SseMessage {
                event: None,
                data: "line one\nline two".into(),
                id: Some("7".into())
            }]
        );
    }

    #[test]
    fn utf8_split_across_chunks() {
        let raw = "data: caf\u{e9}\n\n".as_bytes();
        let cut = raw.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(&raw[..cut]).is_empty());
        let messages = decoder.push(&raw[cut..]);
        assert_eq!(messages[0].data, "caf\u{e9}");
    }

    #[test]
    fn error_event_and_trailing_flush() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"event: error\ndata: overloaded").is_empty());
        let last = decoder.finish().unwrap();
        assert!(last.is_error());
        assert_eq!(last.data, "overloaded");
        assert!(decoder.finish().is_none());
    }
}
