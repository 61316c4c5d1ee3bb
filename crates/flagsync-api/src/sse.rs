//! Incremental server-sent-events decoder.
//!
//! Bytes go in as they arrive from the network; complete events come out.
//! Lines may end in `\n`, `\r\n` or `\r`, and a chunk boundary may fall
//! anywhere, including between the `\r` and `\n` of one line ending.

use std::time::Duration;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Event name used when a frame carries no `event:` field.
pub const DEFAULT_EVENT_NAME: &str = "message";

/// One dispatched server event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    /// Joined `data:` lines; `None` if the frame had none.
    pub data: Option<String>,
    pub id: Option<String>,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    line: Vec<u8>,
    after_cr: bool,
    /// Set once the first line of the stream has ended.
    past_first_line: bool,
    event: Option<String>,
    data: Option<String>,
    id: Option<String>,
    last_event_id: Option<String>,
    retry: Option<Duration>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every event it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();
        for &byte in chunk {
            if self.after_cr {
                self.after_cr = false;
                if byte == b'\n' {
                    continue;
                }
            }
            match byte {
                b'\n' => self.end_line(&mut events),
                b'\r' => {
                    self.end_line(&mut events);
                    self.after_cr = true;
                }
                _ => self.line.push(byte),
            }
        }
        events
    }

    /// Most recent `id:` seen, carried across events.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Reconnection delay requested by the server with `retry:`.
    pub fn retry(&self) -> Option<Duration> {
        self.retry
    }

    fn end_line(&mut self, events: &mut Vec<SseEvent>) {
        let raw = std::mem::take(&mut self.line);
        let mut bytes = raw.as_slice();
        if !self.past_first_line {
            self.past_first_line = true;
            bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
        }
        let line = String::from_utf8_lossy(bytes);

        if line.is_empty() {
            if let Some(event) = self.dispatch() {
                events.push(event);
            }
            return;
        }
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (&*line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_owned()),
            "data" => match self.data.as_mut() {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.data = Some(value.to_owned()),
            },
            "id" if !value.contains('\0') => {
                self.id = Some(value.to_owned());
                self.last_event_id = Some(value.to_owned());
            }
            "retry" => {
                if let Ok(millis) = value.parse::<u64>() {
                    self.retry = Some(Duration::from_millis(millis));
                }
            }
            _ => {}
        }
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        let data = self.data.take();
        let id = self.id.take();

        if event.is_none() && data.is_none() {
            return None;
        }

        Some(SseEvent {
            event: event
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| DEFAULT_EVENT_NAME.to_owned()),
            data,
            id,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn decodes_named_event_with_data() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"event: put\ndata: {\"flag\":true}\n\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: "put".into(),
                data: Some("{\"flag\":true}".into()),
                id: None,
            }]
        );
    }

    #[test]
    fn joins_multi_line_data_and_defaults_event_name() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data: first\ndata: second\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, DEFAULT_EVENT_NAME);
        assert_eq!(events[0].data.as_deref(), Some("first\nsecond"));
    }

    #[test]
    fn event_without_data_has_no_payload() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"event: ping\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "ping");
        assert_eq!(events[0].data, None);
    }

    #[test]
    fn handles_chunk_boundaries_and_crlf() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"event: pat").is_empty());
        assert!(decoder.push(b"ch\r").is_empty());
        assert!(decoder.push(b"\ndata: {}\r\n").is_empty());
        let events = decoder.push(b"\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "patch");
        assert_eq!(events[0].data.as_deref(), Some("{}"));
    }

    #[test]
    fn bare_cr_terminates_lines() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"event: delete\rdata: x\r\r");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "delete");
    }

    #[test]
    fn ignores_comments_and_unknown_fields() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b": keepalive\n\n").is_empty());
        let events = decoder.push(b"foo: bar\nevent: put\ndata:x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data.as_deref(), Some("x"));
    }

    #[test]
    fn strips_leading_bom_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"\xEF\xBB").is_empty());
        let events = decoder.push(b"\xBFevent: put\ndata: {}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "put");
    }

    #[test]
    fn bom_is_only_stripped_at_stream_start() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data: a\n\n\xEF\xBB\xBFevent: put\ndata: b\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event, DEFAULT_EVENT_NAME);
    }

    #[test]
    fn tracks_id_and_retry() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"id: 42\nretry: 2500\nevent: put\ndata: {}\n\n");
        assert_eq!(events[0].id.as_deref(), Some("42"));
        assert_eq!(decoder.last_event_id(), Some("42"));
        assert_eq!(decoder.retry(), Some(Duration::from_millis(2500)));

        let events = decoder.push(b"retry: soon\ndata: y\n\n");
        assert_eq!(events[0].id, None);
        assert_eq!(decoder.last_event_id(), Some("42"));
        assert_eq!(decoder.retry(), Some(Duration::from_millis(2500)));
    }
}
