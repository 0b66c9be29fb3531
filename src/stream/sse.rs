//! Incremental `text/event-stream` decoding.
//!
//! The Flowdock stream delivers one JSON document per event in `data:` lines.
//! [`EventDecoder`] turns arbitrary byte chunks into complete [`RawEvent`]s,
//! buffering partial lines across chunk boundaries.

use std::sync::Arc;

use crate::stream::client::StreamError;

/// A push event as framed on the wire, before its payload is parsed.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RawEvent {
    /// Value of the `event:` field, if the server sent one.
    pub event: Option<String>,
    /// Value of the last `id:` field seen in this event.
    pub id: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: String,
}

/// Line-oriented SSE state machine.
#[derive(Debug, Default)]
pub struct EventDecoder {
    pending: Vec<u8>,
    // bytes of `pending` already searched for a line terminator
    scanned: usize,
    event: Option<String>,
    id: Option<String>,
    data: Vec<String>,
    has_data: bool,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every event completed by it, in order.
    ///
    /// Lines must be valid UTF-8. Decoding stops at the first line that is
    /// not; the events completed before it are still returned, alongside
    /// the error.
    pub fn feed(&mut self, chunk: &[u8]) -> (Vec<RawEvent>, Option<StreamError>) {
        self.pending.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut failure = None;
        let mut start = 0;
        let mut search_from = self.scanned;
        while let Some(offset) = self.pending[search_from..].iter().position(|b| *b == b'\n') {
            let end = search_from + offset;
            let line = match std::str::from_utf8(&self.pending[start..end]) {
                Ok(line) => line.to_owned(),
                Err(err) => {
                    failure = Some(StreamError::InvalidUtf8(Arc::new(err)));
                    start = end + 1;
                    break;
                }
            };
            start = end + 1;
            search_from = start;
            if let Some(event) = self.feed_line(&line) {
                events.push(event);
            }
        }
        self.pending.drain(..start);
        self.scanned = if failure.is_some() { 0 } else { self.pending.len() };
        (events, failure)
    }

    /// True when bytes of an unterminated event are still buffered.
    pub fn has_partial(&self) -> bool {
        !self.pending.is_empty() || self.has_data || self.event.is_some()
    }

    fn feed_line(&mut self, line: &str) -> Option<RawEvent> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            return self.dispatch();
        }

        // comment, used by the server as a heartbeat
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_owned()),
            "data" => {
                self.data.push(value.to_owned());
                self.has_data = true;
            }
            "id" => self.id = Some(value.to_owned()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<RawEvent> {
        let event = self.event.take();
        let id = self.id.take();
        if !std::mem::take(&mut self.has_data) {
            return None;
        }

        Some(RawEvent {
            event,
            id,
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}
