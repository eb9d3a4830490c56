//! Server-sent-event framing for run streams.
//!
//! Frames are `data: <json>\n\n`. The server interleaves `keepalive` frames
//! while a run is quiet; [`SseDecoder`] reassembles frames split across reads
//! and drops keepalives.

use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::warn;

use super::StreamEvent;

const DATA_PREFIX: &str = "data:";

/// Interleave `keepalive` events into `events` every `period` of silence
/// from the keepalive ticker. Ends when `events` ends.
pub fn with_keepalive<S>(events: S, period: Duration) -> impl Stream<Item = StreamEvent> + Send
where
    S: Stream<Item = StreamEvent> + Send + 'static,
{
    let period = period.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    futures::stream::unfold(
        (Box::pin(events), ticker),
        |(mut events, mut ticker)| async move {
            tokio::select! {
                biased;
                next = events.next() => next.map(|event| (event, (events, ticker))),
                _ = ticker.tick() => Some((StreamEvent::Keepalive, (events, ticker))),
            }
        },
    )
}

/// Incremental decoder for a `text/event-stream` body.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every event completed by it, keepalives
    /// excluded. Malformed payloads are logged and skipped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some((end, delim)) = find_frame_end(&self.buf) {
            let frame: Vec<u8> = self.buf.drain(..end + delim).collect();
            let text = String::from_utf8_lossy(&frame[..end]);
            if let Some(event) = decode_frame(&text) {
                events.push(event);
            }
        }
        events
    }

    /// Decode whatever remains buffered once the body has ended.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        let rest = std::mem::take(&mut self.buf);
        let text = String::from_utf8_lossy(&rest);
        if text.trim().is_empty() {
            return None;
        }
        decode_frame(&text)
    }
}

/// Position of the first blank-line delimiter and its length.
fn find_frame_end(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn decode_frame(frame: &str) -> Option<StreamEvent> {
    // Multi-line data fields are joined with newlines.
    let data: Vec<&str> = frame
        .lines()
        .filter_map(|line| line.strip_prefix(DATA_PREFIX))
        .map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
        .collect();
    if data.is_empty() {
        return None;
    }
    let payload = data.join("\n");
    match serde_json::from_str::<StreamEvent>(&payload) {
        Ok(StreamEvent::Keepalive) => None,
        Ok(event) => Some(event),
        Err(e) => {
            warn!(error = %e, "skipping malformed event frame");
            None
        }
    }
}
