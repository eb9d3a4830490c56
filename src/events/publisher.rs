use std::sync::Mutex;

use chrono::Utc;
use futures::Stream;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;
use velo_common::{LogEvent, LogTag, RunReport, Stage};

use super::StreamEvent;

/// Producer side of one run's event stream.
///
/// Sequence assignment and the broadcast send happen under one lock, so every
/// subscriber observes logs in strictly increasing `seq` order. Sending never
/// waits on consumers.
pub struct EventPublisher {
    run_id: Uuid,
    tx: broadcast::Sender<StreamEvent>,
    last_seq: Mutex<u64>,
}

impl EventPublisher {
    pub fn new(run_id: Uuid, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            run_id,
            tx,
            last_seq: Mutex::new(0),
        }
    }

    /// Subscribe from the current point of the stream.
    pub fn subscribe(&self) -> EventSubscription {
        let guard = self.lock_seq();
        EventSubscription {
            rx: self.tx.subscribe(),
            last_seq: *guard,
            finished: false,
        }
    }

    pub fn log(&self, tag: LogTag, message: impl Into<String>) -> LogEvent {
        self.emit(tag, None, message.into())
    }

    pub fn log_stage(&self, tag: LogTag, stage: Stage, message: impl Into<String>) -> LogEvent {
        self.emit(tag, Some(stage), message.into())
    }

    /// Announce a node transition with the legacy `── Node: <Name>` message.
    pub fn node(&self, stage: Stage) -> LogEvent {
        self.emit(LogTag::Agent, Some(stage), stage.node_message())
    }

    /// Close the stream with the terminal event for `report`.
    pub fn finish(&self, report: &RunReport) {
        self.send(StreamEvent::terminal(report));
    }

    fn emit(&self, tag: LogTag, stage: Option<Stage>, message: String) -> LogEvent {
        let mut seq = self.lock_seq();
        *seq += 1;
        let event = LogEvent {
            seq: *seq,
            tag,
            message,
            timestamp: Utc::now(),
            stage,
        };
        debug!(
            run_id = %self.run_id,
            seq = event.seq,
            tag = event.tag.as_str(),
            "{}",
            event.message
        );
        // No receivers is fine: the run proceeds without subscribers.
        let _ = self.tx.send(StreamEvent::Log(event.clone()));
        event
    }

    fn send(&self, event: StreamEvent) {
        let _guard = self.lock_seq();
        let _ = self.tx.send(event);
    }

    fn lock_seq(&self) -> std::sync::MutexGuard<'_, u64> {
        // The guarded value is a plain counter, safe to reuse after a poison.
        self.last_seq.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Consumer side of a run's event stream.
pub struct EventSubscription {
    rx: broadcast::Receiver<StreamEvent>,
    last_seq: u64,
    finished: bool,
}

impl EventSubscription {
    /// Next event, or `None` once a terminal event was delivered or the
    /// publisher is gone.
    ///
    /// When this subscriber fell behind and events were overwritten, an INFO
    /// log is synthesized in their place carrying the seq of the last skipped
    /// event, so seq stays strictly increasing.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if let StreamEvent::Log(ref log) = event {
                        if log.seq <= self.last_seq {
                            continue;
                        }
                        self.last_seq = log.seq;
                    }
                    if event.is_terminal() {
                        self.finished = true;
                    }
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event subscriber lagged");
                    self.last_seq += missed;
                    return Some(StreamEvent::Log(LogEvent {
                        seq: self.last_seq,
                        tag: LogTag::Info,
                        message: format!("{} event(s) skipped: stream client fell behind", missed),
                        timestamp: Utc::now(),
                        stage: None,
                    }));
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    /// Adapt into a `Stream` that ends after the terminal event.
    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            let event = sub.recv().await?;
            Some((event, sub))
        })
    }
}
