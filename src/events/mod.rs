//! Per-run event streaming.
//!
//! Every run owns one [`EventPublisher`] backed by a bounded broadcast
//! channel. Subscribers receive [`StreamEvent`]s from their subscription point
//! on; the SSE layer in [`sse`] frames them for HTTP clients and decodes them
//! on the client side.

mod publisher;
pub mod sse;

use serde::{Deserialize, Serialize};
use velo_common::{LogEvent, RunReport, RunStatus};

pub use publisher::{EventPublisher, EventSubscription};
pub use sse::{SseDecoder, with_keepalive};

/// One frame on a run's event stream, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Log(LogEvent),
    Done { data: Box<RunReport> },
    Error { message: String },
    Keepalive,
}

impl StreamEvent {
    /// `done` and `error` end a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    /// The event that closes the stream of a finished run: `error` for
    /// ERRORED runs, `done` carrying the report otherwise.
    pub fn terminal(report: &RunReport) -> Self {
        match report.run_status {
            RunStatus::Errored => Self::Error {
                message: report
                    .error
                    .clone()
                    .unwrap_or_else(|| "run errored".to_string()),
            },
            _ => Self::Done {
                data: Box::new(report.clone()),
            },
        }
    }

    pub fn as_log(&self) -> Option<&LogEvent> {
        match self {
            Self::Log(event) => Some(event),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use velo_common::{LogTag, Stage};

    #[test]
    fn test_log_event_serializes_flat() {
        let event = StreamEvent::Log(LogEvent {
            seq: 3,
            tag: LogTag::Bug,
            message: "src/app.py:12 AssertionError".to_string(),
            timestamp: Utc::now(),
            stage: Some(Stage::Sandbox),
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "log");
        assert_eq!(value["seq"], 3);
        assert_eq!(value["tag"], "BUG");
        assert_eq!(value["message"], "src/app.py:12 AssertionError");
        assert_eq!(value["stage"], "SANDBOX");
    }

    #[test]
    fn test_error_and_keepalive_serialization() {
        let json = serde_json::to_string(&StreamEvent::Error {
            message: "cancelled".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"error","message":"cancelled"}"#);

        let json = serde_json::to_string(&StreamEvent::Keepalive).unwrap();
        assert_eq!(json, r#"{"type":"keepalive"}"#);
    }

    #[test]
    fn test_log_event_deserializes() {
        let json = r#"{"type":"log","seq":1,"tag":"AGENT","message":"── Node: GitOps","timestamp":"2026-01-01T00:00:00Z","stage":"GITOPS"}"#;
        let event: StreamEvent = serde_json::from_str(json).unwrap();
        let log = event.as_log().unwrap();
        assert_eq!(log.seq, 1);
        assert_eq!(log.tag, LogTag::Agent);
        assert_eq!(log.stage, Some(Stage::Gitops));
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_terminal_events() {
        assert!(StreamEvent::Error { message: "x".into() }.is_terminal());
        assert!(!StreamEvent::Keepalive.is_terminal());
    }
}
