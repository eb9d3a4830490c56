//! Client for a remote `velo serve` instance, used by `velo heal --server`.

use anyhow::{Context, Result, bail};
use velo_common::RunReport;

use crate::events::{SseDecoder, StreamEvent};
use crate::orchestrator::RunRequest;

/// How a remotely streamed run ended.
#[derive(Debug, Clone)]
pub enum RemoteOutcome {
    Finished(Box<RunReport>),
    Errored { message: String },
}

pub struct RemoteClient {
    base_url: String,
    http: reqwest::Client,
}

impl RemoteClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    /// Submit `request` to the streaming endpoint, handing every log event
    /// to `on_event` until the run finishes.
    pub async fn stream_run(
        &self,
        request: &RunRequest,
        mut on_event: impl FnMut(&StreamEvent),
    ) -> Result<RemoteOutcome> {
        let url = format!("{}/api/analyze/stream", self.base_url);
        let mut resp = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            bail!(
                "Server rejected the run ({}): {}",
                status,
                body["error"].as_str().unwrap_or("no details")
            );
        }

        let mut decoder = SseDecoder::new();
        while let Some(chunk) = resp.chunk().await.context("Event stream interrupted")? {
            for event in decoder.push(&chunk) {
                if let Some(outcome) = settle(event, &mut on_event) {
                    return Ok(outcome);
                }
            }
        }
        if let Some(event) = decoder.finish()
            && let Some(outcome) = settle(event, &mut on_event)
        {
            return Ok(outcome);
        }
        bail!("Event stream ended before the run finished")
    }
}

fn settle(event: StreamEvent, on_event: &mut impl FnMut(&StreamEvent)) -> Option<RemoteOutcome> {
    match event {
        StreamEvent::Done { data } => Some(RemoteOutcome::Finished(data)),
        StreamEvent::Error { message } => Some(RemoteOutcome::Errored { message }),
        other => {
            on_event(&other);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::testing::{passing_healer, request};
    use crate::server::{AppState, build_router};
    use std::sync::Arc;
    use std::time::Duration;
    use velo_common::RunStatus;

    async fn spawn_server() -> String {
        let state = Arc::new(AppState {
            healer: Arc::new(passing_healer()),
            keepalive: Duration::from_secs(15),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, build_router(state, false)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_stream_run_against_server() {
        let base = spawn_server().await;
        let dir = tempfile::tempdir().unwrap();
        let client = RemoteClient::new(&format!("{}/", base));

        let mut logs = 0;
        let outcome = client
            .stream_run(&request(dir.path()), |event| {
                if event.as_log().is_some() {
                    logs += 1;
                }
            })
            .await
            .unwrap();

        match outcome {
            RemoteOutcome::Finished(report) => assert_eq!(report.run_status, RunStatus::Passed),
            other => panic!("expected a finished run, got {:?}", other),
        }
        assert!(logs > 0);
    }

    #[tokio::test]
    async fn test_stream_run_rejected_input() {
        let base = spawn_server().await;
        let client = RemoteClient::new(&base);
        let mut req = request(std::path::Path::new("/"));
        req.team_name = String::new();
        let err = client.stream_run(&req, |_| {}).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("400"), "{}", msg);
        assert!(msg.contains("team_name"), "{}", msg);
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let client = RemoteClient::new("http://127.0.0.1:9");
        let dir = tempfile::tempdir().unwrap();
        assert!(client.stream_run(&request(dir.path()), |_| {}).await.is_err());
    }
}
