use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span};
use uuid::Uuid;
use velo_common::{Run, RunReport, RunStatus, RunSummary, ScoringConfig, branch_name};

use crate::config::{MAX_ITERATIONS_CEILING, VeloConfig};
use crate::errors::InputError;
use crate::events::{EventPublisher, EventSubscription};
use crate::workspace::{Knobs, RepoSource};

use super::runner::{Collaborators, HealingRun, RunOptions};

/// A submission, as accepted by the HTTP API and the CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
    #[serde(default)]
    pub repo_url: String,
    #[serde(default)]
    pub team_name: String,
    #[serde(default)]
    pub leader_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    /// Opaque collaborator settings (`test_cmd`, `solver_args`, ...).
    #[serde(default, skip_serializing_if = "Knobs::is_empty")]
    pub knobs: Knobs,
}

/// A request that passed validation.
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    pub source: RepoSource,
    pub branch_name: String,
    pub max_iterations: u32,
}

impl RunRequest {
    pub fn validate(&self, default_max_iterations: u32) -> Result<ValidatedRequest, InputError> {
        let repo_url = self.repo_url.trim();
        if repo_url.is_empty() {
            return Err(InputError::MissingRepoUrl);
        }
        let source = RepoSource::parse(repo_url)?;
        let branch_name = branch_name(&self.team_name, &self.leader_name)?;
        let max_iterations = self.max_iterations.unwrap_or(default_max_iterations);
        if max_iterations == 0 || max_iterations > MAX_ITERATIONS_CEILING {
            return Err(InputError::MaxIterations {
                got: max_iterations,
                ceiling: MAX_ITERATIONS_CEILING,
            });
        }
        Ok(ValidatedRequest {
            source,
            branch_name,
            max_iterations,
        })
    }
}

/// Settings every run starts from.
#[derive(Debug, Clone)]
pub struct HealerSettings {
    pub max_iterations: u32,
    pub call_timeout: Duration,
    pub scoring: ScoringConfig,
    pub event_buffer: usize,
    /// Finished runs kept for lookup before the oldest are evicted.
    pub retain_finished: usize,
}

impl HealerSettings {
    pub fn from_config(config: &VeloConfig) -> Self {
        Self {
            max_iterations: config.max_iterations(),
            call_timeout: config.call_timeout(),
            scoring: config.toml.scoring.clone(),
            event_buffer: config.toml.run.event_buffer,
            retain_finished: config.toml.run.retain_finished,
        }
    }
}

impl Default for HealerSettings {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            call_timeout: Duration::from_secs(1800),
            scoring: ScoringConfig::default(),
            event_buffer: 256,
            retain_finished: 100,
        }
    }
}

/// Returned by [`Healer::start_run`]. The subscription was taken before the
/// run started, so it sees the first event.
pub struct RunHandle {
    pub run_id: Uuid,
    pub branch_name: String,
    pub events: EventSubscription,
}

/// Where a run stands, as seen from the registry.
#[derive(Debug, Clone)]
pub enum RunLookup {
    Running { run_id: Uuid, status: RunStatus },
    Finished(Arc<RunReport>),
}

struct RunEntry {
    repo_url: String,
    branch_name: String,
    created_at: DateTime<Utc>,
    events: Arc<EventPublisher>,
    cancel: CancellationToken,
    report: ReportReceiver,
}

type ReportReceiver = watch::Receiver<Option<Arc<RunReport>>>;

impl RunEntry {
    fn finished(&self) -> Option<Arc<RunReport>> {
        self.report.borrow().clone()
    }
}

/// Owns the collaborators and the registry of runs for the process lifetime.
pub struct Healer {
    collaborators: Collaborators,
    settings: HealerSettings,
    runs: Mutex<HashMap<Uuid, RunEntry>>,
    shutdown: CancellationToken,
}

impl Healer {
    pub fn new(collaborators: Collaborators, settings: HealerSettings) -> Self {
        Self {
            collaborators,
            settings,
            runs: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn settings(&self) -> &HealerSettings {
        &self.settings
    }

    fn lock_runs(&self) -> MutexGuard<'_, HashMap<Uuid, RunEntry>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Validate `request`, register a run and spawn it.
    pub fn start_run(&self, request: RunRequest) -> Result<RunHandle, InputError> {
        self.spawn_run(request).map(|(handle, _)| handle)
    }

    fn spawn_run(&self, request: RunRequest) -> Result<(RunHandle, ReportReceiver), InputError> {
        let valid = request.validate(self.settings.max_iterations)?;
        let repo_url = request.repo_url.trim().to_string();
        let run = Run::new(
            repo_url.clone(),
            request.team_name.trim(),
            request.leader_name.trim(),
            valid.branch_name.clone(),
            valid.max_iterations,
        );
        let run_id = run.id;
        let created_at = run.created_at;
        let events = Arc::new(EventPublisher::new(run_id, self.settings.event_buffer));
        let subscription = events.subscribe();
        let cancel = self.shutdown.child_token();
        let (report_tx, report_rx) = watch::channel(None);

        let options = RunOptions {
            max_iterations: valid.max_iterations,
            call_timeout: self.settings.call_timeout,
            scoring: self.settings.scoring.clone(),
            knobs: request.knobs,
        };
        let fallback = run.clone();
        let scoring = self.settings.scoring.clone();
        let healing = HealingRun::new(
            run,
            valid.source,
            options,
            self.collaborators.clone(),
            Arc::clone(&events),
            cancel.clone(),
        );

        {
            let mut runs = self.lock_runs();
            evict_finished(&mut runs, self.settings.retain_finished);
            runs.insert(
                run_id,
                RunEntry {
                    repo_url: repo_url.clone(),
                    branch_name: valid.branch_name.clone(),
                    created_at,
                    events: Arc::clone(&events),
                    cancel,
                    report: report_rx.clone(),
                },
            );
        }
        info!(run_id = %run_id, repo = %repo_url, branch = %valid.branch_name, "run started");

        let span = info_span!("heal", run_id = %run_id);
        tokio::spawn(
            async move {
                let report = match tokio::spawn(healing.execute().in_current_span()).await {
                    Ok(report) => report,
                    Err(e) => {
                        error!(error = %e, "run task aborted");
                        let mut run = fallback;
                        match run.finish(
                            RunStatus::Errored,
                            Some(format!("run task aborted: {}", e)),
                            Utc::now(),
                            &scoring,
                        ) {
                            Ok(report) => report,
                            Err(_) => RunReport::from_run(&run, Utc::now(), &scoring),
                        }
                    }
                };
                // The report is in the registry before the terminal event goes out.
                let report = Arc::new(report);
                report_tx.send_replace(Some(Arc::clone(&report)));
                events.finish(&report);
            }
            .instrument(span),
        );

        let handle = RunHandle {
            run_id,
            branch_name: valid.branch_name,
            events: subscription,
        };
        Ok((handle, report_rx))
    }

    /// Batch contract: start a run and wait for its report. Holds its own
    /// receiver, so the report survives registry eviction.
    pub async fn run_and_wait(&self, request: RunRequest) -> Result<Arc<RunReport>, InputError> {
        let (handle, mut report) = self.spawn_run(request)?;
        drop(handle.events);
        let finished = match report.wait_for(Option::is_some).await {
            Ok(report) => report.clone(),
            Err(_) => None,
        };
        Ok(finished.unwrap_or_else(|| Arc::new(lost_report(handle.run_id))))
    }

    pub fn get(&self, run_id: Uuid) -> Option<RunLookup> {
        let runs = self.lock_runs();
        let entry = runs.get(&run_id)?;
        Some(match entry.finished() {
            Some(report) => RunLookup::Finished(report),
            None => RunLookup::Running {
                run_id,
                status: RunStatus::Running,
            },
        })
    }

    /// Wait for a run's report. `None` for unknown runs.
    pub async fn wait(&self, run_id: Uuid) -> Option<Arc<RunReport>> {
        let mut rx = self.lock_runs().get(&run_id)?.report.clone();
        let report = rx.wait_for(Option::is_some).await.ok()?;
        report.clone()
    }

    /// Subscribe to a live run. `None` when unknown or already finished.
    pub fn subscribe(&self, run_id: Uuid) -> Option<EventSubscription> {
        let runs = self.lock_runs();
        let entry = runs.get(&run_id)?;
        if entry.finished().is_some() {
            return None;
        }
        Some(entry.events.subscribe())
    }

    /// Request cancellation. Returns false for unknown or finished runs.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        let runs = self.lock_runs();
        match runs.get(&run_id) {
            Some(entry) if entry.finished().is_none() => {
                info!(run_id = %run_id, "cancellation requested");
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Every known run, oldest first.
    pub fn list(&self) -> Vec<RunSummary> {
        let runs = self.lock_runs();
        let mut summaries: Vec<RunSummary> = runs
            .iter()
            .map(|(id, entry)| {
                let report = entry.finished();
                RunSummary {
                    run_id: *id,
                    repo_url: entry.repo_url.clone(),
                    branch_name: entry.branch_name.clone(),
                    status: report
                        .as_ref()
                        .map(|r| r.run_status)
                        .unwrap_or(RunStatus::Running),
                    created_at: entry.created_at,
                    final_score: report.map(|r| r.score_breakdown.final_score),
                }
            })
            .collect();
        summaries.sort_by_key(|s| s.created_at);
        summaries
    }

    /// Cancel every live run and wait for all of them to settle.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let ids: Vec<Uuid> = self.lock_runs().keys().copied().collect();
        for id in ids {
            self.wait(id).await;
        }
    }
}

/// Drop the oldest finished runs until at most `keep` remain. Live runs
/// are never evicted.
fn evict_finished(runs: &mut HashMap<Uuid, RunEntry>, keep: usize) {
    let mut finished: Vec<(DateTime<Utc>, Uuid)> = runs
        .iter()
        .filter(|(_, entry)| entry.finished().is_some())
        .map(|(id, entry)| (entry.created_at, *id))
        .collect();
    if finished.len() <= keep {
        return;
    }
    finished.sort();
    let excess = finished.len() - keep;
    for (_, id) in finished.into_iter().take(excess) {
        runs.remove(&id);
    }
    debug!(evicted = excess, kept = keep, "evicted finished runs");
}

fn lost_report(run_id: Uuid) -> RunReport {
    let mut run = Run::new("", "", "", "", 1);
    run.id = run_id;
    let scoring = ScoringConfig::default();
    match run.finish(
        RunStatus::Errored,
        Some("run ended without a report".to_string()),
        Utc::now(),
        &scoring,
    ) {
        Ok(report) => report,
        Err(_) => RunReport::from_run(&run, Utc::now(), &scoring),
    }
}
