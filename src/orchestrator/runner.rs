use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use velo_common::{
    BugType, FailureDetail, FixStatus, Iteration, LogTag, Run, RunReport, RunStatus,
    ScoringConfig, Stage, TestResult, short_sha,
};

use crate::errors::HealError;
use crate::events::EventPublisher;
use crate::gitops::{CommitError, CommitOutcome, GitOpsCommitter};
use crate::sandbox::TestRunner;
use crate::solver::{Patch, PatchProposer};
use crate::workspace::{Knobs, RepoSource, Workspace, WorkspaceProvisioner, WorkspaceRef};

use super::phase::{Outcome, Phase};

/// The four external capabilities a run drives.
#[derive(Clone)]
pub struct Collaborators {
    pub provisioner: Arc<dyn WorkspaceProvisioner>,
    pub runner: Arc<dyn TestRunner>,
    pub proposer: Arc<dyn PatchProposer>,
    pub committer: Arc<dyn GitOpsCommitter>,
}

/// Per-run settings resolved from config and the request.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub max_iterations: u32,
    pub call_timeout: Duration,
    pub scoring: ScoringConfig,
    /// Passed to collaborators untouched.
    pub knobs: Knobs,
}

/// An iteration whose fixes are not yet verified. It is sealed into an
/// [`Iteration`] once the following test run resolves them.
struct OpenIteration {
    index: u32,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    test_result: TestResult,
    patches: Vec<Patch>,
    commit_sha: Option<String>,
}

impl OpenIteration {
    fn seal(self, next: Option<&TestResult>) -> Iteration {
        Iteration {
            index: self.index,
            started_at: self.started_at,
            ended_at: self.ended_at,
            fixes_proposed: self
                .patches
                .iter()
                .map(|p| p.to_fix(resolve_fix(p, next)))
                .collect(),
            test_result: self.test_result,
            commit_sha: self.commit_sha,
        }
    }
}

/// FIXED unless the next run still fails in the patched file (at the patched
/// line when both lines are known). Patches never re-tested are FAILED.
pub(crate) fn resolve_fix(patch: &Patch, next: Option<&TestResult>) -> FixStatus {
    let Some(next) = next else {
        return FixStatus::Failed;
    };
    if next.passed {
        return FixStatus::Fixed;
    }
    let still_failing = next.failure_details.iter().any(|f| {
        f.file == patch.file
            && match (f.line, patch.line_number) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    });
    if still_failing {
        FixStatus::Failed
    } else {
        FixStatus::Fixed
    }
}

/// A failed step, attributed to the node it happened in.
struct Fault {
    error: HealError,
    stage: Option<Stage>,
}

#[derive(Default)]
struct Cycle {
    workspace: Option<Workspace>,
    open: Option<OpenIteration>,
    next_index: u32,
    failures: Vec<FailureDetail>,
    patches: Vec<Patch>,
    stop_reason: Option<String>,
    /// A commit still running after its call timed out or was cancelled.
    commit_task: Option<JoinHandle<Result<CommitOutcome, CommitError>>>,
}

impl Cycle {
    fn workspace(&self) -> Result<&WorkspaceRef, HealError> {
        self.workspace
            .as_ref()
            .map(Workspace::reference)
            .ok_or_else(|| HealError::State("workspace not acquired".into()))
    }

    fn open(&mut self) -> Result<&mut OpenIteration, HealError> {
        self.open
            .as_mut()
            .ok_or_else(|| HealError::State("no open iteration".into()))
    }

    /// Join an abandoned commit so it never writes into a released workspace.
    async fn settle_commit(&mut self, run_id: Uuid) {
        let Some(task) = self.commit_task.take() else {
            return;
        };
        debug!(run_id = %run_id, "waiting for in-flight commit");
        match task.await {
            Ok(Ok(outcome)) => warn!(
                run_id = %run_id,
                sha = %outcome.commit_sha,
                "commit landed after the run gave up on it"
            ),
            Ok(Err(e)) => debug!(run_id = %run_id, error = %e, "abandoned commit failed"),
            Err(e) => warn!(run_id = %run_id, error = %e, "commit task failed"),
        }
    }
}

/// Drives one [`Run`] from INIT to a terminal phase.
pub struct HealingRun {
    run: Run,
    source: RepoSource,
    options: RunOptions,
    collaborators: Collaborators,
    events: Arc<EventPublisher>,
    cancel: CancellationToken,
}

impl HealingRun {
    pub fn new(
        run: Run,
        source: RepoSource,
        options: RunOptions,
        collaborators: Collaborators,
        events: Arc<EventPublisher>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            run,
            source,
            options,
            collaborators,
            events,
            cancel,
        }
    }

    /// Run the loop to completion. Every fault ends the run as ERRORED, so
    /// this always yields a report.
    pub async fn execute(mut self) -> RunReport {
        let run_id = self.run.id;
        if let Err(e) = self.run.mark_running() {
            warn!(run_id = %run_id, error = %e, "run was not pending");
        }

        let mut phase = Phase::Init;
        let mut cycle = Cycle {
            next_index: 1,
            ..Default::default()
        };
        let mut fault: Option<Fault> = None;

        while !phase.is_terminal() {
            let step = if self.cancel.is_cancelled() {
                Err(HealError::Cancelled)
            } else {
                self.step(phase, &mut cycle).await
            };
            let outcome = match step {
                Ok(outcome) => outcome,
                Err(e) => {
                    let stage = e.stage().or_else(|| phase.stage());
                    error!(
                        run_id = %run_id,
                        phase = %phase,
                        stage = ?stage,
                        error = %e,
                        "healing step failed"
                    );
                    fault = Some(Fault { error: e, stage });
                    Outcome::Fault
                }
            };
            phase = match phase.next(outcome) {
                Ok(next) => next,
                Err(e) => {
                    fault = Some(Fault {
                        error: e.into(),
                        stage: None,
                    });
                    Phase::Errored
                }
            };
        }

        cycle.settle_commit(run_id).await;
        self.finalize(phase, cycle, fault)
    }

    async fn step(&mut self, phase: Phase, cycle: &mut Cycle) -> Result<Outcome, HealError> {
        match phase {
            Phase::Init => self.init(cycle).await,
            Phase::Testing => self.test(cycle).await,
            Phase::Diagnosing => Ok(self.diagnose(cycle)),
            Phase::Patching => self.propose(cycle).await,
            Phase::Committing => self.commit(cycle).await,
            Phase::Passed | Phase::Failed | Phase::Errored => {
                Err(HealError::State(format!("{} is terminal", phase)))
            }
        }
    }

    /// Await a collaborator call under the per-call timeout, abandoning it
    /// when the run is cancelled.
    async fn call<T>(
        &self,
        stage: Stage,
        fut: impl Future<Output = Result<T, HealError>>,
    ) -> Result<T, HealError> {
        let after = self.options.call_timeout;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(HealError::Cancelled),
            res = tokio::time::timeout(after, fut) => {
                res.unwrap_or(Err(HealError::Timeout { stage, after }))
            }
        }
    }

    async fn init(&mut self, cycle: &mut Cycle) -> Result<Outcome, HealError> {
        self.events.log(
            LogTag::Info,
            format!("Starting healing run for {}", self.run.repo_url),
        );
        self.events.log(
            LogTag::Info,
            format!(
                "Branch {} · retry budget {}",
                self.run.branch_name, self.run.max_iterations
            ),
        );
        self.events.node(Stage::Sandbox);

        let provisioner = Arc::clone(&self.collaborators.provisioner);
        let workspace = self
            .call(Stage::Sandbox, async {
                provisioner
                    .acquire(&self.source, self.run.id, &self.options.knobs)
                    .await
                    .map_err(HealError::Workspace)
            })
            .await?;
        self.events.log_stage(
            LogTag::Info,
            Stage::Sandbox,
            format!("Workspace ready: {}", self.source.name()),
        );
        cycle.workspace = Some(workspace);
        Ok(Outcome::Ready)
    }

    async fn test(&mut self, cycle: &mut Cycle) -> Result<Outcome, HealError> {
        let index = cycle.next_index;
        if index > 1 {
            self.events.node(Stage::Sandbox);
        }
        self.events.log_stage(
            LogTag::Info,
            Stage::Sandbox,
            format!("Iteration {}: running test suite", index),
        );

        let started_at = Utc::now();
        let runner = Arc::clone(&self.collaborators.runner);
        let workspace = cycle.workspace()?;
        let result = self
            .call(Stage::Sandbox, async {
                runner.run_tests(workspace).await.map_err(HealError::Sandbox)
            })
            .await?;

        if let Some(previous) = cycle.open.take() {
            self.run.push_iteration(previous.seal(Some(&result)))?;
        }
        info!(
            run_id = %self.run.id,
            iteration = index,
            passed = result.passed,
            failures = result.failures_count,
            "tests finished"
        );

        let outcome = if result.passed {
            if result.is_vacuous() {
                self.events.log_stage(
                    LogTag::Info,
                    Stage::Sandbox,
                    "No tests were discovered; treating the suite as passing",
                );
            }
            let ran = result
                .tests_run
                .map(|n| format!(" ({} tests)", n))
                .unwrap_or_default();
            self.events
                .log_stage(LogTag::Pass, Stage::Sandbox, format!("All tests passed{}", ran));
            Outcome::TestsPassed
        } else {
            self.events.log_stage(
                LogTag::Error,
                Stage::Sandbox,
                format!("{} failure(s) detected", result.failures_count),
            );
            Outcome::TestsFailed
        };

        cycle.failures = result.failure_details.clone();
        cycle.open = Some(OpenIteration {
            index,
            started_at,
            ended_at: Utc::now(),
            test_result: result,
            patches: Vec::new(),
            commit_sha: None,
        });
        cycle.next_index += 1;
        Ok(outcome)
    }

    fn diagnose(&self, cycle: &Cycle) -> Outcome {
        self.events.node(Stage::Solver);
        for failure in &cycle.failures {
            let location = match failure.line {
                Some(line) => format!("{} line {}", failure.file, line),
                None => failure.file.clone(),
            };
            let headline = failure.message.lines().next().unwrap_or_default();
            self.events.log_stage(
                LogTag::Bug,
                Stage::Solver,
                format!(
                    "[{}] {}: {}",
                    BugType::classify(&failure.message),
                    location,
                    headline
                ),
            );
        }
        Outcome::Diagnosed
    }

    async fn propose(&mut self, cycle: &mut Cycle) -> Result<Outcome, HealError> {
        self.events.log_stage(
            LogTag::Agent,
            Stage::Solver,
            format!("Requesting fixes for {} failure(s)", cycle.failures.len()),
        );
        let proposer = Arc::clone(&self.collaborators.proposer);
        let workspace = cycle.workspace()?;
        let failures = &cycle.failures;
        let patches = self
            .call(Stage::Solver, async {
                proposer
                    .propose_fixes(failures, workspace)
                    .await
                    .map_err(HealError::Solver)
            })
            .await?;

        if patches.is_empty() {
            let reason = "No fixes proposed; stopping".to_string();
            self.events
                .log_stage(LogTag::Error, Stage::Solver, reason.clone());
            cycle.stop_reason = Some(reason);
        } else {
            self.events.log_stage(
                LogTag::Agent,
                Stage::Solver,
                format!("{} patch(es) proposed", patches.len()),
            );
            for patch in &patches {
                self.events
                    .log_stage(LogTag::Patch, Stage::Solver, patch.commit_message());
            }
        }

        let count = patches.len();
        cycle.open()?.patches = patches.clone();
        cycle.patches = patches;
        Ok(Outcome::Proposed { patches: count })
    }

    async fn commit(&mut self, cycle: &mut Cycle) -> Result<Outcome, HealError> {
        self.events.node(Stage::Gitops);
        self.events.log_stage(
            LogTag::Info,
            Stage::Gitops,
            format!(
                "Committing {} fix(es) to {}",
                cycle.patches.len(),
                self.run.branch_name
            ),
        );

        let committer = Arc::clone(&self.collaborators.committer);
        let workspace = cycle.workspace()?.clone();
        let branch = self.run.branch_name.clone();
        let patches = cycle.patches.clone();
        let task = cycle.commit_task.insert(tokio::spawn({
            let branch = branch.clone();
            async move { committer.apply_and_push(&patches, &workspace, &branch).await }
        }));
        let result = self
            .call(Stage::Gitops, async {
                match task.await {
                    Ok(res) => res.map_err(|e| match e {
                        CommitError::Commit(source) => HealError::Commit(source),
                        CommitError::Push(source) => HealError::Push {
                            branch: branch.clone(),
                            source,
                        },
                    }),
                    Err(e) => Err(HealError::Commit(anyhow::anyhow!("commit task failed: {}", e))),
                }
            })
            .await;
        // Only a timed-out or cancelled call leaves the task unjoined.
        if !matches!(result, Err(HealError::Timeout { .. } | HealError::Cancelled)) {
            cycle.commit_task = None;
        }
        let outcome = result?;

        let open = cycle.open()?;
        open.commit_sha = Some(outcome.commit_sha.clone());
        open.ended_at = Utc::now();
        self.run.record_fix_cycle()?;

        let pushed = if outcome.pushed {
            format!("pushed to {}", self.run.branch_name)
        } else {
            "push disabled".to_string()
        };
        self.events.log_stage(
            LogTag::Info,
            Stage::Gitops,
            format!("Committed {} ({})", short_sha(&outcome.commit_sha), pushed),
        );
        info!(
            run_id = %self.run.id,
            iteration = self.run.iteration_count,
            sha = %outcome.commit_sha,
            "fix cycle committed"
        );

        // The last cycle's commit stays untested: iteration N+1 never runs.
        let budget_spent = self.run.budget_spent();
        if budget_spent {
            let reason = format!(
                "Retry budget of {} fix cycle(s) exhausted",
                self.run.max_iterations
            );
            self.events.log(LogTag::Info, reason.clone());
            cycle.stop_reason = Some(reason);
        }
        Ok(Outcome::Committed { budget_spent })
    }

    fn finalize(mut self, phase: Phase, mut cycle: Cycle, fault: Option<Fault>) -> RunReport {
        let run_id = self.run.id;
        if let Some(open) = cycle.open.take()
            && let Err(e) = self.run.push_iteration(open.seal(None))
        {
            error!(run_id = %run_id, error = %e, "could not record final iteration");
        }

        let status = phase.run_status().unwrap_or(RunStatus::Errored);
        let (error_message, fault_stage) = match (status, fault) {
            (RunStatus::Errored, Some(fault)) => (Some(fault.error.to_string()), fault.stage),
            (RunStatus::Errored, None) => (Some("run ended without a result".to_string()), None),
            _ => (None, None),
        };

        match status {
            RunStatus::Passed => self.events.log(
                LogTag::Pass,
                format!(
                    "CI PASSED after {} fix cycle(s)",
                    self.run.iteration_count
                ),
            ),
            RunStatus::Failed => self.events.log(
                LogTag::Error,
                format!(
                    "CI FAILED: {}",
                    cycle.stop_reason.as_deref().unwrap_or("tests still failing")
                ),
            ),
            _ => {
                let message = format!(
                    "Run ERRORED: {}",
                    error_message.as_deref().unwrap_or_default()
                );
                match fault_stage {
                    Some(stage) => self.events.log_stage(LogTag::Error, stage, message),
                    None => self.events.log(LogTag::Error, message),
                }
            }
        };

        let finished_at = Utc::now();
        let report = match self.run.finish(
            status,
            error_message.clone(),
            finished_at,
            &self.options.scoring,
        ) {
            Ok(report) => report,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "run already finished");
                RunReport::from_run(&self.run, finished_at, &self.options.scoring)
            }
        };

        self.events.log(
            LogTag::Info,
            format!(
                "Score {:.2} ({}) in {}",
                report.score_breakdown.final_score,
                report.score_breakdown.grade,
                report.execution_time
            ),
        );
        info!(
            run_id = %run_id,
            status = %status,
            iterations = report.iteration_count,
            score = report.score_breakdown.final_score,
            "run finished"
        );

        // Releases the working copy before the report is handed out.
        drop(cycle.workspace.take());
        report
    }
}
