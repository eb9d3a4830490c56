use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::scoring::{ScoreBreakdown, ScoreInputs, ScoringConfig};

// ── Enumerations ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Errored,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
            Self::Errored => "ERRORED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Passed | Self::Failed | Self::Errored)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the CI pipeline as shown to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CiStatus {
    Passed,
    Failed,
}

impl CiStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BugType {
    Syntax,
    Linting,
    TypeError,
    Import,
    Logic,
    Indentation,
    #[serde(other)]
    Unknown,
}

impl BugType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Syntax => "SYNTAX",
            Self::Linting => "LINTING",
            Self::TypeError => "TYPE_ERROR",
            Self::Import => "IMPORT",
            Self::Logic => "LOGIC",
            Self::Indentation => "INDENTATION",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Lenient parse used on LLM output: case-insensitive, accepts `-`/space
    /// separators, and maps anything unrecognized to `Unknown`.
    pub fn parse_lenient(s: &str) -> Self {
        let normalized = s.trim().to_uppercase().replace(['-', ' '], "_");
        normalized.parse().unwrap_or(Self::Unknown)
    }

    /// Best-effort classification from a failure message.
    ///
    /// Order matters: indentation errors are also syntax errors in Python and
    /// import errors frequently mention "type".
    pub fn classify(message: &str) -> Self {
        let m = message.to_lowercase();
        if m.contains("indentationerror") || m.contains("unexpected indent") || m.contains("indentation") {
            Self::Indentation
        } else if m.contains("syntaxerror") || m.contains("syntax error") || m.contains("unexpected token") || m.contains("expected one of") {
            Self::Syntax
        } else if m.contains("importerror")
            || m.contains("modulenotfounderror")
            || m.contains("cannot find module")
            || m.contains("unresolved import")
            || m.contains("no module named")
        {
            Self::Import
        } else if m.contains("typeerror") || m.contains("mismatched types") || m.contains("type error") || m.contains("expected type") {
            Self::TypeError
        } else if m.contains("lint")
            || m.contains("flake8")
            || m.contains("unused import")
            || m.contains("unused variable")
            || m.contains("clippy")
            || m.contains("eslint")
        {
            Self::Linting
        } else if m.contains("assert") || m.contains("expected") || m.contains("panicked") {
            Self::Logic
        } else {
            Self::Unknown
        }
    }
}

impl std::fmt::Display for BugType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BugType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SYNTAX" => Ok(Self::Syntax),
            "LINTING" => Ok(Self::Linting),
            "TYPE_ERROR" => Ok(Self::TypeError),
            "IMPORT" => Ok(Self::Import),
            "LOGIC" => Ok(Self::Logic),
            "INDENTATION" => Ok(Self::Indentation),
            "UNKNOWN" => Ok(Self::Unknown),
            _ => Err(format!("Invalid bug type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FixStatus {
    Fixed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogTag {
    Info,
    Error,
    Agent,
    Pass,
    Patch,
    Bug,
}

impl LogTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Error => "ERROR",
            Self::Agent => "AGENT",
            Self::Pass => "PASS",
            Self::Patch => "PATCH",
            Self::Bug => "BUG",
        }
    }
}

/// Pipeline stage a node-transition event announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Sandbox,
    Solver,
    Gitops,
}

/// Prefix the dashboard matches to infer the active pipeline node.
pub const NODE_PREFIX: &str = "── Node: ";

impl Stage {
    pub fn node_name(&self) -> &'static str {
        match self {
            Self::Sandbox => "Sandbox Tester",
            Self::Solver => "LLM Solver",
            Self::Gitops => "GitOps",
        }
    }

    /// Legacy message string, e.g. `── Node: Sandbox Tester`.
    pub fn node_message(&self) -> String {
        format!("{}{}", NODE_PREFIX, self.node_name())
    }

    /// Recover the stage from a legacy node message.
    pub fn from_node_message(message: &str) -> Option<Self> {
        let name = message.strip_prefix(NODE_PREFIX)?;
        [Self::Sandbox, Self::Solver, Self::Gitops]
            .into_iter()
            .find(|s| name.trim() == s.node_name())
    }
}

// ── Records ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub file: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl FailureDetail {
    pub fn new(file: impl Into<String>, message: impl Into<String>, line: Option<u32>) -> Self {
        Self {
            file: file.into(),
            message: message.into(),
            line,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub passed: bool,
    pub failures_count: u32,
    pub failure_details: Vec<FailureDetail>,
    /// Number of tests the runner reports having executed, when it can tell.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests_run: Option<u32>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl TestResult {
    pub fn pass(tests_run: Option<u32>) -> Self {
        Self {
            passed: true,
            failures_count: 0,
            failure_details: Vec::new(),
            tests_run,
            duration_ms: 0,
        }
    }

    pub fn fail(failure_details: Vec<FailureDetail>) -> Self {
        Self {
            passed: false,
            failures_count: failure_details.len() as u32,
            failure_details,
            tests_run: None,
            duration_ms: 0,
        }
    }

    pub fn with_tests_run(mut self, tests_run: u32) -> Self {
        self.tests_run = Some(tests_run);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Zero failures and zero tests executed.
    pub fn is_vacuous(&self) -> bool {
        self.failures_count == 0 && self.failure_details.is_empty() && self.tests_run == Some(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    pub file: String,
    pub bug_type: BugType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_number: Option<u32>,
    pub commit_message: String,
    pub status: FixStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Iteration {
    pub index: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub test_result: TestResult,
    pub fixes_proposed: Vec<Fix>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Per-run sequence number, starting at 1.
    pub seq: u64,
    pub tag: LogTag,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
}

// ── Run ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunStateError {
    #[error("run {0} is already terminal")]
    Terminal(Uuid),

    #[error("iteration {got} out of order, expected {expected}")]
    OutOfOrder { expected: u32, got: u32 },

    #[error("iteration budget of {max} already spent")]
    BudgetSpent { max: u32 },

    #[error("{0} is not a terminal status")]
    NotTerminal(RunStatus),
}

/// One healing session. Mutated only by its orchestrator; every mutator
/// refuses once the status is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub repo_url: String,
    pub team_name: String,
    pub leader_name: String,
    pub created_at: DateTime<Utc>,
    pub status: RunStatus,
    pub iteration_count: u32,
    pub max_iterations: u32,
    pub branch_name: String,
    pub iterations: Vec<Iteration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<ScoreBreakdown>,
}

impl Run {
    pub fn new(
        repo_url: impl Into<String>,
        team_name: impl Into<String>,
        leader_name: impl Into<String>,
        branch_name: impl Into<String>,
        max_iterations: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            repo_url: repo_url.into(),
            team_name: team_name.into(),
            leader_name: leader_name.into(),
            created_at: Utc::now(),
            status: RunStatus::Pending,
            iteration_count: 0,
            max_iterations,
            branch_name: branch_name.into(),
            iterations: Vec::new(),
            error: None,
            finished_at: None,
            score: None,
        }
    }

    fn ensure_open(&self) -> Result<(), RunStateError> {
        if self.status.is_terminal() {
            Err(RunStateError::Terminal(self.id))
        } else {
            Ok(())
        }
    }

    pub fn mark_running(&mut self) -> Result<(), RunStateError> {
        self.ensure_open()?;
        self.status = RunStatus::Running;
        Ok(())
    }

    /// Append a sealed iteration; indices must be contiguous from 1 and
    /// never exceed `max_iterations`.
    pub fn push_iteration(&mut self, iteration: Iteration) -> Result<(), RunStateError> {
        self.ensure_open()?;
        if iteration.index > self.max_iterations {
            return Err(RunStateError::BudgetSpent {
                max: self.max_iterations,
            });
        }
        let expected = self.iterations.len() as u32 + 1;
        if iteration.index != expected {
            return Err(RunStateError::OutOfOrder {
                expected,
                got: iteration.index,
            });
        }
        self.iterations.push(iteration);
        Ok(())
    }

    /// Count one completed fix cycle against the retry budget.
    pub fn record_fix_cycle(&mut self) -> Result<(), RunStateError> {
        self.ensure_open()?;
        if self.iteration_count >= self.max_iterations {
            return Err(RunStateError::BudgetSpent {
                max: self.max_iterations,
            });
        }
        self.iteration_count += 1;
        Ok(())
    }

    pub fn budget_spent(&self) -> bool {
        self.iteration_count >= self.max_iterations
    }

    /// Move to a terminal status, scoring the run. After this the run is frozen.
    pub fn finish(
        &mut self,
        status: RunStatus,
        error: Option<String>,
        finished_at: DateTime<Utc>,
        scoring: &ScoringConfig,
    ) -> Result<RunReport, RunStateError> {
        self.ensure_open()?;
        if !status.is_terminal() {
            return Err(RunStateError::NotTerminal(status));
        }
        self.status = status;
        self.error = error;
        self.finished_at = Some(finished_at);
        let report = RunReport::from_run(self, finished_at, scoring);
        self.score = Some(report.score_breakdown.clone());
        Ok(report)
    }

    pub fn last_test_passed(&self) -> bool {
        self.iterations
            .last()
            .map(|it| it.test_result.passed)
            .unwrap_or(false)
    }
}

// ── Report ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub iteration: u32,
    pub status: CiStatus,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub failures_in_run: u32,
    pub fixes_in_run: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
}

impl TimelineEntry {
    fn from_iteration(it: &Iteration) -> Self {
        let fixes = it.fixes_proposed.len() as u32;
        let message = if it.test_result.passed {
            "All tests passing".to_string()
        } else {
            let mut msg = format!(
                "{} failure(s) detected, {} fix(es) proposed",
                it.test_result.failures_count, fixes
            );
            if let Some(ref sha) = it.commit_sha {
                msg.push_str(&format!(", committed {}", short_sha(sha)));
            }
            msg
        };
        Self {
            iteration: it.index,
            status: if it.test_result.passed {
                CiStatus::Passed
            } else {
                CiStatus::Failed
            },
            timestamp: it.ended_at,
            message,
            failures_in_run: it.test_result.failures_count,
            fixes_in_run: fixes,
            commit_sha: it.commit_sha.clone(),
        }
    }
}

/// Terminal, client-facing materialization of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub repo_url: String,
    pub team_name: String,
    pub leader_name: String,
    pub branch_name: String,
    pub run_status: RunStatus,
    pub ci_status: CiStatus,
    pub iteration_count: u32,
    pub max_iterations: u32,
    pub total_failures: u32,
    pub total_fixes: u32,
    pub fixes: Vec<Fix>,
    pub timeline: Vec<TimelineEntry>,
    pub iterations: Vec<Iteration>,
    pub score_breakdown: ScoreBreakdown,
    pub execution_time: String,
    pub execution_time_secs: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunReport {
    /// Flatten a run into its report. Pure: same run, same report.
    pub fn from_run(run: &Run, finished_at: DateTime<Utc>, scoring: &ScoringConfig) -> Self {
        let ci_status = if run.last_test_passed() {
            CiStatus::Passed
        } else {
            CiStatus::Failed
        };
        let fixes: Vec<Fix> = run
            .iterations
            .iter()
            .flat_map(|it| it.fixes_proposed.iter().cloned())
            .collect();
        let total_failures = run
            .iterations
            .iter()
            .map(|it| it.test_result.failures_count)
            .sum();
        let total_fixes = fixes.len() as u32;
        let elapsed_ms = (finished_at - run.created_at).num_milliseconds().max(0);
        let execution_time_secs = elapsed_ms as f64 / 1000.0;

        let score_breakdown = ScoreBreakdown::compute(
            &ScoreInputs {
                ci_status,
                total_failures,
                total_fixes,
                iteration_count: run.iteration_count,
                execution_time_secs,
            },
            scoring,
        );

        Self {
            run_id: run.id,
            repo_url: run.repo_url.clone(),
            team_name: run.team_name.clone(),
            leader_name: run.leader_name.clone(),
            branch_name: run.branch_name.clone(),
            run_status: run.status,
            ci_status,
            iteration_count: run.iteration_count,
            max_iterations: run.max_iterations,
            total_failures,
            total_fixes,
            fixes,
            timeline: run.iterations.iter().map(TimelineEntry::from_iteration).collect(),
            iterations: run.iterations.clone(),
            score_breakdown,
            execution_time: format_duration(execution_time_secs),
            execution_time_secs,
            started_at: run.created_at,
            finished_at,
            error: run.error.clone(),
        }
    }

    /// Inputs the score was computed from, recovered from stored fields.
    pub fn score_inputs(&self) -> ScoreInputs {
        ScoreInputs {
            ci_status: self.ci_status,
            total_failures: self.total_failures,
            total_fixes: self.total_fixes,
            iteration_count: self.iteration_count,
            execution_time_secs: self.execution_time_secs,
        }
    }
}

/// Compact listing entry for `GET /api/runs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub repo_url: String,
    pub branch_name: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_score: Option<f64>,
}

pub fn short_sha(sha: &str) -> &str {
    sha.get(..7).unwrap_or(sha)
}

/// Human-readable elapsed time: `42.3s`, `2m 05s`, `1h 03m 09s`.
pub fn format_duration(secs: f64) -> String {
    if secs < 60.0 {
        return format!("{:.1}s", secs);
    }
    let total = secs.round() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{}h {:02}m {:02}s", h, m, s)
    } else {
        format!("{}m {:02}s", m, s)
    }
}
