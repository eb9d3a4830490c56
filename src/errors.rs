//! Typed error hierarchy for the Velo orchestrator.
//!
//! Two top-level enums cover the two failure families:
//! - `InputError`: a submission rejected before any Run exists
//! - `HealError`: a collaborator fault that ends a Run as ERRORED

use std::time::Duration;

use thiserror::Error;
use velo_common::{BranchNameError, RunStateError, Stage};

use crate::orchestrator::TransitionError;

/// Rejected submissions. Surfaces as HTTP 400 or a non-zero CLI exit.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("repo_url is required")]
    MissingRepoUrl,

    #[error("Invalid repo_url '{url}': {reason}")]
    InvalidRepoUrl { url: String, reason: String },

    #[error(transparent)]
    Branch(#[from] BranchNameError),

    #[error("max_iterations must be between 1 and {ceiling}, got {got}")]
    MaxIterations { got: u32, ceiling: u32 },
}

/// Faults raised by a collaborator call. Never retried by the orchestrator.
#[derive(Debug, Error)]
pub enum HealError {
    #[error("Workspace acquisition failed: {0}")]
    Workspace(#[source] anyhow::Error),

    #[error("Sandbox test run failed: {0}")]
    Sandbox(#[source] anyhow::Error),

    #[error("Patch proposer failed: {0}")]
    Solver(#[source] anyhow::Error),

    #[error("Commit failed: {0}")]
    Commit(#[source] anyhow::Error),

    #[error("Push of branch {branch} failed: {source}")]
    Push {
        branch: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{stage:?} call timed out after {}s", .after.as_secs())]
    Timeout { stage: Stage, after: Duration },

    #[error("cancelled")]
    Cancelled,

    /// The loop tried something its state forbids. A bug, not a collaborator fault.
    #[error("Run state violation: {0}")]
    State(String),
}

impl From<RunStateError> for HealError {
    fn from(err: RunStateError) -> Self {
        Self::State(err.to_string())
    }
}

impl From<TransitionError> for HealError {
    fn from(err: TransitionError) -> Self {
        Self::State(err.to_string())
    }
}

impl HealError {
    /// Stage the fault occurred in, when there is one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Workspace(_) | Self::Sandbox(_) => Some(Stage::Sandbox),
            Self::Solver(_) => Some(Stage::Solver),
            Self::Commit(_) | Self::Push { .. } => Some(Stage::Gitops),
            Self::Timeout { stage, .. } => Some(*stage),
            Self::Cancelled | Self::State(_) => None,
        }
    }
}
