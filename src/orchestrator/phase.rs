//! The healing loop as an explicit finite-state machine.
//!
//! [`Phase::next`] is a pure function from the current phase and the outcome
//! of the step just taken to the following phase. The runner performs the
//! side effects; this module only decides where to go.

use thiserror::Error;
use velo_common::{RunStatus, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Testing,
    Diagnosing,
    Patching,
    Committing,
    Passed,
    Failed,
    Errored,
}

/// What the step executed in the current phase produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Workspace acquired.
    Ready,
    TestsPassed,
    TestsFailed,
    Diagnosed,
    Proposed { patches: usize },
    /// `budget_spent` is true when that commit used the last fix cycle.
    Committed { budget_spent: bool },
    /// Collaborator error, timeout or cancellation.
    Fault,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no transition from {from:?} on {outcome:?}")]
pub struct TransitionError {
    pub from: Phase,
    pub outcome: Outcome,
}

impl Phase {
    pub fn next(self, outcome: Outcome) -> Result<Phase, TransitionError> {
        use Outcome::*;
        use Phase::*;

        let to = match (self, outcome) {
            (Passed | Failed | Errored, _) => None,
            (_, Fault) => Some(Errored),
            (Init, Ready) => Some(Testing),
            (Testing, TestsPassed) => Some(Passed),
            (Testing, TestsFailed) => Some(Diagnosing),
            (Diagnosing, Diagnosed) => Some(Patching),
            (Patching, Proposed { patches: 0 }) => Some(Failed),
            (Patching, Proposed { .. }) => Some(Committing),
            (Committing, Committed { budget_spent: true }) => Some(Failed),
            (Committing, Committed { budget_spent: false }) => Some(Testing),
            _ => None,
        };
        to.ok_or(TransitionError {
            from: self,
            outcome,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Passed | Phase::Failed | Phase::Errored)
    }

    /// Terminal run status for a terminal phase.
    pub fn run_status(&self) -> Option<RunStatus> {
        match self {
            Phase::Passed => Some(RunStatus::Passed),
            Phase::Failed => Some(RunStatus::Failed),
            Phase::Errored => Some(RunStatus::Errored),
            _ => None,
        }
    }

    /// Collaborator node that does the work of this phase.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Phase::Init | Phase::Testing => Some(Stage::Sandbox),
            Phase::Diagnosing | Phase::Patching => Some(Stage::Solver),
            Phase::Committing => Some(Stage::Gitops),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "INIT",
            Phase::Testing => "TESTING",
            Phase::Diagnosing => "DIAGNOSING",
            Phase::Patching => "PATCHING",
            Phase::Committing => "COMMITTING",
            Phase::Passed => "PASSED",
            Phase::Failed => "FAILED",
            Phase::Errored => "ERRORED",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
