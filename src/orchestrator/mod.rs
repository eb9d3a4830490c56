//! Healing orchestrator.
//!
//! - `phase`: the retry loop as a pure state machine
//! - `runner`: one run driven through the collaborators
//! - `healer`: the run registry shared by the server and the CLI

pub mod healer;
pub mod phase;
pub mod runner;

pub use healer::{Healer, HealerSettings, RunHandle, RunLookup, RunRequest, ValidatedRequest};
pub use phase::{Outcome, Phase, TransitionError};
pub use runner::{Collaborators, HealingRun, RunOptions};
