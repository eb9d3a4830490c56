//! Shared domain types for the Velo healing orchestrator.
//!
//! Everything in this crate is pure data plus pure functions: the run model
//! and its report materialization (`models`), the deterministic scoring model
//! (`scoring`), and branch-name derivation (`branch`). The orchestrator,
//! server and adapters in the `velo` crate build on these types; clients can
//! depend on this crate alone to decode the wire format.

pub mod branch;
pub mod models;
pub mod scoring;

pub use branch::{BranchNameError, branch_name};
pub use models::*;
pub use scoring::{ScoreBreakdown, ScoreInputs, ScoringConfig};
