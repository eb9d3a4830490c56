pub mod client;
pub mod config;
pub mod errors;
pub mod events;
pub mod gitops;
pub mod orchestrator;
pub mod sandbox;
pub mod server;
pub mod solver;
pub mod workspace;
