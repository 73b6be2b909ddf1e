//! Simulation and proof infrastructure
//!
//! A deterministic interpreter, a guest program model and a dispatch loop
//! that drive the real coordinator, plus fleet drivers (threads and forked
//! processes) used by the convergence proofs and the CLI.

pub mod campaign;
pub mod convergence_proof;
pub mod interpreter;
pub mod program;
pub mod worker;

pub use campaign::{run_campaign, CampaignOutcome, CampaignSpec};
pub use convergence_proof::*;
