//! statemgr: state lifecycle coordination for parallel symbolic execution
//! Keeps a fleet of forked interpreter workers from multiplying "successful"
//! states: every worker parks the states that reached a success point, and
//! the fleet collectively reduces them to exactly one survivor.
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::shm`]: Anonymous shared mapping guarded by a process-shared semaphore
//! - [`kernel::clock`]: Monotonic clock comparable across forked workers
//! - [`kernel::signal`]: Cooperative SIGINT/SIGTERM shutdown
//!
//! ## Coordination Core ([`core`])
//! - [`core::shared`]: Fixed layout of the cross-process segment (counters, flags, mailboxes)
//! - [`core::manager`]: Per-process coordinator (succeed, resume, converge, suspend, timeout)
//! - [`core::searcher`]: State selection with the coordinator's scheduler hook
//! - [`core::plugin`]: Interpreter event fan-out
//! - [`core::executor`], [`core::topology`]: Seams to the interpreter and the worker fleet
//! - [`core::opcodes`]: Guest-visible custom instruction encoding
//!
//! ## Observability ([`observability`])
//! - [`observability::events`]: Structured coordination events
//! - [`observability::metrics`]: Per-process lifecycle counters
//!
//! ## Configuration ([`config`])
//! - [`config::config`]: JSON configuration loading
//! - [`config::validator`]: Startup validation
//! - [`config::types`]: Error type and closed enums
//!
//! ## Testing Infrastructure ([`testing`])
//! - [`testing::interpreter`], [`testing::program`]: Deterministic interpreter and guest model
//! - [`testing::worker`]: Dispatch loop wiring interpreter, coordinator and searcher
//! - [`testing::campaign`]: Forked multi-process campaigns
//! - [`testing::convergence_proof`]: Randomised single-survivor proofs
//!
//! # Design Principles
//!
//! 1. **Shared state only under the lock** - nothing in the segment is read outside a guard
//! 2. **Accounting is checked, not trusted** - counter/set divergence aborts the worker
//! 3. **Killing the running state is the last action** - it unwinds through `Err`

// Kernel Primitives
pub mod kernel;

// Coordination Core
pub mod core;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Testing Infrastructure
pub mod testing;

// CLI entrypoint wiring for the statemgr binary.
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;
pub use core::manager::{Schedule, StateManager};
pub use core::types::{Flow, ProcessId, StateId, Unwind};
