//! State lifecycle coordination core.
//!
//! `shared` is the cross-process segment layout, `manager` the per-process
//! coordinator working on it. `executor`, `topology` and `searcher` are the
//! seams to the interpreter, the orchestration layer and the scheduler;
//! `plugin` fans interpreter events out to listeners.

pub mod executor;
pub mod manager;
pub mod opcodes;
pub mod plugin;
pub mod searcher;
pub mod shared;
pub mod topology;
pub mod types;
