//! Thin wrappers around the OS primitives the coordinator needs.
//!
//! All `unsafe` code is concentrated here with explicit SAFETY comments.

pub mod clock;
pub mod shm;
pub mod signal;
