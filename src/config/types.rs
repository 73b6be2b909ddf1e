/// Shared error and configuration types for statemgr
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Custom error types for statemgr
///
/// Control flow (a state being torn down underneath the dispatch loop) is
/// carried by [`crate::core::types::Unwind`], never by this type.
#[derive(Error, Debug)]
pub enum StateManagerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Shared memory error: {0}")]
    SharedMemory(String),

    #[error("Semaphore error: {0}")]
    Semaphore(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Topology error: {0}")]
    Topology(String),
}

impl From<nix::errno::Errno> for StateManagerError {
    fn from(err: nix::errno::Errno) -> Self {
        StateManagerError::Process(err.to_string())
    }
}

/// Result type alias for statemgr operations
pub type Result<T> = std::result::Result<T, StateManagerError>;

/// Encoding of the guest-visible custom instruction.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
pub enum OpcodeFlavor {
    /// `0x0F 0x3F 0x00 OP SUB 0x00 0x00 0x00 0x00 0x00`
    #[serde(rename = "x86")]
    X86,
    /// `0xFF OP SUB 0x00`
    #[serde(rename = "arm")]
    Arm,
}

impl Default for OpcodeFlavor {
    fn default() -> Self {
        OpcodeFlavor::X86
    }
}

/// Which base policy picks the next state among the active ones.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
pub enum SearcherKind {
    #[serde(rename = "dfs")]
    Dfs,
    #[serde(rename = "random")]
    Random,
}

impl Default for SearcherKind {
    fn default() -> Self {
        SearcherKind::Dfs
    }
}

impl std::fmt::Display for SearcherKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SearcherKind::Dfs => write!(f, "dfs"),
            SearcherKind::Random => write!(f, "random"),
        }
    }
}
