use serde::{Deserialize, Serialize};
use std::fmt;

/// Worker slot index in the shared segment.
pub type ProcessId = usize;

/// Globally unique state identity: owning process in the high half, local
/// sequence number in the low half.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StateId(u64);

impl StateId {
    pub fn new(process: ProcessId, local: u32) -> Self {
        StateId(((process as u64) << 32) | local as u64)
    }

    pub fn process(self) -> ProcessId {
        (self.0 >> 32) as ProcessId
    }

    pub fn local(self) -> u32 {
        self.0 as u32
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.process(), self.local())
    }
}

/// One unit of path exploration, as seen by the interpreter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionState {
    pub id: StateId,
    /// Exploring a branch not yet committed to be the sole continuation
    pub speculative: bool,
    /// The one sibling allowed to continue after a forked comparison
    pub carry_on: bool,
}

impl ExecutionState {
    pub fn new(id: StateId) -> Self {
        Self {
            id,
            speculative: false,
            carry_on: true,
        }
    }
}

/// Why control is leaving the current unit of work.
///
/// Returned through `Err` and propagated with `?` up to the dispatch loop,
/// which then picks a new state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Unwind {
    /// The currently executing state was destroyed.
    StateKilled(StateId),
    /// Leave the current instruction; the state stays alive.
    CpuExit,
}

impl fmt::Display for Unwind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unwind::StateKilled(id) => write!(f, "state {} killed", id),
            Unwind::CpuExit => write!(f, "cpu exit"),
        }
    }
}

/// Outcome of anything that may tear down the executing state.
pub type Flow<T> = std::result::Result<T, Unwind>;

/// Mailbox command kinds.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    Empty = 0,
    Kill = 1,
}

impl Default for CommandKind {
    fn default() -> Self {
        CommandKind::Empty
    }
}

/// Marker for "no process" in shared fields.
pub const NO_PROCESS: u32 = u32::MAX;

/// Instruction written into another worker's mailbox.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Command {
    pub kind: CommandKind,
    /// Process allowed to keep one succeeded state, [`NO_PROCESS`] for none
    pub keep_on: u32,
}

impl Command {
    /// Kill everything on the target, except one succeeded state if the
    /// target is `keep_on` itself.
    pub fn kill(keep_on: Option<ProcessId>) -> Self {
        Self {
            kind: CommandKind::Kill,
            keep_on: keep_on.map(|p| p as u32).unwrap_or(NO_PROCESS),
        }
    }

    pub fn keep_target(&self) -> Option<ProcessId> {
        if self.keep_on == NO_PROCESS {
            None
        } else {
            Some(self.keep_on as ProcessId)
        }
    }
}

/// Per-process lifecycle phase, for logging and reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessPhase {
    Active,
    Suspended,
    Resolving,
    Terminated,
}
