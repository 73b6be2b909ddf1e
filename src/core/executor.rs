//! Interpreter primitives consumed by the coordinator.

use crate::core::types::{Flow, StateId};

/// Guest register holding the status code of the success opcode and the
/// answer of the successful-state-count query.
pub const STATUS_REGISTER: usize = 0;

/// Scheduling changes accumulated by the interpreter since the last drain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StateUpdates {
    /// Became schedulable (new, forked or resumed)
    pub added: Vec<StateId>,
    /// Left scheduling (suspended or destroyed)
    pub removed: Vec<StateId>,
    /// Destroyed
    pub terminated: Vec<StateId>,
}

impl StateUpdates {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.terminated.is_empty()
    }
}

/// The symbolic interpreter as seen from the coordinator.
///
/// "Active" states are the ones eligible for scheduling; suspended states are
/// alive but excluded until resumed.
pub trait Executor {
    /// Exclude a live state from scheduling. False if it was not active.
    fn suspend_state(&mut self, state: StateId) -> bool;

    /// Make a suspended state schedulable again. False if it was not suspended.
    fn resume_state(&mut self, state: StateId) -> bool;

    /// Destroy a state. Destroying the currently executing state returns
    /// `Err(Unwind::StateKilled)`, which the caller must propagate.
    fn terminate_state_early(&mut self, state: StateId, reason: &str) -> Flow<()>;

    /// Number of active states
    fn states_count(&self) -> usize;

    /// Active states, in ascending id order
    fn states(&self) -> Vec<StateId>;

    fn is_active(&self, state: StateId) -> bool {
        self.states().contains(&state)
    }

    /// State whose instructions are being dispatched right now
    fn current_state(&self) -> Option<StateId>;

    fn read_pc(&self, state: StateId) -> u64;

    fn write_pc(&mut self, state: StateId, pc: u64);

    fn read_register(&self, state: StateId, reg: usize) -> u64;

    fn write_register(&mut self, state: StateId, reg: usize, value: u64);

    /// Drain scheduling changes for the searcher
    fn take_updates(&mut self) -> StateUpdates;
}
