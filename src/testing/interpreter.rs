//! Deterministic stand-in for the symbolic interpreter.
//!
//! Executes a [`Program`] one instruction per step and exposes the state
//! primitives the coordinator needs. Scheduling changes accumulate in a
//! [`StateUpdates`] buffer the searcher drains.

use crate::core::executor::{Executor, StateUpdates};
use crate::core::types::{ExecutionState, Flow, ProcessId, StateId, Unwind};
use crate::testing::program::{Insn, Program};
use log::{debug, trace, warn};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

pub const REGISTER_COUNT: usize = 4;

#[derive(Clone, Debug)]
struct SimState {
    info: ExecutionState,
    pc: u64,
    regs: [u64; REGISTER_COUNT],
}

/// Outcome of one dispatched instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// First execution of the block starting at this pc
    NewBlock(u64),
    /// Custom instruction; the pc has not moved yet
    Custom(u64),
    Forked(Vec<StateId>),
    Exited,
}

pub struct SimulatedInterpreter {
    process: ProcessId,
    next_local: u32,
    program: Arc<Program>,
    states: BTreeMap<StateId, SimState>,
    active: BTreeSet<StateId>,
    suspended: BTreeSet<StateId>,
    current: Option<StateId>,
    covered: HashSet<u64>,
    terminated: Vec<(StateId, String)>,
    exited: Vec<StateId>,
    updates: StateUpdates,
}

impl SimulatedInterpreter {
    pub fn new(process: ProcessId, program: Arc<Program>) -> Self {
        Self {
            process,
            next_local: 0,
            program,
            states: BTreeMap::new(),
            active: BTreeSet::new(),
            suspended: BTreeSet::new(),
            current: None,
            covered: HashSet::new(),
            terminated: Vec::new(),
            exited: Vec::new(),
            updates: StateUpdates::default(),
        }
    }

    pub fn process(&self) -> ProcessId {
        self.process
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    fn next_id(&mut self) -> StateId {
        let id = StateId::new(self.process, self.next_local);
        self.next_local += 1;
        id
    }

    fn insert_active(&mut self, state: SimState) -> StateId {
        let id = state.info.id;
        self.states.insert(id, state);
        self.active.insert(id);
        self.updates.added.push(id);
        id
    }

    /// New active state at the program entry.
    pub fn spawn_state(&mut self) -> StateId {
        let id = self.next_id();
        let pc = self.program.entry();
        self.insert_active(SimState {
            info: ExecutionState::new(id),
            pc,
            regs: [0; REGISTER_COUNT],
        })
    }

    /// Clone `parent` once per target pc. The parent carries on; children
    /// are speculative.
    pub fn fork_state(&mut self, parent: StateId, targets: &[u64]) -> Vec<StateId> {
        let Some(template) = self.states.get(&parent).cloned() else {
            warn!("Cannot fork unknown state {}", parent);
            return Vec::new();
        };

        let mut children = Vec::with_capacity(targets.len());
        for pc in targets {
            let id = self.next_id();
            let mut info = ExecutionState::new(id);
            info.speculative = true;
            info.carry_on = false;
            children.push(self.insert_active(SimState {
                info,
                pc: *pc,
                regs: template.regs,
            }));
        }
        debug!("State {} forked into {:?}", parent, children);
        children
    }

    pub fn set_current(&mut self, state: Option<StateId>) {
        self.current = state;
    }

    pub fn is_alive(&self, state: StateId) -> bool {
        self.states.contains_key(&state)
    }

    pub fn is_suspended(&self, state: StateId) -> bool {
        self.suspended.contains(&state)
    }

    /// Active plus suspended states
    pub fn live_states(&self) -> Vec<StateId> {
        self.states.keys().copied().collect()
    }

    pub fn state(&self, state: StateId) -> Option<&ExecutionState> {
        self.states.get(&state).map(|s| &s.info)
    }

    /// States destroyed early, with the reason, in termination order
    pub fn terminated(&self) -> &[(StateId, String)] {
        &self.terminated
    }

    /// States whose path ended normally
    pub fn exited(&self) -> &[StateId] {
        &self.exited
    }

    pub fn covered_blocks(&self) -> usize {
        self.covered.len()
    }

    pub fn advance_pc(&mut self, state: StateId, delta: u64) {
        if let Some(s) = self.states.get_mut(&state) {
            s.pc += delta;
        }
    }

    /// Move this interpreter into another process slot after a fork,
    /// keeping only the states `keep` accepts. New ids use the new slot.
    ///
    /// Returns the dropped states; the coordinator must forget them.
    pub fn rebind(
        &mut self,
        process: ProcessId,
        keep: impl Fn(StateId) -> bool,
    ) -> Vec<StateId> {
        let dropped: Vec<StateId> = self.states.keys().copied().filter(|s| !keep(*s)).collect();
        for id in &dropped {
            self.states.remove(id);
            self.active.remove(id);
            self.suspended.remove(id);
        }
        if process != self.process {
            self.process = process;
            self.next_local = 0;
        }
        self.current = None;
        self.updates = StateUpdates {
            added: self.active.iter().copied().collect(),
            ..Default::default()
        };
        debug!(
            "Interpreter rebound to slot {}: kept {} states, dropped {}",
            process,
            self.states.len(),
            dropped.len()
        );
        dropped
    }

    /// Execute one instruction of an active state.
    pub fn step(&mut self, id: StateId) -> Step {
        if !self.active.contains(&id) {
            warn!("Attempt to run inactive state {}", id);
            return Step::Continue;
        }
        let Some(pc) = self.states.get(&id).map(|s| s.pc) else {
            return Step::Continue;
        };
        let program = Arc::clone(&self.program);

        let Some(insn) = program.fetch(pc) else {
            warn!("State {} jumped to unmapped pc {:#x}", id, pc);
            self.finish(id);
            return Step::Exited;
        };
        trace!("{} @ {:#x}: {:?}", id, pc, insn);

        match insn {
            Insn::Block => {
                self.advance_pc(id, 1);
                if self.covered.insert(pc) {
                    Step::NewBlock(pc)
                } else {
                    Step::Continue
                }
            }
            Insn::Fork(targets) => match targets.split_first() {
                Some((first, rest)) => {
                    let children = self.fork_state(id, rest);
                    if let Some(s) = self.states.get_mut(&id) {
                        s.pc = *first;
                    }
                    Step::Forked(children)
                }
                None => {
                    self.advance_pc(id, 1);
                    Step::Continue
                }
            },
            Insn::Custom(raw) => Step::Custom(*raw),
            Insn::SetReg { reg, value } => {
                self.write_register(id, *reg, *value);
                self.advance_pc(id, 1);
                Step::Continue
            }
            Insn::Jump(target) => {
                self.write_pc(id, *target);
                Step::Continue
            }
            Insn::Exit => {
                self.finish(id);
                Step::Exited
            }
        }
    }

    fn finish(&mut self, id: StateId) {
        debug!("State {} exited", id);
        self.states.remove(&id);
        self.active.remove(&id);
        self.suspended.remove(&id);
        self.exited.push(id);
        self.updates.removed.push(id);
        self.updates.terminated.push(id);
        if self.current == Some(id) {
            self.current = None;
        }
    }
}

impl Executor for SimulatedInterpreter {
    fn suspend_state(&mut self, state: StateId) -> bool {
        if !self.active.remove(&state) {
            return false;
        }
        self.suspended.insert(state);
        self.updates.removed.push(state);
        true
    }

    fn resume_state(&mut self, state: StateId) -> bool {
        if !self.suspended.remove(&state) {
            return false;
        }
        self.active.insert(state);
        self.updates.added.push(state);
        true
    }

    fn terminate_state_early(&mut self, state: StateId, reason: &str) -> Flow<()> {
        if self.states.remove(&state).is_none() {
            warn!("Terminating unknown state {}", state);
            return Ok(());
        }
        debug!("Terminating state {} early: {}", state, reason);
        self.active.remove(&state);
        self.suspended.remove(&state);
        self.terminated.push((state, reason.to_string()));
        self.updates.removed.push(state);
        self.updates.terminated.push(state);

        if self.current == Some(state) {
            self.current = None;
            return Err(Unwind::StateKilled(state));
        }
        Ok(())
    }

    fn states_count(&self) -> usize {
        self.active.len()
    }

    fn states(&self) -> Vec<StateId> {
        self.active.iter().copied().collect()
    }

    fn is_active(&self, state: StateId) -> bool {
        self.active.contains(&state)
    }

    fn current_state(&self) -> Option<StateId> {
        self.current
    }

    fn read_pc(&self, state: StateId) -> u64 {
        self.states.get(&state).map(|s| s.pc).unwrap_or(0)
    }

    fn write_pc(&mut self, state: StateId, pc: u64) {
        if let Some(s) = self.states.get_mut(&state) {
            s.pc = pc;
        }
    }

    fn read_register(&self, state: StateId, reg: usize) -> u64 {
        self.states
            .get(&state)
            .and_then(|s| s.regs.get(reg).copied())
            .unwrap_or(0)
    }

    fn write_register(&mut self, state: StateId, reg: usize, value: u64) {
        if let Some(slot) = self.states.get_mut(&state).and_then(|s| s.regs.get_mut(reg)) {
            *slot = value;
        }
    }

    fn take_updates(&mut self) -> StateUpdates {
        std::mem::take(&mut self.updates)
    }
}
