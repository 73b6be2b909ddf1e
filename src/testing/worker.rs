//! Worker dispatch loop.
//!
//! Wires one simulated interpreter, its state manager, the plugin registry
//! and a coordinated searcher together and runs them until the searcher has
//! nothing left to schedule.

use crate::config::config::StateManagerConfig;
use crate::config::types::{Result, SearcherKind, StateManagerError};
use crate::core::executor::Executor;
use crate::core::manager::StateManager;
use crate::core::plugin::{CorePlugin, Plugin};
use crate::core::searcher::{CoordinatedSearcher, DfsSearcher, RandomSearcher, Searcher};
use crate::core::topology::{FleetRegistry, WorkerReport};
use crate::core::types::{Flow, ProcessId, StateId};
use crate::testing::interpreter::{SimulatedInterpreter, Step};
use log::{debug, info, trace, warn};
use nix::unistd::{fork, ForkResult, Pid};
use std::cell::{Ref, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Which side of a process fork the caller is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkSide {
    Parent(Pid),
    Child,
}

pub struct Worker {
    interp: SimulatedInterpreter,
    manager: Rc<RefCell<StateManager>>,
    core: CorePlugin,
    searcher: CoordinatedSearcher<Box<dyn Searcher>>,
    timer_interval: Duration,
    last_timer: Option<Instant>,
    steps: u64,
    max_steps: Option<u64>,
}

impl Worker {
    pub fn new(
        interp: SimulatedInterpreter,
        manager: StateManager,
        config: &StateManagerConfig,
    ) -> Self {
        let manager = Rc::new(RefCell::new(manager));

        let mut core = CorePlugin::new();
        let listener: Rc<RefCell<dyn Plugin>> = manager.clone();
        core.register(listener);

        let base: Box<dyn Searcher> = match config.searcher {
            SearcherKind::Dfs => Box::new(DfsSearcher::default()),
            SearcherKind::Random => Box::new(RandomSearcher::new()),
        };
        let searcher = CoordinatedSearcher::new(base, Rc::clone(&manager));

        Self {
            interp,
            manager,
            core,
            searcher,
            timer_interval: config.timer_interval(),
            last_timer: None,
            steps: 0,
            max_steps: None,
        }
    }

    /// Stop after this many dispatched instructions.
    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    /// Register an extra event listener next to the state manager.
    pub fn register_plugin(&mut self, plugin: Rc<RefCell<dyn Plugin>>) {
        self.core.register(plugin);
    }

    pub fn interpreter(&self) -> &SimulatedInterpreter {
        &self.interp
    }

    pub fn interpreter_mut(&mut self) -> &mut SimulatedInterpreter {
        &mut self.interp
    }

    pub fn manager(&self) -> Ref<'_, StateManager> {
        self.manager.borrow()
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    fn timer_due(&mut self) -> bool {
        let now = Instant::now();
        match self.last_timer {
            Some(last) if now.duration_since(last) < self.timer_interval => false,
            _ => {
                self.last_timer = Some(now);
                true
            }
        }
    }

    /// Execute one instruction of `state` and raise the resulting events.
    fn dispatch(&mut self, state: StateId) -> Flow<()> {
        if self.timer_due() {
            self.core.on_timer(&mut self.interp)?;
        }

        match self.interp.step(state) {
            Step::NewBlock(pc) => {
                self.core.on_new_block_covered(&mut self.interp, state, pc)?;
            }
            Step::Custom(raw) => {
                self.core
                    .on_custom_instruction(&mut self.interp, state, raw)?;
                let size = self.interp.program().layout().size;
                self.interp.advance_pc(state, size);
            }
            Step::Forked(children) => {
                trace!("State {} forked {} children", state, children.len());
            }
            Step::Continue | Step::Exited => {}
        }
        Ok(())
    }

    /// Run the first state on its own until it has forked into at least
    /// `states` states (or ended), without consulting the coordinator.
    pub fn explore_until(&mut self, states: usize) {
        while self.interp.states_count() > 0 && self.interp.states_count() < states {
            let Some(first) = self.interp.states().first().copied() else {
                break;
            };
            self.interp.set_current(Some(first));
            if let Err(unwind) = self.dispatch(first) {
                debug!("Initial exploration interrupted: {}", unwind);
            }
            self.interp.set_current(None);
            self.steps += 1;
        }
    }

    /// Fork this worker process; the child takes over `slot` with the
    /// states `keep` accepts.
    pub fn fork_into(
        &mut self,
        registry: &FleetRegistry,
        slot: ProcessId,
        keep: impl Fn(StateId) -> bool,
    ) -> Result<ForkSide> {
        let parent = self.manager.borrow().process_id();
        self.core.on_process_fork(true, false, parent);

        // SAFETY: campaigns fork before any worker thread exists, so the
        // child cannot inherit a lock held by another thread. Shared state
        // lives in MAP_SHARED mappings built for cross-process use.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let released = self.interp.rebind(slot, keep);
                self.manager
                    .borrow_mut()
                    .rebind(Box::new(registry.topology_for(slot)), &released);
                self.core.on_process_fork(false, true, parent);
                Ok(ForkSide::Child)
            }
            Ok(ForkResult::Parent { child }) => {
                debug!("Forked worker slot {} as pid {}", slot, child);
                self.core.on_process_fork(false, false, parent);
                Ok(ForkSide::Parent(child))
            }
            Err(e) => Err(StateManagerError::Process(format!(
                "fork for slot {} failed: {}",
                slot, e
            ))),
        }
    }

    /// Drop every state `keep` rejects, in place. Succeeded states among
    /// them leave the coordinator through the kill hook so this slot's
    /// counter stays in step.
    pub fn retain_states(&mut self, keep: impl Fn(StateId) -> bool) {
        let me = self.manager.borrow().process_id();
        let dropped = self.interp.rebind(me, keep);
        let mut manager = self.manager.borrow_mut();
        for state in dropped {
            manager.on_state_killed(&mut self.interp, state);
        }
        manager.check_invariants();
    }

    /// Dispatch until no state is left anywhere in this worker.
    pub fn run(&mut self) -> WorkerReport {
        let me = self.manager.borrow().process_id();
        info!(
            "Worker {} starting with {} active states",
            me,
            self.interp.states_count()
        );

        loop {
            if let Some(max) = self.max_steps {
                if self.steps >= max {
                    warn!("Worker {} stopped after {} steps", me, self.steps);
                    break;
                }
            }

            let state = match self.searcher.select_state(&mut self.interp) {
                Ok(Some(state)) => state,
                Ok(None) => break,
                Err(unwind) => {
                    debug!("Scheduling interrupted: {}", unwind);
                    continue;
                }
            };

            self.interp.set_current(Some(state));
            if let Err(unwind) = self.dispatch(state) {
                trace!("Dispatch of {} ended early: {}", state, unwind);
            }
            self.interp.set_current(None);
            self.steps += 1;
        }

        let report = self.report();
        info!(
            "Worker {} finished after {} steps: {:?}",
            me, self.steps, report
        );
        report
    }

    pub fn report(&self) -> WorkerReport {
        let manager = self.manager.borrow();
        let survived = manager
            .survivor()
            .map(|s| self.interp.exited().contains(&s) || self.interp.is_alive(s))
            .unwrap_or(false);
        let metrics = manager.metrics();
        WorkerReport {
            finished: true,
            survivors: survived as u64,
            terminated: self.interp.terminated().len() as u64,
            succeeded: metrics.states_succeeded,
        }
    }
}
