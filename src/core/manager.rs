//! State lifecycle coordinator.
//!
//! Decides, at every scheduling opportunity, whether the interpreter simply
//! continues, whether a finished exploration is parked as "succeeded",
//! whether the fleet has stagnated, and drives the cross-process protocol
//! that reduces every succeeded state in the fleet to exactly one survivor.
//!
//! # Locking
//! Public operations take the segment lock themselves. The `*_locked`
//! helpers expect the caller to hold it and receive the guarded data as
//! proof. The lock is not reentrant: never call a public operation while a
//! guard is alive in the same process.
//!
//! # Unwinding
//! Terminating the currently executing state yields
//! `Err(Unwind::StateKilled)`. It is always the last action of an operation;
//! the guard is dropped while the error propagates, which releases the lock.

use crate::config::config::StateManagerConfig;
use crate::core::executor::{Executor, STATUS_REGISTER};
use crate::core::opcodes::{OpcodeLayout, StateManagerOp, STATE_MANAGER_OPCODE};
use crate::core::shared::{SharedSegment, StateManagerShared};
use crate::core::topology::ProcessTopology;
use crate::core::types::{Command, CommandKind, Flow, ProcessId, ProcessPhase, StateId, Unwind};
use crate::kernel::clock::Clock;
use crate::kernel::signal;
use crate::observability::events::emit;
use crate::observability::metrics::{CoordinatorMetrics, MetricsSnapshot};
use log::{debug, error, info, warn};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

const KILL_REASON: &str = "StateManager: killing state";

/// What the scheduler hook decided.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Schedule {
    /// Keep selecting states.
    Continue,
    /// No active and no succeeded states left; this worker is done.
    Exhausted,
}

pub struct StateManager {
    shared: Arc<SharedSegment>,
    topology: Box<dyn ProcessTopology>,
    clock: Box<dyn Clock>,
    layout: OpcodeLayout,
    timeout_ms: Option<u64>,
    poll_interval: Duration,
    succeeded: BTreeSet<StateId>,
    /// Cached clock reading, refreshed by the timer
    current_time: u64,
    survivor: Option<StateId>,
    phase: ProcessPhase,
    metrics: CoordinatorMetrics,
}

impl StateManager {
    /// Attach a coordinator for the calling process to the shared segment.
    ///
    /// The process slot is reset and the group-wide idle clock restarted.
    pub fn new(
        shared: Arc<SharedSegment>,
        topology: Box<dyn ProcessTopology>,
        clock: Box<dyn Clock>,
        config: &StateManagerConfig,
    ) -> Self {
        let mut manager = Self {
            shared,
            topology,
            clock,
            layout: OpcodeLayout::for_flavor(config.opcode_layout),
            timeout_ms: config.timeout().map(|t| t.as_millis() as u64),
            poll_interval: config.poll_interval(),
            succeeded: BTreeSet::new(),
            current_time: 0,
            survivor: None,
            phase: ProcessPhase::Active,
            metrics: CoordinatorMetrics::default(),
        };

        let shared = Arc::clone(&manager.shared);
        let mut guard = shared.acquire();
        guard.reset_slot(manager.process_id(), 0);
        manager.reset_timeout_locked(&mut guard);
        drop(guard);

        info!(
            "StateManager attached to slot {} (timeout={:?}ms)",
            manager.process_id(),
            manager.timeout_ms
        );
        manager
    }

    pub fn process_id(&self) -> ProcessId {
        self.topology.current_process_id()
    }

    pub fn succeeded(&self) -> &BTreeSet<StateId> {
        &self.succeeded
    }

    pub fn is_succeeded(&self, state: StateId) -> bool {
        self.succeeded.contains(&state)
    }

    /// State this process kept through the last convergence, if any
    pub fn survivor(&self) -> Option<StateId> {
        self.survivor
    }

    pub fn phase(&self) -> ProcessPhase {
        self.phase
    }

    pub fn layout(&self) -> OpcodeLayout {
        self.layout
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Move a forked child into its own slot.
    ///
    /// `released` are states the interpreter handed to other workers; they
    /// leave the succeeded set without touching the shared counters, which
    /// still belong to the parent's slot. The child fork hook then
    /// initialises the new slot from what is left. Counters start over so a
    /// success is only reported by the worker that saw it.
    pub fn rebind(&mut self, topology: Box<dyn ProcessTopology>, released: &[StateId]) {
        debug!(
            "StateManager rebinding from slot {} to slot {}, releasing {} states",
            self.process_id(),
            topology.current_process_id(),
            released.len()
        );
        self.topology = topology;
        for state in released {
            self.succeeded.remove(state);
        }
        self.survivor = None;
        self.phase = ProcessPhase::Active;
        self.metrics = CoordinatorMetrics::default();
        self.sync_gauge();
    }

    fn sync_gauge(&self) {
        self.metrics
            .succeeded_set_size
            .set(self.succeeded.len() as u64);
    }

    // ------------------------------------------------------------------
    // Invariants
    // ------------------------------------------------------------------

    /// Abort if the shared counter disagrees with the local succeeded set.
    pub fn check_invariants(&self) {
        let guard = self.shared.acquire();
        self.check_invariants_locked(&guard);
    }

    fn check_invariants_locked(&self, shared: &StateManagerShared) {
        let me = self.process_id();
        let counted = shared.success_count[me];
        if counted != self.succeeded.len() as u64 {
            let details = format!(
                "successCount[{}]={} but succeeded set holds {}",
                me,
                counted,
                self.succeeded.len()
            );
            emit::invariant_violation(me, details.clone());
            error!("{}", details);
            panic!("state accounting diverged: {}", details);
        }
    }

    // ------------------------------------------------------------------
    // Succeeded set
    // ------------------------------------------------------------------

    /// Park `state` as succeeded. False if it already was.
    pub fn succeed_state(&mut self, exec: &mut dyn Executor, state: StateId) -> bool {
        debug!("Succeeding state {}", state);
        let shared = Arc::clone(&self.shared);
        let mut guard = shared.acquire();
        self.check_invariants_locked(&guard);

        if !self.succeeded.insert(state) {
            // Consecutive succeeds of one state must not suspend it twice.
            debug!("State {} was already marked as succeeded", state);
            return false;
        }

        let suspended = exec.suspend_state(state);
        if !suspended {
            warn!("State {} was not active when it succeeded", state);
        }
        guard.success_count[self.process_id()] = self.succeeded.len() as u64;

        self.metrics.states_succeeded.inc();
        self.sync_gauge();
        emit::state_succeeded(self.process_id(), state);
        suspended
    }

    /// Put one succeeded state back into scheduling. False if it was not succeeded.
    pub fn resume_succeeded_state(&mut self, exec: &mut dyn Executor, state: StateId) -> bool {
        let shared = Arc::clone(&self.shared);
        let mut guard = shared.acquire();
        if !self.succeeded.contains(&state) {
            debug!("State {} is not succeeded, nothing to resume", state);
            return false;
        }
        self.check_invariants_locked(&guard);

        guard.success_count[self.process_id()] -= 1;
        self.succeeded.remove(&state);
        exec.resume_state(state);

        self.metrics.states_resumed.inc();
        self.sync_gauge();
        emit::state_resumed(self.process_id(), state);
        true
    }

    /// Resume every succeeded state and zero the local counter.
    pub fn resume_all_succeeded(&mut self, exec: &mut dyn Executor) {
        let shared = Arc::clone(&self.shared);
        let mut guard = shared.acquire();
        self.resume_all_locked(&mut guard, exec);
    }

    fn resume_all_locked(&mut self, shared: &mut StateManagerShared, exec: &mut dyn Executor) {
        self.check_invariants_locked(shared);
        for state in std::mem::take(&mut self.succeeded) {
            exec.resume_state(state);
            self.metrics.states_resumed.inc();
        }
        shared.success_count[self.process_id()] = 0;
        self.sync_gauge();
    }

    /// The interpreter destroyed `state`; forget it if it was succeeded.
    pub fn on_state_killed(&mut self, exec: &mut dyn Executor, state: StateId) {
        if self.succeeded.contains(&state) {
            debug!("Succeeded state {} destroyed by the interpreter", state);
            self.resume_succeeded_state(exec, state);
        }
    }

    // ------------------------------------------------------------------
    // Stagnation timeout
    // ------------------------------------------------------------------

    fn timeout_reached(&self, shared: &StateManagerShared) -> bool {
        let Some(timeout) = self.timeout_ms else {
            return false;
        };
        let prev = shared.time_of_last_new_block;
        if prev > self.current_time {
            // Another worker is ahead of our cached time.
            return false;
        }
        self.current_time - prev >= timeout
    }

    fn reset_timeout_locked(&mut self, shared: &mut StateManagerShared) {
        let now = self.clock.now_millis();
        shared.time_of_last_new_block = now;
        self.current_time = now;
    }

    /// A previously unseen code region was translated somewhere in this worker.
    pub fn on_new_block_covered(&mut self, pc: u64) {
        debug!("New block {:#x} discovered", pc);
        let shared = Arc::clone(&self.shared);
        let mut guard = shared.acquire();
        self.reset_timeout_locked(&mut guard);
    }

    /// Periodic timer: refresh the cached time, then check for stagnation.
    pub fn on_timer(&mut self, exec: &mut dyn Executor) -> Flow<()> {
        self.current_time = self.clock.now_millis();
        self.kill_on_timeout(exec)?;
        Ok(())
    }

    /// Force convergence if no new block was seen for the configured timeout.
    pub fn kill_on_timeout(&mut self, exec: &mut dyn Executor) -> Flow<bool> {
        let shared = Arc::clone(&self.shared);
        let mut guard = shared.acquire();
        self.kill_on_timeout_locked(&mut guard, exec)
    }

    fn kill_on_timeout_locked(
        &mut self,
        shared: &mut StateManagerShared,
        exec: &mut dyn Executor,
    ) -> Flow<bool> {
        if !self.timeout_reached(shared) {
            return Ok(false);
        }

        let idle = self.current_time - shared.time_of_last_new_block;
        debug!(
            "No more blocks found in {} seconds, killing states.",
            idle / 1000
        );
        self.metrics.timeouts.inc();
        emit::timeout_fired(self.process_id(), idle);

        // Reset first: the convergence below may unwind out of this call.
        self.reset_timeout_locked(shared);

        if !self.kill_all_but_one_successful_locked(shared, exec)? {
            debug!("There are no successful states to kill...");
            return Ok(false);
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Convergence
    // ------------------------------------------------------------------

    /// Reduce the fleet to one succeeded state. False when no process holds any.
    pub fn kill_all_but_one_successful(&mut self, exec: &mut dyn Executor) -> Flow<bool> {
        let shared = Arc::clone(&self.shared);
        let mut guard = shared.acquire();
        self.kill_all_but_one_successful_locked(&mut guard, exec)
    }

    /// Slot that keeps its succeeded state: the in-flight election while it
    /// is still valid, else the first live slot with a nonzero counter.
    fn elect(&self, shared: &mut StateManagerShared) -> Option<ProcessId> {
        if let Some(node) = shared.keep_one_state_on_node() {
            if self.topology.process_index_for_id(node).is_some() && shared.success_count[node] > 0
            {
                return Some(node);
            }
            warn!("Dropping stale election of node {}", node);
            shared.clear_election();
        }

        (0..self.topology.max_processes()).find(|&slot| {
            self.topology.process_index_for_id(slot).is_some() && shared.success_count[slot] > 0
        })
    }

    fn kill_all_but_one_successful_locked(
        &mut self,
        shared: &mut StateManagerShared,
        exec: &mut dyn Executor,
    ) -> Flow<bool> {
        self.check_invariants_locked(shared);

        let Some(node) = self.elect(shared) else {
            return Ok(false);
        };
        let me = self.process_id();

        debug!(
            "StateManager: Killing all but one successful on node {} (index {:?})",
            node,
            self.topology.process_index_for_id(node)
        );
        self.metrics.elections.inc();
        emit::election_started(me, node);

        if node == me {
            self.send_kill_to_all_instances(shared, node);
            self.kill_all_but_one_successful_local_locked(shared, exec)?;
        } else {
            // Concurrent convergences must all pick this node.
            shared.elect(node);
            self.send_kill_to_all_instances(shared, node);
            self.resume_all_locked(shared, exec);
            self.kill_all_except(exec, &BTreeSet::new())?;
        }
        Ok(true)
    }

    /// Keep the smallest succeeded state of this process, kill every other state.
    pub fn kill_all_but_one_successful_local(&mut self, exec: &mut dyn Executor) -> Flow<()> {
        let shared = Arc::clone(&self.shared);
        let mut guard = shared.acquire();
        self.kill_all_but_one_successful_local_locked(&mut guard, exec)
    }

    fn kill_all_but_one_successful_local_locked(
        &mut self,
        shared: &mut StateManagerShared,
        exec: &mut dyn Executor,
    ) -> Flow<()> {
        debug!("StateManager: killAllButOneSuccessfulLocal");
        self.check_invariants_locked(shared);

        let Some(&one) = self.succeeded.iter().next() else {
            warn!("No succeeded state to keep on node {}", self.process_id());
            return Ok(());
        };
        self.resume_all_locked(shared, exec);

        self.survivor = Some(one);
        self.metrics.states_kept.inc();
        emit::election_resolved(self.process_id(), Some(one));
        info!("Keeping state {} as the surviving successful state", one);

        let keep = BTreeSet::from([one]);
        self.kill_all_except(exec, &keep)
    }

    /// Terminate every active state not in `keep`; the current state goes last.
    pub fn kill_all_except(
        &mut self,
        exec: &mut dyn Executor,
        keep: &BTreeSet<StateId>,
    ) -> Flow<()> {
        debug!("StateManager: killAllExcept {:?}", keep);

        let current = exec.current_state();
        let mut kill_current = false;
        for state in exec.states() {
            if keep.contains(&state) {
                continue;
            }
            if Some(state) == current {
                kill_current = true;
                continue;
            }
            exec.terminate_state_early(state, KILL_REASON)?;
            self.metrics.states_terminated.inc();
        }

        if kill_current {
            if let Some(state) = current {
                self.metrics.states_terminated.inc();
                exec.terminate_state_early(state, KILL_REASON)?;
            }
        }
        Ok(())
    }

    /// Queue a kill for every other live slot. Only `keep_on` itself keeps
    /// a succeeded state when it drains the command.
    fn send_kill_to_all_instances(&mut self, shared: &mut StateManagerShared, keep_on: ProcessId) {
        let me = self.process_id();
        let cmd = Command::kill(Some(keep_on));
        let mut recipients = 0;

        for slot in 0..self.topology.max_processes() {
            if slot == me || self.topology.process_index_for_id(slot).is_none() {
                continue;
            }
            match shared.commands[slot].push(cmd) {
                Ok(()) => {
                    // Wake a parked worker so it drains its mailbox.
                    shared.suspended_processes[slot] = false;
                    recipients += 1;
                }
                Err(_) => {
                    error!(
                        "Mailbox of node {} is full, dropping {:?} (pending kills still apply)",
                        slot, cmd
                    );
                }
            }
        }

        self.metrics.kill_commands_sent.add(recipients as u64);
        emit::kill_broadcast(me, Some(keep_on), recipients);
    }

    /// Execute every command queued for this process.
    pub fn process_commands(&mut self, exec: &mut dyn Executor) -> Flow<()> {
        let shared = Arc::clone(&self.shared);
        let mut guard = shared.acquire();
        self.process_commands_locked(&mut guard, exec)
    }

    fn process_commands_locked(
        &mut self,
        shared: &mut StateManagerShared,
        exec: &mut dyn Executor,
    ) -> Flow<()> {
        let me = self.process_id();
        while let Some(cmd) = shared.commands[me].pop() {
            if cmd.kind != CommandKind::Kill {
                continue;
            }
            debug!("StateManager: received kill command {:?}", cmd);
            self.metrics.kill_commands_received.inc();

            if cmd.keep_target() == Some(me) {
                if shared.keep_one_state_on_node() != Some(me) {
                    warn!(
                        "Keep-one command for node {} but election records {:?}",
                        me,
                        shared.keep_one_state_on_node()
                    );
                }
                shared.clear_election();
                // An earlier command may already have emptied the set.
                if self.succeeded.is_empty() {
                    emit::election_resolved(me, None);
                } else {
                    self.kill_all_but_one_successful_local_locked(shared, exec)?;
                }
            } else {
                self.phase = ProcessPhase::Terminated;
                self.resume_all_locked(shared, exec);
                self.kill_all_except(exec, &BTreeSet::new())?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Process lifecycle
    // ------------------------------------------------------------------

    /// Process fork hook: validate before, initialise the child's slot after.
    pub fn on_process_fork(&mut self, pre_fork: bool, is_child: bool, parent: ProcessId) {
        if pre_fork {
            self.check_invariants();
            return;
        }

        if is_child {
            let me = self.process_id();
            debug!(
                "StateManager forked curProc={} parentProcId={}",
                me, parent
            );
            self.shared
                .acquire()
                .reset_slot(me, self.succeeded.len() as u64);
        }

        self.check_invariants();
    }

    fn resume_all_processes(&self, shared: &mut StateManagerShared) {
        debug!("Resuming all processes");
        for flag in shared.suspended_processes[..self.topology.max_processes()].iter_mut() {
            *flag = false;
        }
    }

    /// Park this process until a global decision is made.
    ///
    /// Returns when another process cleared our suspended flag, or after this
    /// process observed that every live process is suspended and ran the
    /// convergence itself.
    pub fn suspend_current_process(&mut self, exec: &mut dyn Executor) -> Flow<()> {
        let me = self.process_id();
        debug!("Suspending process {}", me);

        self.shared.acquire().suspended_processes[me] = true;
        self.phase = ProcessPhase::Suspended;
        self.metrics.suspensions.inc();
        emit::process_suspended(me);

        let shared = Arc::clone(&self.shared);
        loop {
            if let Some(mut guard) = shared.try_acquire() {
                if !guard.suspended_processes[me] {
                    self.phase = ProcessPhase::Resolving;
                    emit::process_resumed(me, "woken by peer");
                    return Ok(());
                }

                if guard.suspended_count(self.topology.max_processes())
                    == self.topology.current_process_count()
                {
                    // Exploration is exhausted everywhere but succeeded states.
                    self.resume_all_processes(&mut guard);
                    self.phase = ProcessPhase::Resolving;
                    emit::process_resumed(me, "all processes suspended");
                    self.kill_all_but_one_successful_locked(&mut guard, exec)?;
                    return Ok(());
                }

                if !signal::should_continue() {
                    guard.suspended_processes[me] = false;
                    warn!("Shutdown requested while process {} was suspended", me);
                    return Ok(());
                }
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    /// Scheduler hook, run every time the interpreter needs a state.
    pub fn schedule(&mut self, exec: &mut dyn Executor) -> Flow<Schedule> {
        let shared = Arc::clone(&self.shared);
        let mut guard = shared.acquire();
        self.check_invariants_locked(&guard);

        self.process_commands_locked(&mut guard, exec)?;

        if exec.states_count() == 0 {
            debug!("No more active states");
            if self.succeeded.is_empty() {
                debug!("No more succeeded states");
                self.phase = ProcessPhase::Terminated;
                return Ok(Schedule::Exhausted);
            }
            drop(guard);

            self.suspend_current_process(exec)?;

            // Only a kill can resume us, so drain the mailbox now.
            let mut guard = shared.acquire();
            self.process_commands_locked(&mut guard, exec)?;
            if exec.states_count() > 0 {
                self.phase = ProcessPhase::Active;
            }
            return Ok(Schedule::Continue);
        }

        self.kill_on_timeout_locked(&mut guard, exec)?;
        Ok(Schedule::Continue)
    }

    // ------------------------------------------------------------------
    // Guest interface
    // ------------------------------------------------------------------

    /// Custom instruction handler. The success sub-function always unwinds
    /// with `CpuExit` after moving the pc past the instruction, so the
    /// opcode is not executed again once the state resumes.
    pub fn on_custom_instruction(
        &mut self,
        exec: &mut dyn Executor,
        state: StateId,
        opcode: u64,
    ) -> Flow<()> {
        if !self.layout.matches(opcode, STATE_MANAGER_OPCODE) {
            return Ok(());
        }

        let sub = self.layout.subfunction(opcode);
        match StateManagerOp::from_subfunction(sub) {
            Some(StateManagerOp::Succeed) => {
                let status = exec.read_register(state, STATUS_REGISTER);
                debug!("State {} signalled success with status {:#x}", state, status);
                self.succeed_state(exec, state);

                let pc = exec.read_pc(state) + self.layout.size;
                exec.write_pc(state, pc);
                Err(Unwind::CpuExit)
            }
            Some(StateManagerOp::GetSuccessfulStateCount) => {
                let count = {
                    let guard = self.shared.acquire();
                    guard.total_success_count(self.topology.max_processes())
                };
                exec.write_register(state, STATUS_REGISTER, count);
                Ok(())
            }
            None => {
                warn!("StateManager: incorrect opcode {:#x}", sub);
                Ok(())
            }
        }
    }
}

impl Drop for StateManager {
    fn drop(&mut self) {
        let me = self.process_id();
        let shared = Arc::clone(&self.shared);
        let mut guard = shared.acquire();
        if !std::thread::panicking() {
            self.check_invariants_locked(&guard);
        }
        guard.success_count[me] =
            guard.success_count[me].saturating_sub(self.succeeded.len() as u64);
        guard.suspended_processes[me] = false;
        if guard.keep_one_state_on_node() == Some(me) {
            guard.clear_election();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::topology::FleetRegistry;
    use crate::kernel::clock::ManualClock;
    use crate::testing::interpreter::SimulatedInterpreter;
    use crate::testing::program::Program;

    struct Harness {
        shared: Arc<SharedSegment>,
        registry: FleetRegistry,
        clock: ManualClock,
        config: StateManagerConfig,
    }

    impl Harness {
        fn new(processes: usize, timeout_secs: u64) -> Self {
            let registry = FleetRegistry::new(processes).unwrap();
            for slot in 0..processes {
                registry.register(slot).unwrap();
            }
            Self {
                shared: Arc::new(SharedSegment::new().unwrap()),
                registry,
                clock: ManualClock::new(10_000),
                config: StateManagerConfig {
                    timeout_secs,
                    poll_interval_ms: 5,
                    max_processes: processes,
                    ..Default::default()
                },
            }
        }

        fn process(&self, slot: ProcessId) -> (StateManager, SimulatedInterpreter) {
            let manager = StateManager::new(
                Arc::clone(&self.shared),
                Box::new(self.registry.topology_for(slot)),
                Box::new(self.clock.clone()),
                &self.config,
            );
            let layout = OpcodeLayout::for_flavor(self.config.opcode_layout);
            let interp = SimulatedInterpreter::new(slot, Arc::new(Program::idle(layout)));
            (manager, interp)
        }
    }

    #[test]
    fn test_succeed_state_is_idempotent() {
        let h = Harness::new(1, 0);
        let (mut sm, mut interp) = h.process(0);
        let s = interp.spawn_state();

        assert!(sm.succeed_state(&mut interp, s));
        assert!(!sm.succeed_state(&mut interp, s));
        assert_eq!(sm.succeeded().len(), 1);
        assert_eq!(h.shared.acquire().success_count[0], 1);
        assert!(!interp.is_active(s));
        sm.check_invariants();
    }

    #[test]
    fn test_resume_unknown_state_has_no_effect() {
        let h = Harness::new(1, 0);
        let (mut sm, mut interp) = h.process(0);
        let s = interp.spawn_state();

        assert!(!sm.resume_succeeded_state(&mut interp, s));
        assert!(interp.is_active(s));
        assert_eq!(h.shared.acquire().success_count[0], 0);
    }

    #[test]
    fn test_resume_succeeded_state_round_trip() {
        let h = Harness::new(1, 0);
        let (mut sm, mut interp) = h.process(0);
        let a = interp.spawn_state();
        let b = interp.spawn_state();
        sm.succeed_state(&mut interp, a);
        sm.succeed_state(&mut interp, b);

        assert!(sm.resume_succeeded_state(&mut interp, a));
        assert!(interp.is_active(a));
        assert_eq!(h.shared.acquire().success_count[0], 1);

        sm.resume_all_succeeded(&mut interp);
        assert!(sm.succeeded().is_empty());
        assert!(interp.is_active(b));
        assert_eq!(h.shared.acquire().success_count[0], 0);
    }

    #[test]
    fn test_scenario_a_nothing_to_converge() {
        let h = Harness::new(1, 0);
        let (mut sm, mut interp) = h.process(0);
        assert_eq!(sm.kill_all_but_one_successful(&mut interp), Ok(false));
    }

    #[test]
    fn test_scenario_b_local_keep_one() {
        let h = Harness::new(1, 0);
        let (mut sm, mut interp) = h.process(0);
        let states: Vec<_> = (0..3).map(|_| interp.spawn_state()).collect();
        for s in &states {
            sm.succeed_state(&mut interp, *s);
        }

        sm.kill_all_but_one_successful_local(&mut interp).unwrap();

        assert!(sm.succeeded().is_empty());
        let alive: Vec<_> = states.iter().filter(|s| interp.is_alive(**s)).collect();
        assert_eq!(alive.len(), 1);
        assert_eq!(interp.terminated().len(), 2);
        assert_eq!(sm.survivor(), Some(states[0]));
    }

    #[test]
    fn test_kill_of_current_state_unwinds_last() {
        let h = Harness::new(1, 0);
        let (mut sm, mut interp) = h.process(0);
        let a = interp.spawn_state();
        let b = interp.spawn_state();
        let c = interp.spawn_state();
        interp.set_current(Some(a));

        let result = sm.kill_all_except(&mut interp, &BTreeSet::from([c]));
        assert_eq!(result, Err(Unwind::StateKilled(a)));
        assert!(!interp.is_alive(b));
        assert!(interp.is_alive(c));
        assert_eq!(interp.terminated().last().map(|t| t.0), Some(a));
    }

    #[test]
    fn test_timeout_fires_once_per_stagnation() {
        let h = Harness::new(1, 30);
        let (mut sm, mut interp) = h.process(0);
        let a = interp.spawn_state();
        let b = interp.spawn_state();
        sm.succeed_state(&mut interp, a);
        sm.succeed_state(&mut interp, b);

        h.clock.advance_secs(10);
        sm.on_timer(&mut interp).unwrap();
        assert_eq!(sm.metrics().timeouts, 0);

        h.clock.advance_secs(25);
        sm.on_timer(&mut interp).unwrap();
        assert_eq!(sm.metrics().timeouts, 1);
        assert_eq!(sm.survivor(), Some(a));
        assert!(!interp.is_alive(b));

        assert_eq!(sm.kill_on_timeout(&mut interp), Ok(false));
        assert_eq!(sm.metrics().timeouts, 1);
    }

    #[test]
    fn test_new_block_postpones_timeout() {
        let h = Harness::new(1, 30);
        let (mut sm, mut interp) = h.process(0);
        h.clock.advance_secs(29);
        sm.on_new_block_covered(0x1000);
        h.clock.advance_secs(29);
        sm.on_timer(&mut interp).unwrap();
        assert_eq!(sm.metrics().timeouts, 0);
    }

    #[test]
    fn test_peer_ahead_in_time_does_not_fire() {
        let h = Harness::new(1, 30);
        let (mut sm, mut interp) = h.process(0);
        h.shared.acquire().time_of_last_new_block = 1_000_000;
        h.clock.advance_secs(60);
        assert_eq!(sm.kill_on_timeout(&mut interp), Ok(false));
    }

    #[test]
    fn test_zero_timeout_never_fires() {
        let h = Harness::new(1, 0);
        let (mut sm, mut interp) = h.process(0);
        let a = interp.spawn_state();
        sm.succeed_state(&mut interp, a);
        h.clock.advance_secs(100_000);
        assert_eq!(sm.kill_on_timeout(&mut interp), Ok(false));
    }

    #[test]
    fn test_succeed_opcode_advances_pc_and_exits_cpu() {
        let h = Harness::new(1, 0);
        let (mut sm, mut interp) = h.process(0);
        let s = interp.spawn_state();
        interp.write_pc(s, 0x40);
        interp.write_register(s, STATUS_REGISTER, 7);

        let layout = sm.layout();
        let raw = layout.encode(STATE_MANAGER_OPCODE, StateManagerOp::Succeed.subfunction());
        assert_eq!(
            sm.on_custom_instruction(&mut interp, s, raw),
            Err(Unwind::CpuExit)
        );
        assert!(sm.is_succeeded(s));
        assert_eq!(interp.read_pc(s), 0x40 + layout.size);
    }

    #[test]
    fn test_count_opcode_reports_fleet_total() {
        let h = Harness::new(2, 0);
        let (mut sm0, mut interp0) = h.process(0);
        let (mut sm1, mut interp1) = h.process(1);
        let a = interp0.spawn_state();
        let b = interp1.spawn_state();
        let c = interp1.spawn_state();
        sm0.succeed_state(&mut interp0, a);
        sm1.succeed_state(&mut interp1, b);

        let raw = sm1
            .layout()
            .encode(STATE_MANAGER_OPCODE, StateManagerOp::GetSuccessfulStateCount.subfunction());
        sm1.on_custom_instruction(&mut interp1, c, raw).unwrap();
        assert_eq!(interp1.read_register(c, STATUS_REGISTER), 2);
    }

    #[test]
    fn test_foreign_opcode_ignored() {
        let h = Harness::new(1, 0);
        let (mut sm, mut interp) = h.process(0);
        let s = interp.spawn_state();
        let raw = sm.layout().encode(0xAA, 0);
        assert_eq!(sm.on_custom_instruction(&mut interp, s, raw), Ok(()));
        assert!(!sm.is_succeeded(s));
    }

    #[test]
    fn test_killed_succeeded_state_is_forgotten() {
        let h = Harness::new(1, 0);
        let (mut sm, mut interp) = h.process(0);
        let s = interp.spawn_state();
        sm.succeed_state(&mut interp, s);
        interp.terminate_state_early(s, "external").unwrap();

        sm.on_state_killed(&mut interp, s);
        assert!(sm.succeeded().is_empty());
        assert_eq!(h.shared.acquire().success_count[0], 0);
    }

    #[test]
    #[should_panic(expected = "state accounting diverged")]
    fn test_counter_mismatch_is_fatal() {
        let h = Harness::new(1, 0);
        let (sm, _interp) = h.process(0);
        h.shared.acquire().success_count[0] = 3;
        sm.check_invariants();
    }

    #[test]
    fn test_drop_releases_counter_and_election() {
        let h = Harness::new(2, 0);
        {
            let (mut sm, mut interp) = h.process(1);
            let s = interp.spawn_state();
            sm.succeed_state(&mut interp, s);
            h.shared.acquire().elect(1);
        }
        let guard = h.shared.acquire();
        assert_eq!(guard.success_count[1], 0);
        assert_eq!(guard.keep_one_state_on_node(), None);
    }

    #[test]
    fn test_fork_hook_initialises_child_slot() {
        let h = Harness::new(2, 0);
        let (mut sm, mut interp) = h.process(0);
        let s = interp.spawn_state();
        sm.succeed_state(&mut interp, s);
        sm.on_process_fork(true, false, 0);

        h.shared.acquire().commands[1]
            .push(Command::kill(None))
            .unwrap();
        h.shared.acquire().suspended_processes[1] = true;

        // The child inherits the succeeded set and now lives in slot 1.
        sm.rebind(Box::new(h.registry.topology_for(1)), &[]);
        sm.on_process_fork(false, true, 0);

        let guard = h.shared.acquire();
        assert_eq!(guard.success_count[1], 1);
        assert!(guard.commands[1].is_empty());
        assert!(!guard.suspended_processes[1]);
    }

    #[test]
    fn test_child_rebind_keeps_only_owned_successes() {
        let h = Harness::new(2, 0);
        let (mut sm, mut interp) = h.process(0);
        let mine = interp.spawn_state();
        let theirs = interp.spawn_state();
        sm.succeed_state(&mut interp, mine);
        sm.succeed_state(&mut interp, theirs);
        sm.on_process_fork(true, false, 0);

        sm.rebind(Box::new(h.registry.topology_for(1)), &[mine]);
        sm.on_process_fork(false, true, 0);

        assert_eq!(sm.succeeded(), &BTreeSet::from([theirs]));
        assert_eq!(sm.metrics().states_succeeded, 0);
        assert_eq!(sm.metrics().succeeded_set_size, 1);
        let guard = h.shared.acquire();
        assert_eq!(guard.success_count[1], 1);
        // The parent slot is untouched by the child.
        assert_eq!(guard.success_count[0], 2);
    }

    #[test]
    fn test_schedule_exhausted_without_states() {
        let h = Harness::new(1, 0);
        let (mut sm, mut interp) = h.process(0);
        assert_eq!(sm.schedule(&mut interp), Ok(Schedule::Exhausted));
        assert_eq!(sm.phase(), ProcessPhase::Terminated);
    }

    #[test]
    fn test_schedule_last_process_converges_alone() {
        let h = Harness::new(1, 0);
        let (mut sm, mut interp) = h.process(0);
        let a = interp.spawn_state();
        let b = interp.spawn_state();
        sm.succeed_state(&mut interp, a);
        sm.succeed_state(&mut interp, b);

        assert_eq!(sm.schedule(&mut interp), Ok(Schedule::Continue));
        assert_eq!(interp.states(), vec![a]);
        assert!(!interp.is_alive(b));
        assert!(sm.succeeded().is_empty());
    }
}
