//! State selection.
//!
//! A [`Searcher`] decides which active state runs next. The
//! [`CoordinatedSearcher`] wraps any base searcher and runs the state
//! manager's scheduler hook before every decision, so suspensions,
//! convergence and timeouts happen exactly at scheduling points.

use crate::core::executor::Executor;
use crate::core::manager::{Schedule, StateManager};
use crate::core::types::{Flow, StateId};
use crate::kernel::signal;
use log::{debug, warn};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

pub trait Searcher {
    /// Next state to run, `None` when there is nothing left to schedule.
    fn select_state(&mut self, exec: &mut dyn Executor) -> Flow<Option<StateId>>;

    /// Incorporate scheduling changes.
    fn update(&mut self, current: Option<StateId>, added: &[StateId], removed: &[StateId]);

    fn is_empty(&self) -> bool;
}

impl<S: Searcher + ?Sized> Searcher for Box<S> {
    fn select_state(&mut self, exec: &mut dyn Executor) -> Flow<Option<StateId>> {
        (**self).select_state(exec)
    }

    fn update(&mut self, current: Option<StateId>, added: &[StateId], removed: &[StateId]) {
        (**self).update(current, added, removed)
    }

    fn is_empty(&self) -> bool {
        (**self).is_empty()
    }
}

/// Depth-first: the most recently added state runs first.
#[derive(Debug, Default)]
pub struct DfsSearcher {
    stack: Vec<StateId>,
}

impl Searcher for DfsSearcher {
    fn select_state(&mut self, _exec: &mut dyn Executor) -> Flow<Option<StateId>> {
        Ok(self.stack.last().copied())
    }

    fn update(&mut self, _current: Option<StateId>, added: &[StateId], removed: &[StateId]) {
        if !removed.is_empty() {
            self.stack.retain(|s| !removed.contains(s));
        }
        for state in added {
            if !self.stack.contains(state) {
                self.stack.push(*state);
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }
}

/// Uniformly random choice among known states.
pub struct RandomSearcher {
    states: Vec<StateId>,
    rng: fastrand::Rng,
}

impl RandomSearcher {
    pub fn new() -> Self {
        Self {
            states: Vec::new(),
            rng: fastrand::Rng::new(),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            states: Vec::new(),
            rng: fastrand::Rng::with_seed(seed),
        }
    }
}

impl Default for RandomSearcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Searcher for RandomSearcher {
    fn select_state(&mut self, _exec: &mut dyn Executor) -> Flow<Option<StateId>> {
        if self.states.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.states[self.rng.usize(..self.states.len())]))
    }

    fn update(&mut self, _current: Option<StateId>, added: &[StateId], removed: &[StateId]) {
        if !removed.is_empty() {
            self.states.retain(|s| !removed.contains(s));
        }
        for state in added {
            if !self.states.contains(state) {
                self.states.push(*state);
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// Searcher that consults the state manager before every selection.
pub struct CoordinatedSearcher<S: Searcher> {
    base: S,
    manager: Rc<RefCell<StateManager>>,
}

impl<S: Searcher> CoordinatedSearcher<S> {
    pub fn new(base: S, manager: Rc<RefCell<StateManager>>) -> Self {
        Self { base, manager }
    }

    pub fn base(&self) -> &S {
        &self.base
    }

    /// Feed pending interpreter changes to the base searcher and tell the
    /// manager about destroyed states.
    fn sync(&mut self, exec: &mut dyn Executor) {
        let updates = exec.take_updates();
        if updates.is_empty() {
            return;
        }

        for state in &updates.terminated {
            self.manager.borrow_mut().on_state_killed(exec, *state);
        }

        // A state may be suspended and resumed between two drains; only its
        // final status matters.
        let added: Vec<StateId> = updates
            .added
            .iter()
            .copied()
            .filter(|s| exec.is_active(*s))
            .collect();
        let removed: BTreeSet<StateId> = updates
            .removed
            .iter()
            .copied()
            .filter(|s| !exec.is_active(*s))
            .collect();
        let removed: Vec<StateId> = removed.into_iter().collect();

        self.base.update(exec.current_state(), &added, &removed);
    }

    fn pick(&mut self, exec: &mut dyn Executor) -> Flow<Option<StateId>> {
        while let Some(state) = self.base.select_state(exec)? {
            if exec.is_active(state) && !self.manager.borrow().is_succeeded(state) {
                return Ok(Some(state));
            }
            debug!("Dropping stale state {} from the searcher", state);
            self.base.update(None, &[], &[state]);
        }
        Ok(None)
    }
}

impl<S: Searcher> Searcher for CoordinatedSearcher<S> {
    fn select_state(&mut self, exec: &mut dyn Executor) -> Flow<Option<StateId>> {
        loop {
            if !signal::should_continue() {
                return Ok(None);
            }

            self.sync(exec);
            let verdict = self.manager.borrow_mut().schedule(exec)?;
            if verdict == Schedule::Exhausted {
                return Ok(None);
            }
            self.sync(exec);

            if let Some(state) = self.pick(exec)? {
                return Ok(Some(state));
            }

            if exec.states_count() > 0 {
                warn!("Searcher lost track of active states, resynchronising");
                let active = exec.states();
                self.base.update(None, &active, &[]);
            }
        }
    }

    fn update(&mut self, current: Option<StateId>, added: &[StateId], removed: &[StateId]) {
        self.base.update(current, added, removed);
    }

    fn is_empty(&self) -> bool {
        self.base.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::config::StateManagerConfig;
    use crate::core::opcodes::OpcodeLayout;
    use crate::core::shared::SharedSegment;
    use crate::core::topology::FleetRegistry;
    use crate::kernel::clock::ManualClock;
    use crate::testing::interpreter::SimulatedInterpreter;
    use crate::testing::program::Program;
    use std::sync::Arc;

    fn single_process() -> (Rc<RefCell<StateManager>>, SimulatedInterpreter) {
        let registry = FleetRegistry::new(1).unwrap();
        registry.register(0).unwrap();
        let config = StateManagerConfig {
            timeout_secs: 0,
            poll_interval_ms: 1,
            max_processes: 1,
            ..Default::default()
        };
        let manager = StateManager::new(
            Arc::new(SharedSegment::new().unwrap()),
            Box::new(registry.topology_for(0)),
            Box::new(ManualClock::new(0)),
            &config,
        );
        let interp =
            SimulatedInterpreter::new(0, Arc::new(Program::idle(OpcodeLayout::X86)));
        (Rc::new(RefCell::new(manager)), interp)
    }

    #[test]
    fn test_dfs_prefers_newest() {
        let (_, mut interp) = single_process();
        let mut dfs = DfsSearcher::default();
        let a = StateId::new(0, 0);
        let b = StateId::new(0, 1);
        dfs.update(None, &[a, b], &[]);
        assert_eq!(dfs.select_state(&mut interp), Ok(Some(b)));
        dfs.update(None, &[], &[b]);
        assert_eq!(dfs.select_state(&mut interp), Ok(Some(a)));
    }

    #[test]
    fn test_random_only_returns_known_states() {
        let (_, mut interp) = single_process();
        let mut random = RandomSearcher::with_seed(7);
        let states: Vec<_> = (0..4).map(|i| StateId::new(0, i)).collect();
        random.update(None, &states, &[]);
        for _ in 0..32 {
            let pick = random.select_state(&mut interp).unwrap().unwrap();
            assert!(states.contains(&pick));
        }
        random.update(None, &[], &states);
        assert!(random.is_empty());
    }

    #[test]
    fn test_coordinated_skips_succeeded_states() {
        let (manager, mut interp) = single_process();
        let a = interp.spawn_state();
        let b = interp.spawn_state();
        let mut searcher = CoordinatedSearcher::new(DfsSearcher::default(), Rc::clone(&manager));

        manager.borrow_mut().succeed_state(&mut interp, b);
        assert_eq!(searcher.select_state(&mut interp), Ok(Some(a)));
    }

    #[test]
    fn test_coordinated_exhausts_empty_worker() {
        let (manager, mut interp) = single_process();
        let mut searcher = CoordinatedSearcher::new(DfsSearcher::default(), manager);
        assert_eq!(searcher.select_state(&mut interp), Ok(None));
    }

    #[test]
    fn test_coordinated_converges_lone_worker() {
        let (manager, mut interp) = single_process();
        let a = interp.spawn_state();
        let b = interp.spawn_state();
        let mut searcher = CoordinatedSearcher::new(DfsSearcher::default(), Rc::clone(&manager));
        manager.borrow_mut().succeed_state(&mut interp, a);
        manager.borrow_mut().succeed_state(&mut interp, b);

        // No active state left: the lone worker elects itself and keeps `a`.
        assert_eq!(searcher.select_state(&mut interp), Ok(Some(a)));
        assert_eq!(manager.borrow().survivor(), Some(a));
        assert!(!interp.is_alive(b));
    }
}
