//! Multi-process campaign driver.
//!
//! The calling process becomes worker slot 0, explores the guest program up
//! to its first symbolic branch and then forks one worker process per extra
//! slot. States are dealt out round-robin by local id. Every worker runs to
//! completion, stores its report in the fleet registry and exits; slot 0
//! reaps the children afterwards.

use crate::config::config::StateManagerConfig;
use crate::config::types::{Result, StateManagerError};
use crate::core::manager::StateManager;
use crate::core::opcodes::OpcodeLayout;
use crate::core::shared::SharedSegment;
use crate::core::topology::{FleetRegistry, WorkerReport};
use crate::core::types::{ProcessId, StateId};
use crate::kernel::clock::MonotonicClock;
use crate::observability::events;
use crate::testing::interpreter::SimulatedInterpreter;
use crate::testing::program::{PathEnd, Program};
use crate::testing::worker::{ForkSide, Worker};
use log::{debug, error, info, warn};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct CampaignSpec {
    pub workers: usize,
    pub paths: Vec<PathEnd>,
    pub config: StateManagerConfig,
    pub max_steps: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CampaignOutcome {
    pub campaign_id: String,
    pub reports: Vec<(ProcessId, WorkerReport)>,
    /// Slots whose process died abnormally
    pub failed_workers: Vec<ProcessId>,
    pub leftover_success_count: u64,
}

impl CampaignOutcome {
    pub fn survivors(&self) -> u64 {
        self.reports.iter().map(|(_, r)| r.survivors).sum()
    }

    pub fn succeeded(&self) -> u64 {
        self.reports.iter().map(|(_, r)| r.succeeded).sum()
    }

    pub fn is_clean(&self) -> bool {
        self.failed_workers.is_empty() && self.leftover_success_count == 0
    }

    /// Exactly one survivor if anything succeeded, none otherwise.
    pub fn is_converged(&self) -> bool {
        let expected = if self.succeeded() > 0 { 1 } else { 0 };
        self.survivors() == expected
    }
}

fn slot_of(state: StateId, workers: usize) -> ProcessId {
    state.local() as usize % workers
}

/// Body of a forked worker. Never returns into the caller's stack.
fn run_child(registry: &FleetRegistry, slot: ProcessId, mut worker: Worker) -> ! {
    let outcome = panic::catch_unwind(AssertUnwindSafe(move || {
        let report = worker.run();
        drop(worker);
        report
    }));

    let code = match outcome {
        Ok(report) => {
            registry.unregister(slot, report);
            0
        }
        Err(_) => {
            error!("Worker {} panicked", slot);
            registry.unregister(slot, WorkerReport::default());
            101
        }
    };
    log::logger().flush();
    // SAFETY: _exit ends the forked child at once. The parent's copy of the
    // stack, atexit handlers and stdio buffers must not run a second time
    // here, and the report is already in the shared registry.
    unsafe { libc::_exit(code) }
}

/// Run a campaign with real worker processes.
pub fn run_campaign(spec: &CampaignSpec) -> Result<CampaignOutcome> {
    if spec.workers == 0 {
        return Err(StateManagerError::Config(
            "campaign needs at least one worker".to_string(),
        ));
    }

    // Resolve before forking so every worker logs the same id.
    let campaign_id = events::campaign_id().to_string();
    info!(
        "Campaign {} starting: {} workers, {} paths",
        campaign_id,
        spec.workers,
        spec.paths.len()
    );

    let shared = Arc::new(SharedSegment::new()?);
    let registry = FleetRegistry::new(spec.workers)?;
    for slot in 0..spec.workers {
        registry.register(slot)?;
    }

    let manager = StateManager::new(
        Arc::clone(&shared),
        Box::new(registry.topology_for(0)),
        Box::new(MonotonicClock),
        &spec.config,
    );
    let layout = OpcodeLayout::for_flavor(spec.config.opcode_layout);
    let program = Arc::new(Program::fan_out(layout, &spec.paths));
    let mut interp = SimulatedInterpreter::new(0, program);
    interp.spawn_state();

    let mut worker = Worker::new(interp, manager, &spec.config);
    if let Some(max) = spec.max_steps {
        worker = worker.with_max_steps(max);
    }
    worker.explore_until(spec.workers);

    let workers = spec.workers;
    let mut children: Vec<(ProcessId, Pid)> = Vec::new();
    for slot in 1..workers {
        match worker.fork_into(&registry, slot, |s| slot_of(s, workers) == slot) {
            Ok(ForkSide::Child) => run_child(&registry, slot, worker),
            Ok(ForkSide::Parent(pid)) => children.push((slot, pid)),
            Err(e) => {
                error!("Could not start worker slot {}: {}", slot, e);
                registry.unregister(slot, WorkerReport::default());
            }
        }
    }
    worker.retain_states(|s| slot_of(s, workers) == 0);

    let report = worker.run();
    drop(worker);
    registry.unregister(0, report);

    let mut outcome = CampaignOutcome {
        campaign_id,
        ..Default::default()
    };
    for (slot, pid) in children {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, 0)) => debug!("Worker {} (pid {}) exited", slot, pid),
            Ok(status) => {
                warn!("Worker {} (pid {}) ended abnormally: {:?}", slot, pid, status);
                outcome.failed_workers.push(slot);
            }
            Err(e) => {
                warn!("waitpid for worker {} failed: {}", slot, e);
                outcome.failed_workers.push(slot);
            }
        }
    }

    outcome.reports = registry.reports();
    outcome.leftover_success_count = shared.acquire().total_success_count(workers);
    info!(
        "Campaign {} done: {} succeeded, {} survivor(s)",
        outcome.campaign_id,
        outcome.succeeded(),
        outcome.survivors()
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(reports: &[(u64, u64)]) -> CampaignOutcome {
        CampaignOutcome {
            campaign_id: "c".to_string(),
            reports: reports
                .iter()
                .enumerate()
                .map(|(slot, (succeeded, survivors))| {
                    (
                        slot,
                        WorkerReport {
                            finished: true,
                            survivors: *survivors,
                            terminated: 0,
                            succeeded: *succeeded,
                        },
                    )
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_convergence_needs_exactly_one_survivor() {
        assert!(outcome(&[(2, 0), (1, 1)]).is_converged());
        assert!(outcome(&[(0, 0), (0, 0)]).is_converged());
        // Successes that nobody kept.
        assert!(!outcome(&[(2, 0), (6, 0)]).is_converged());
        assert!(!outcome(&[(1, 1), (1, 1)]).is_converged());
        assert!(!outcome(&[(0, 1)]).is_converged());
    }

    #[test]
    fn test_states_are_dealt_round_robin() {
        assert_eq!(slot_of(StateId::new(0, 5), 4), 1);
        assert_eq!(slot_of(StateId::new(0, 8), 4), 0);
        assert_eq!(slot_of(StateId::new(0, 3), 1), 0);
    }
}
