/// Convergence proof harness
///
/// Runs whole fleets of simulated workers against one shared segment (one
/// thread per worker slot) and checks the end-to-end guarantees: at most one
/// succeeded state survives, exactly one when any path succeeded, and the
/// shared accounting is back to zero once every worker left.
use crate::config::config::StateManagerConfig;
use crate::config::types::Result;
use crate::core::manager::StateManager;
use crate::core::opcodes::OpcodeLayout;
use crate::core::shared::SharedSegment;
use crate::core::topology::{FleetRegistry, WorkerReport};
use crate::core::types::ProcessId;
use crate::kernel::clock::MonotonicClock;
use crate::testing::interpreter::SimulatedInterpreter;
use crate::testing::program::{PathEnd, Program};
use crate::testing::worker::Worker;
use log::{error, info};
use std::sync::{Arc, Barrier};
use std::thread;

/// One fleet run
#[derive(Debug, Clone)]
pub struct FleetSpec {
    /// Paths explored by each worker, indexed by slot
    pub paths: Vec<Vec<PathEnd>>,
    pub config: StateManagerConfig,
    /// Per-worker dispatch bound, `None` for unbounded
    pub max_steps: Option<u64>,
}

impl FleetSpec {
    pub fn new(paths: Vec<Vec<PathEnd>>, config: StateManagerConfig) -> Self {
        FleetSpec {
            paths,
            config,
            max_steps: Some(100_000),
        }
    }

    pub fn processes(&self) -> usize {
        self.paths.len()
    }

    pub fn expects_success(&self) -> bool {
        self.paths.iter().flatten().any(|p| *p == PathEnd::Succeed)
    }
}

/// What a fleet run left behind
#[derive(Debug, Clone, Default)]
pub struct FleetOutcome {
    pub reports: Vec<(ProcessId, WorkerReport)>,
    /// Slots whose worker panicked
    pub panicked: Vec<ProcessId>,
    /// Fleet-wide success counter after every worker left
    pub leftover_success_count: u64,
    pub leftover_election: Option<ProcessId>,
}

impl FleetOutcome {
    pub fn survivors(&self) -> u64 {
        self.reports.iter().map(|(_, r)| r.survivors).sum()
    }

    pub fn succeeded(&self) -> u64 {
        self.reports.iter().map(|(_, r)| r.succeeded).sum()
    }
}

/// Run one worker per slot on its own thread until the whole fleet is done.
pub fn run_thread_fleet(spec: &FleetSpec) -> Result<FleetOutcome> {
    let processes = spec.processes();
    let shared = Arc::new(SharedSegment::new()?);
    let registry = FleetRegistry::new(processes)?;
    for slot in 0..processes {
        registry.register(slot)?;
    }

    // Every manager attaches before anyone runs, so no slot reset can wipe
    // a command already addressed to it.
    let barrier = Arc::new(Barrier::new(processes));
    let mut handles = Vec::with_capacity(processes);
    for (slot, paths) in spec.paths.iter().enumerate() {
        let shared = Arc::clone(&shared);
        let registry = registry.clone();
        let barrier = Arc::clone(&barrier);
        let config = spec.config.clone();
        let paths = paths.clone();
        let max_steps = spec.max_steps;

        let handle = thread::Builder::new()
            .name(format!("worker-{}", slot))
            .spawn(move || {
                let manager = StateManager::new(
                    shared,
                    Box::new(registry.topology_for(slot)),
                    Box::new(MonotonicClock),
                    &config,
                );
                let layout = OpcodeLayout::for_flavor(config.opcode_layout);
                let program = Arc::new(Program::fan_out(layout, &paths));
                let mut interp = SimulatedInterpreter::new(slot, program);
                interp.spawn_state();

                let mut worker = Worker::new(interp, manager, &config);
                if let Some(max) = max_steps {
                    worker = worker.with_max_steps(max);
                }
                barrier.wait();

                let report = worker.run();
                drop(worker);
                registry.unregister(slot, report);
                report
            })?;
        handles.push((slot, handle));
    }

    let mut outcome = FleetOutcome::default();
    for (slot, handle) in handles {
        match handle.join() {
            Ok(report) => outcome.reports.push((slot, report)),
            Err(_) => {
                error!("Worker {} panicked", slot);
                outcome.panicked.push(slot);
            }
        }
    }

    let guard = shared.acquire();
    outcome.leftover_success_count = guard.total_success_count(processes);
    outcome.leftover_election = guard.keep_one_state_on_node();
    Ok(outcome)
}

/// Convergence proof configuration
#[derive(Debug, Clone)]
pub struct ConvergenceProofConfig {
    pub iterations: usize,
    pub max_processes: usize,
    pub max_paths: usize,
    /// Percentage of paths that signal success
    pub success_percent: u8,
    pub seed: u64,
    pub config: StateManagerConfig,
}

impl Default for ConvergenceProofConfig {
    fn default() -> Self {
        ConvergenceProofConfig {
            iterations: 20,
            max_processes: 4,
            max_paths: 6,
            success_percent: 40,
            seed: 0x5eed,
            config: StateManagerConfig {
                timeout_secs: 0,
                poll_interval_ms: 2,
                timer_interval_ms: 50,
                ..Default::default()
            },
        }
    }
}

/// Convergence proof result
#[derive(Debug, Clone, Default)]
pub struct ConvergenceProofResult {
    pub iterations: usize,
    pub passes: usize,
    pub violations: Vec<String>,
}

impl ConvergenceProofResult {
    pub fn is_pass(&self) -> bool {
        self.violations.is_empty() && self.passes == self.iterations
    }
}

/// Check one fleet outcome against the convergence guarantees.
pub fn verify_outcome(spec: &FleetSpec, outcome: &FleetOutcome) -> Vec<String> {
    let mut violations = Vec::new();

    if !outcome.panicked.is_empty() {
        violations.push(format!("workers panicked: {:?}", outcome.panicked));
    }

    let expected = if spec.expects_success() { 1 } else { 0 };
    if outcome.survivors() != expected {
        violations.push(format!(
            "expected {} surviving state(s), found {}",
            expected,
            outcome.survivors()
        ));
    }

    if outcome.leftover_success_count != 0 {
        violations.push(format!(
            "success counters not released: {}",
            outcome.leftover_success_count
        ));
    }

    if let Some(node) = outcome.leftover_election {
        violations.push(format!("election of node {} never resolved", node));
    }

    violations
}

fn random_fleet(rng: &mut fastrand::Rng, proof: &ConvergenceProofConfig) -> FleetSpec {
    let processes = rng.usize(1..=proof.max_processes);
    let paths = (0..processes)
        .map(|_| {
            let count = rng.usize(1..=proof.max_paths);
            (0..count)
                .map(|_| {
                    if rng.u8(0..100) < proof.success_percent {
                        PathEnd::Succeed
                    } else {
                        PathEnd::Exit
                    }
                })
                .collect()
        })
        .collect();

    let config = StateManagerConfig {
        max_processes: processes,
        ..proof.config.clone()
    };
    FleetSpec::new(paths, config)
}

/// Run randomised fleets and collect every guarantee violation.
pub fn run_convergence_proof(proof: &ConvergenceProofConfig) -> Result<ConvergenceProofResult> {
    let mut rng = fastrand::Rng::with_seed(proof.seed);
    let mut result = ConvergenceProofResult {
        iterations: proof.iterations,
        ..Default::default()
    };

    for iteration in 0..proof.iterations {
        let spec = random_fleet(&mut rng, proof);
        let outcome = run_thread_fleet(&spec)?;
        let violations = verify_outcome(&spec, &outcome);

        if violations.is_empty() {
            result.passes += 1;
        } else {
            for v in violations {
                error!("Iteration {}: {}", iteration, v);
                result
                    .violations
                    .push(format!("iteration {} ({:?}): {}", iteration, spec.paths, v));
            }
        }
    }

    info!(
        "Convergence proof: {}/{} iterations passed",
        result.passes, result.iterations
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_worker_fleet() {
        let spec = FleetSpec::new(
            vec![vec![PathEnd::Succeed, PathEnd::Succeed, PathEnd::Exit]],
            ConvergenceProofConfig::default().config,
        );
        let outcome = run_thread_fleet(&spec).unwrap();
        assert!(verify_outcome(&spec, &outcome).is_empty(), "{:?}", outcome);
        assert_eq!(outcome.succeeded(), 2);
    }

    #[test]
    fn test_verify_flags_double_survivor() {
        let spec = FleetSpec::new(vec![vec![PathEnd::Succeed]], StateManagerConfig::default());
        let outcome = FleetOutcome {
            reports: vec![
                (0, WorkerReport { survivors: 1, ..Default::default() }),
                (1, WorkerReport { survivors: 1, ..Default::default() }),
            ],
            ..Default::default()
        };
        let violations = verify_outcome(&spec, &outcome);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("found 2"));
    }

    #[test]
    fn test_small_proof_passes() {
        let proof = ConvergenceProofConfig {
            iterations: 3,
            max_processes: 3,
            ..Default::default()
        };
        let result = run_convergence_proof(&proof).unwrap();
        assert!(result.is_pass(), "{:?}", result.violations);
    }
}
