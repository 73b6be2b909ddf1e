//! Worker fleet topology.
//!
//! The coordinator only asks four questions about the fleet (who am I, how
//! many of us are alive, how many slots exist, is slot N alive). The
//! [`FleetRegistry`] answers them from its own shared table so the answers
//! stay consistent across `fork()`.

use crate::config::types::{Result, StateManagerError};
use crate::core::shared::MAX_PROCESSES;
use crate::core::types::ProcessId;
use crate::kernel::shm::{ShmSafe, SynchronizedObject};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Process-topology queries supplied by the orchestration layer.
pub trait ProcessTopology {
    fn current_process_id(&self) -> ProcessId;

    /// Live worker processes
    fn current_process_count(&self) -> usize;

    /// Slots that may hold a worker
    fn max_processes(&self) -> usize;

    /// Registration index of a live slot, `None` if nobody lives there
    fn process_index_for_id(&self, id: ProcessId) -> Option<usize>;
}

/// What a worker leaves behind in the fleet table when it exits.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub finished: bool,
    /// States kept alive through a convergence on this worker
    pub survivors: u64,
    pub terminated: u64,
    pub succeeded: u64,
}

#[repr(C)]
struct FleetTable {
    live: [bool; MAX_PROCESSES],
    index: [u32; MAX_PROCESSES],
    next_index: u32,
    reports: [WorkerReport; MAX_PROCESSES],
}

impl Default for FleetTable {
    fn default() -> Self {
        Self {
            live: [false; MAX_PROCESSES],
            index: [0; MAX_PROCESSES],
            next_index: 0,
            reports: [WorkerReport::default(); MAX_PROCESSES],
        }
    }
}

// SAFETY: repr(C), integers and bools only.
unsafe impl ShmSafe for FleetTable {}

/// Shared table of live worker slots.
#[derive(Clone, Debug)]
pub struct FleetRegistry {
    table: Arc<SynchronizedObject<FleetTable>>,
    max_processes: usize,
}

impl FleetRegistry {
    pub fn new(max_processes: usize) -> Result<Self> {
        if max_processes == 0 || max_processes > MAX_PROCESSES {
            return Err(StateManagerError::Topology(format!(
                "max_processes must be in 1..={} (got {})",
                MAX_PROCESSES, max_processes
            )));
        }
        Ok(Self {
            table: Arc::new(SynchronizedObject::new()?),
            max_processes,
        })
    }

    pub fn max_processes(&self) -> usize {
        self.max_processes
    }

    /// Mark a slot live. The slot must be free.
    pub fn register(&self, id: ProcessId) -> Result<()> {
        if id >= self.max_processes {
            return Err(StateManagerError::Topology(format!(
                "process slot {} out of range (max {})",
                id, self.max_processes
            )));
        }
        let mut table = self.table.acquire();
        if table.live[id] {
            return Err(StateManagerError::Topology(format!(
                "process slot {} already live",
                id
            )));
        }
        table.live[id] = true;
        table.index[id] = table.next_index;
        table.next_index += 1;
        table.reports[id] = WorkerReport::default();
        debug!("Registered worker slot {} (index {})", id, table.index[id]);
        Ok(())
    }

    /// Free a slot and store the worker's final report.
    pub fn unregister(&self, id: ProcessId, report: WorkerReport) {
        let mut table = self.table.acquire();
        if id >= self.max_processes || !table.live[id] {
            warn!("Unregistering worker slot {} which is not live", id);
            return;
        }
        table.live[id] = false;
        table.reports[id] = WorkerReport {
            finished: true,
            ..report
        };
        debug!("Unregistered worker slot {}", id);
    }

    pub fn live_count(&self) -> usize {
        let table = self.table.acquire();
        table.live[..self.max_processes].iter().filter(|l| **l).count()
    }

    pub fn is_live(&self, id: ProcessId) -> bool {
        id < self.max_processes && self.table.acquire().live[id]
    }

    pub fn reports(&self) -> Vec<(ProcessId, WorkerReport)> {
        let table = self.table.acquire();
        (0..self.max_processes)
            .filter(|id| table.reports[*id].finished)
            .map(|id| (id, table.reports[id]))
            .collect()
    }

    /// Topology view from the perspective of one worker slot
    pub fn topology_for(&self, id: ProcessId) -> FleetTopology {
        FleetTopology {
            registry: self.clone(),
            process_id: id,
        }
    }
}

/// [`ProcessTopology`] backed by a [`FleetRegistry`].
#[derive(Clone, Debug)]
pub struct FleetTopology {
    registry: FleetRegistry,
    process_id: ProcessId,
}

impl FleetTopology {
    pub fn registry(&self) -> &FleetRegistry {
        &self.registry
    }
}

impl ProcessTopology for FleetTopology {
    fn current_process_id(&self) -> ProcessId {
        self.process_id
    }

    fn current_process_count(&self) -> usize {
        self.registry.live_count()
    }

    fn max_processes(&self) -> usize {
        self.registry.max_processes
    }

    fn process_index_for_id(&self, id: ProcessId) -> Option<usize> {
        if id >= self.registry.max_processes {
            return None;
        }
        let table = self.registry.table.acquire();
        if table.live[id] {
            Some(table.index[id] as usize)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_count() {
        let registry = FleetRegistry::new(4).unwrap();
        registry.register(0).unwrap();
        registry.register(2).unwrap();
        assert_eq!(registry.live_count(), 2);

        let topology = registry.topology_for(2);
        assert_eq!(topology.current_process_id(), 2);
        assert_eq!(topology.current_process_count(), 2);
        assert_eq!(topology.process_index_for_id(2), Some(1));
        assert_eq!(topology.process_index_for_id(1), None);
    }

    #[test]
    fn test_double_register_rejected() {
        let registry = FleetRegistry::new(2).unwrap();
        registry.register(1).unwrap();
        assert!(registry.register(1).is_err());
        assert!(registry.register(2).is_err());
    }

    #[test]
    fn test_unregister_keeps_report() {
        let registry = FleetRegistry::new(2).unwrap();
        registry.register(0).unwrap();
        registry.unregister(
            0,
            WorkerReport {
                survivors: 1,
                ..Default::default()
            },
        );
        assert_eq!(registry.live_count(), 0);
        let reports = registry.reports();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].1.finished);
        assert_eq!(reports[0].1.survivors, 1);
    }

    #[test]
    fn test_zero_slots_rejected() {
        assert!(FleetRegistry::new(0).is_err());
        assert!(FleetRegistry::new(MAX_PROCESSES + 1).is_err());
    }
}
