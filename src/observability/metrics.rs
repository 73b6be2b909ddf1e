// Coordinator counters
//
// Per-process counts of lifecycle actions. Read by the worker report and the
// CLI summary; never shared across processes.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter metric (monotonically increasing)
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge metric (can go up or down)
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
    pub states_succeeded: Counter,
    pub states_resumed: Counter,
    pub states_terminated: Counter,
    pub states_kept: Counter,
    pub kill_commands_sent: Counter,
    pub kill_commands_received: Counter,
    pub elections: Counter,
    pub suspensions: Counter,
    pub timeouts: Counter,
    pub succeeded_set_size: Gauge,
}

/// Point-in-time copy of [`CoordinatorMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub states_succeeded: u64,
    pub states_resumed: u64,
    pub states_terminated: u64,
    pub states_kept: u64,
    pub kill_commands_sent: u64,
    pub kill_commands_received: u64,
    pub elections: u64,
    pub suspensions: u64,
    pub timeouts: u64,
    pub succeeded_set_size: u64,
}

impl CoordinatorMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            states_succeeded: self.states_succeeded.get(),
            states_resumed: self.states_resumed.get(),
            states_terminated: self.states_terminated.get(),
            states_kept: self.states_kept.get(),
            kill_commands_sent: self.kill_commands_sent.get(),
            kill_commands_received: self.kill_commands_received.get(),
            elections: self.elections.get(),
            suspensions: self.suspensions.get(),
            timeouts: self.timeouts.get(),
            succeeded_set_size: self.succeeded_set_size.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = CoordinatorMetrics::default();
        metrics.states_succeeded.inc();
        metrics.states_succeeded.inc();
        metrics.kill_commands_sent.add(3);
        metrics.succeeded_set_size.set(2);

        let snap = metrics.snapshot();
        assert_eq!(snap.states_succeeded, 2);
        assert_eq!(snap.kill_commands_sent, 3);
        assert_eq!(snap.succeeded_set_size, 2);
        assert_eq!(snap.timeouts, 0);
    }
}
