//! Fixed layout of the shared coordination segment.
//!
//! Every field is only meaningful while the segment lock is held; outside a
//! critical section nothing here is assumed fresh.

use crate::core::types::{Command, CommandKind, ProcessId, NO_PROCESS};
use crate::kernel::shm::{ShmSafe, SynchronizedObject};
use log::error;

/// Compiled number of worker slots.
pub const MAX_PROCESSES: usize = 64;

/// Commands a single mailbox can hold; one per possible sender.
pub const MAILBOX_CAPACITY: usize = MAX_PROCESSES;

/// Returned when a mailbox has no room left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxFull;

/// Bounded FIFO of commands addressed to one worker.
///
/// Any worker may push (under the segment lock), only the owner pops.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Mailbox {
    head: u32,
    len: u32,
    slots: [Command; MAILBOX_CAPACITY],
}

impl Default for Mailbox {
    fn default() -> Self {
        Self {
            head: 0,
            len: 0,
            slots: [Command::default(); MAILBOX_CAPACITY],
        }
    }
}

impl Mailbox {
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn tail(&self) -> Option<Command> {
        if self.len == 0 {
            return None;
        }
        let idx = (self.head as usize + self.len as usize - 1) % MAILBOX_CAPACITY;
        Some(self.slots[idx])
    }

    /// Queue a command; a duplicate of the newest pending command coalesces.
    pub fn push(&mut self, cmd: Command) -> Result<(), MailboxFull> {
        if cmd.kind == CommandKind::Empty {
            return Ok(());
        }
        if self.tail() == Some(cmd) {
            return Ok(());
        }
        if self.len as usize == MAILBOX_CAPACITY {
            return Err(MailboxFull);
        }
        let idx = (self.head as usize + self.len as usize) % MAILBOX_CAPACITY;
        self.slots[idx] = cmd;
        self.len += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Command> {
        if self.len == 0 {
            return None;
        }
        let cmd = self.slots[self.head as usize];
        self.slots[self.head as usize] = Command::default();
        self.head = ((self.head as usize + 1) % MAILBOX_CAPACITY) as u32;
        self.len -= 1;
        Some(cmd)
    }

    pub fn clear(&mut self) {
        *self = Mailbox::default();
    }
}

/// Cross-process coordination state.
#[repr(C)]
pub struct StateManagerShared {
    /// Succeeded states currently held by each process
    pub success_count: [u64; MAX_PROCESSES],
    /// Process parked itself waiting for a global decision
    pub suspended_processes: [bool; MAX_PROCESSES],
    pub commands: [Mailbox; MAX_PROCESSES],
    /// Group-wide idle-timeout reference, in clock milliseconds
    pub time_of_last_new_block: u64,
    keep_one_state_on_node: u32,
    /// Bumped on every election set/clear
    election_epoch: u64,
}

impl Default for StateManagerShared {
    fn default() -> Self {
        Self {
            success_count: [0; MAX_PROCESSES],
            suspended_processes: [false; MAX_PROCESSES],
            commands: [Mailbox::default(); MAX_PROCESSES],
            time_of_last_new_block: 0,
            keep_one_state_on_node: NO_PROCESS,
            election_epoch: 0,
        }
    }
}

// SAFETY: repr(C), arrays of integers, bools and repr(C) commands only.
unsafe impl ShmSafe for StateManagerShared {}

/// The segment every worker maps.
pub type SharedSegment = SynchronizedObject<StateManagerShared>;

impl StateManagerShared {
    /// Process elected to keep its one succeeded state, if an election is in flight
    pub fn keep_one_state_on_node(&self) -> Option<ProcessId> {
        if self.keep_one_state_on_node == NO_PROCESS {
            None
        } else {
            Some(self.keep_one_state_on_node as ProcessId)
        }
    }

    /// Record an election. Re-recording the same node is allowed; replacing a
    /// different node without a clear is a protocol violation.
    pub fn elect(&mut self, node: ProcessId) {
        match self.keep_one_state_on_node() {
            Some(current) if current == node => {}
            Some(current) => {
                error!(
                    "election for node {} while node {} is still elected",
                    node, current
                );
                panic!("two concurrent elections ({} and {})", current, node);
            }
            None => {
                self.keep_one_state_on_node = node as u32;
                self.election_epoch += 1;
            }
        }
    }

    pub fn clear_election(&mut self) {
        if self.keep_one_state_on_node != NO_PROCESS {
            self.keep_one_state_on_node = NO_PROCESS;
            self.election_epoch += 1;
        }
    }

    pub fn election_epoch(&self) -> u64 {
        self.election_epoch
    }

    /// Number of suspended slots among the first `max_processes`.
    ///
    /// Live processes may be scattered across slots, so every slot is scanned.
    pub fn suspended_count(&self, max_processes: usize) -> usize {
        self.suspended_processes[..max_processes.min(MAX_PROCESSES)]
            .iter()
            .filter(|s| **s)
            .count()
    }

    pub fn total_success_count(&self, max_processes: usize) -> u64 {
        self.success_count[..max_processes.min(MAX_PROCESSES)]
            .iter()
            .sum()
    }

    /// Fresh slot for a newly started process
    pub fn reset_slot(&mut self, process: ProcessId, success_count: u64) {
        self.success_count[process] = success_count;
        self.commands[process].clear();
        self.suspended_processes[process] = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mailbox_fifo_order() {
        let mut mailbox = Mailbox::default();
        mailbox.push(Command::kill(Some(1))).unwrap();
        mailbox.push(Command::kill(None)).unwrap();
        assert_eq!(mailbox.len(), 2);
        assert_eq!(mailbox.pop(), Some(Command::kill(Some(1))));
        assert_eq!(mailbox.pop(), Some(Command::kill(None)));
        assert_eq!(mailbox.pop(), None);
    }

    #[test]
    fn test_mailbox_coalesces_duplicate_tail() {
        let mut mailbox = Mailbox::default();
        mailbox.push(Command::kill(Some(2))).unwrap();
        mailbox.push(Command::kill(Some(2))).unwrap();
        assert_eq!(mailbox.len(), 1);
    }

    #[test]
    fn test_mailbox_reports_full() {
        let mut mailbox = Mailbox::default();
        for i in 0..MAILBOX_CAPACITY {
            // Alternate so nothing coalesces.
            let keep = if i % 2 == 0 { None } else { Some(i) };
            mailbox.push(Command::kill(keep)).unwrap();
        }
        assert_eq!(mailbox.push(Command::kill(Some(9999))), Err(MailboxFull));
        mailbox.pop();
        assert!(mailbox.push(Command::kill(Some(9999))).is_ok());
    }

    #[test]
    fn test_mailbox_wraps_around() {
        let mut mailbox = Mailbox::default();
        for round in 0..(MAILBOX_CAPACITY * 3) {
            mailbox.push(Command::kill(Some(round))).unwrap();
            assert_eq!(mailbox.pop(), Some(Command::kill(Some(round))));
        }
        assert!(mailbox.is_empty());
    }

    #[test]
    fn test_election_same_node_is_idempotent() {
        let mut shared = StateManagerShared::default();
        shared.elect(3);
        shared.elect(3);
        assert_eq!(shared.keep_one_state_on_node(), Some(3));
        assert_eq!(shared.election_epoch(), 1);
        shared.clear_election();
        assert_eq!(shared.keep_one_state_on_node(), None);
        shared.elect(1);
        assert_eq!(shared.election_epoch(), 3);
    }

    #[test]
    #[should_panic(expected = "two concurrent elections")]
    fn test_election_of_different_node_panics() {
        let mut shared = StateManagerShared::default();
        shared.elect(0);
        shared.elect(1);
    }

    #[test]
    fn test_suspended_count_respects_bound() {
        let mut shared = StateManagerShared::default();
        shared.suspended_processes[0] = true;
        shared.suspended_processes[5] = true;
        assert_eq!(shared.suspended_count(4), 1);
        assert_eq!(shared.suspended_count(8), 2);
    }
}
