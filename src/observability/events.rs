/// Structured coordination events
///
/// Every protocol milestone (succeed, election, kill broadcast, suspension,
/// timeout) is emitted as one JSON line through `log` under the
/// `statemgr::events` target, correlated by campaign id and process slot.
use crate::core::types::{ProcessId, StateId};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::SystemTime;
use uuid::Uuid;

pub const EVENT_TARGET: &str = "statemgr::events";

static CAMPAIGN_ID: OnceLock<String> = OnceLock::new();

/// Campaign id shared by every worker forked from the same driver.
///
/// Must be called before forking so children inherit the same value.
pub fn campaign_id() -> &'static str {
    CAMPAIGN_ID.get_or_init(|| Uuid::new_v4().to_string())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CoordinationEventType {
    StateSucceeded,
    StateResumed,
    ElectionStarted,
    ElectionResolved,
    KillBroadcast,
    ProcessSuspended,
    ProcessResumed,
    TimeoutFired,
    InvariantViolation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationEvent {
    pub event_type: CoordinationEventType,
    pub timestamp: SystemTime,
    pub campaign_id: String,
    pub process_id: ProcessId,
    pub state_id: Option<StateId>,
    /// Elected or targeted process, when relevant
    pub peer: Option<ProcessId>,
    pub details: String,
}

impl CoordinationEvent {
    pub fn new(event_type: CoordinationEventType, process_id: ProcessId, details: String) -> Self {
        Self {
            event_type,
            timestamp: SystemTime::now(),
            campaign_id: campaign_id().to_string(),
            process_id,
            state_id: None,
            peer: None,
            details,
        }
    }

    pub fn with_state(mut self, state: StateId) -> Self {
        self.state_id = Some(state);
        self
    }

    pub fn with_peer(mut self, peer: ProcessId) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn emit(&self) {
        match serde_json::to_string(self) {
            Ok(line) => info!(target: EVENT_TARGET, "{}", line),
            Err(e) => warn!(target: EVENT_TARGET, "unserialisable event {:?}: {}", self.event_type, e),
        }
    }
}

pub mod emit {
    use super::*;

    pub fn state_succeeded(process: ProcessId, state: StateId) {
        CoordinationEvent::new(CoordinationEventType::StateSucceeded, process, String::new())
            .with_state(state)
            .emit();
    }

    pub fn state_resumed(process: ProcessId, state: StateId) {
        CoordinationEvent::new(CoordinationEventType::StateResumed, process, String::new())
            .with_state(state)
            .emit();
    }

    pub fn election_started(process: ProcessId, elected: ProcessId) {
        CoordinationEvent::new(
            CoordinationEventType::ElectionStarted,
            process,
            "keeping one successful state".to_string(),
        )
        .with_peer(elected)
        .emit();
    }

    pub fn election_resolved(process: ProcessId, kept: Option<StateId>) {
        let mut event = CoordinationEvent::new(
            CoordinationEventType::ElectionResolved,
            process,
            String::new(),
        );
        if let Some(state) = kept {
            event = event.with_state(state);
        }
        event.emit();
    }

    pub fn kill_broadcast(process: ProcessId, keep_on: Option<ProcessId>, recipients: usize) {
        let mut event = CoordinationEvent::new(
            CoordinationEventType::KillBroadcast,
            process,
            format!("recipients={}", recipients),
        );
        if let Some(node) = keep_on {
            event = event.with_peer(node);
        }
        event.emit();
    }

    pub fn process_suspended(process: ProcessId) {
        CoordinationEvent::new(CoordinationEventType::ProcessSuspended, process, String::new()).emit();
    }

    pub fn process_resumed(process: ProcessId, reason: &str) {
        CoordinationEvent::new(
            CoordinationEventType::ProcessResumed,
            process,
            reason.to_string(),
        )
        .emit();
    }

    pub fn timeout_fired(process: ProcessId, idle_ms: u64) {
        CoordinationEvent::new(
            CoordinationEventType::TimeoutFired,
            process,
            format!("idle_ms={}", idle_ms),
        )
        .emit();
    }

    pub fn invariant_violation(process: ProcessId, details: String) {
        CoordinationEvent::new(CoordinationEventType::InvariantViolation, process, details).emit();
    }
}
