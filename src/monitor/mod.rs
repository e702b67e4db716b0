// Copyright (c) 2026 Meshsim
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! System monitor (cluster-wide state aggregation) and system controller
//! (command broadcaster), spec.md §4.8.

use std::collections::BTreeMap;

use crate::lifecycle::ParticipantState;
use crate::wire::{CommandKind, ParticipantCommand, SystemCommand};

/// Per-participant status, as published on the wire
/// (`wire::types::ParticipantStatus` carries the same fields serialised).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParticipantStatus {
    /// Current lifecycle state.
    pub state: ParticipantState,
    /// Human-readable reason for the current state.
    pub reason: String,
    /// Nanoseconds since an implementation-defined epoch.
    pub enter_time: i64,
    /// Nanoseconds since an implementation-defined epoch.
    pub refresh_time: i64,
}

/// Position of a state in the main forward sequence used by the
/// weakest-link rule. `Paused` ranks alongside `Running` since it is an
/// orthogonal overlay, not forward progress; `Error`/`Aborting` are handled
/// before ranking is consulted at all.
fn forward_rank(s: ParticipantState) -> Option<u8> {
    use ParticipantState::*;
    Some(match s {
        Invalid => 0,
        ServicesCreated => 1,
        CommunicationInitializing => 2,
        CommunicationInitialized => 3,
        ReadyToRun => 4,
        Running | Paused => 5,
        Stopping => 6,
        Stopped => 7,
        ShuttingDown => 8,
        Shutdown => 9,
        Error | Aborting => return None,
    })
}

fn rank_to_state(rank: u8) -> ParticipantState {
    use ParticipantState::*;
    match rank {
        0 => Invalid,
        1 => ServicesCreated,
        2 => CommunicationInitializing,
        3 => CommunicationInitialized,
        4 => ReadyToRun,
        5 => Running,
        6 => Stopping,
        7 => Stopped,
        8 => ShuttingDown,
        _ => Shutdown,
    }
}

/// Derive the cluster-wide system state from the required-participant
/// status map (spec.md §4.8, §8 invariant 3: pure over the state map).
pub fn system_state(required: &BTreeMap<String, ParticipantStatus>) -> ParticipantState {
    if required.is_empty() {
        return ParticipantState::Invalid;
    }
    if required.values().any(|p| p.state == ParticipantState::Error) {
        return ParticipantState::Error;
    }
    if required.values().any(|p| p.state == ParticipantState::Aborting) {
        return ParticipantState::Aborting;
    }

    let first = required.values().next().unwrap().state;
    if required.values().all(|p| p.state == first) {
        return first;
    }

    let ranks: Vec<u8> = match required.values().map(|p| forward_rank(p.state)).collect::<Option<Vec<_>>>() {
        Some(r) => r,
        None => return ParticipantState::Invalid,
    };
    let min_rank = *ranks.iter().min().unwrap();
    let max_rank = *ranks.iter().max().unwrap();
    if max_rank <= min_rank + 1 {
        rank_to_state(min_rank)
    } else {
        ParticipantState::Invalid
    }
}

/// Aggregates participant status into system state and notifies registered
/// handlers exactly once per change (spec.md §4.8, §8 invariant 4).
pub struct SystemMonitor {
    required: Vec<String>,
    status: BTreeMap<String, ParticipantStatus>,
    system_state: ParticipantState,
    invalid_transition_count: u64,
    system_state_handlers: Vec<Box<dyn FnMut(ParticipantState) + Send>>,
    participant_state_handlers: Vec<Box<dyn FnMut(&str, ParticipantState) + Send>>,
    participant_status_handlers: Vec<Box<dyn FnMut(&str, &ParticipantStatus) + Send>>,
}

impl SystemMonitor {
    /// Construct a monitor with no required participants yet (set via
    /// [`Self::set_required_participants`], which corresponds to the
    /// `WorkflowConfiguration` message).
    pub fn new() -> Self {
        Self {
            required: Vec::new(),
            status: BTreeMap::new(),
            system_state: ParticipantState::Invalid,
            invalid_transition_count: 0,
            system_state_handlers: Vec::new(),
            participant_state_handlers: Vec::new(),
            participant_status_handlers: Vec::new(),
        }
    }

    /// Cache the workflow configuration (the cluster-authoritative required
    /// set) and use it for subsequent `system_state()` computation.
    pub fn set_required_participants(&mut self, names: Vec<String>) {
        self.required = names;
    }

    /// Current required-participant set.
    pub fn required_participants(&self) -> &[String] {
        &self.required
    }

    /// Current cluster-wide system state.
    pub fn system_state(&self) -> ParticipantState {
        self.system_state
    }

    /// Status of a single participant, if known.
    pub fn participant_status(&self, name: &str) -> Option<&ParticipantStatus> {
        self.status.get(name)
    }

    /// Register a handler invoked each time the system state changes.
    pub fn on_system_state_change(&mut self, handler: impl FnMut(ParticipantState) + Send + 'static) {
        self.system_state_handlers.push(Box::new(handler));
    }

    /// Register a handler invoked each time any participant's state
    /// changes.
    pub fn on_participant_state_change(&mut self, handler: impl FnMut(&str, ParticipantState) + Send + 'static) {
        self.participant_state_handlers.push(Box::new(handler));
    }

    /// Register a handler invoked on every received `ParticipantStatus`
    /// (even if the state component is unchanged, e.g. a reason update).
    pub fn on_participant_status(&mut self, handler: impl FnMut(&str, &ParticipantStatus) + Send + 'static) {
        self.participant_status_handlers.push(Box::new(handler));
    }

    /// Apply an incoming `ParticipantStatus` publication.
    ///
    /// Monotonicity (spec.md §3 invariant: non-decreasing `(state,
    /// refreshTime)`) is enforced here: an update whose `refresh_time` does
    /// not advance past the cached one is rejected and counted, mirroring
    /// `InvalidTransition` bookkeeping for malformed status streams.
    pub fn receive_participant_status(&mut self, name: &str, status: ParticipantStatus) {
        if let Some(prev) = self.status.get(name) {
            if status.refresh_time < prev.refresh_time {
                self.invalid_transition_count += 1;
                tracing::warn!(participant = name, "out-of-order participant status dropped");
                return;
            }
        }
        let state_changed = self.status.get(name).map(|p| p.state) != Some(status.state);
        for h in &mut self.participant_status_handlers {
            h(name, &status);
        }
        self.status.insert(name.to_string(), status.clone());
        if state_changed {
            for h in &mut self.participant_state_handlers {
                h(name, status.state);
            }
        }
        self.recompute_system_state();
    }

    fn recompute_system_state(&mut self) {
        let required_status: BTreeMap<String, ParticipantStatus> = self
            .required
            .iter()
            .filter_map(|name| self.status.get(name).map(|s| (name.clone(), s.clone())))
            .collect();
        if required_status.len() != self.required.len() {
            // Not every required participant has reported in yet.
            return;
        }
        let next = system_state(&required_status);
        if next != self.system_state {
            self.system_state = next;
            for h in &mut self.system_state_handlers {
                h(next);
            }
        }
    }

    /// Count of malformed (non-monotonic) status updates observed
    /// (spec.md §7 `InvalidTransition`-style bookkeeping).
    pub fn invalid_transition_count(&self) -> u64 {
        self.invalid_transition_count
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Thin broadcaster issuing cluster-wide or per-participant commands
/// (spec.md §4.8). The actual send is delegated to whatever connection
/// manager handle is supplied at construction, per the "context parameter"
/// design note (spec.md §9) rather than a stored back-pointer.
pub struct SystemController<S> {
    sender: S,
}

/// Object-safe capability the system controller needs from the connection
/// manager: broadcast a control payload to the mesh.
pub trait ControlSender {
    /// Broadcast a `SystemCommand` to every participant.
    fn broadcast_system_command(&mut self, kind: CommandKind);
    /// Send a `ParticipantCommand` to one participant.
    fn send_participant_command(&mut self, target: u64, kind: CommandKind);
}

impl<T: ControlSender + ?Sized> ControlSender for &mut T {
    fn broadcast_system_command(&mut self, kind: CommandKind) {
        (**self).broadcast_system_command(kind);
    }
    fn send_participant_command(&mut self, target: u64, kind: CommandKind) {
        (**self).send_participant_command(target, kind);
    }
}

impl<S: ControlSender> SystemController<S> {
    /// Construct a controller over the given sender.
    pub fn new(sender: S) -> Self {
        Self { sender }
    }

    /// Issue a cluster-wide command.
    pub fn system_command(&mut self, kind: CommandKind) -> SystemCommand {
        self.sender.broadcast_system_command(kind);
        SystemCommand { kind }
    }

    /// Issue a command targeted at one participant.
    pub fn participant_command(&mut self, target: u64, kind: CommandKind) -> ParticipantCommand {
        self.sender.send_participant_command(target, kind);
        ParticipantCommand { target, kind }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(state: ParticipantState, refresh_time: i64) -> ParticipantStatus {
        ParticipantStatus { state, reason: String::new(), enter_time: 0, refresh_time }
    }

    #[test]
    fn pure_function_same_input_same_output() {
        let mut map = BTreeMap::new();
        map.insert("A".to_string(), status(ParticipantState::Running, 1));
        map.insert("B".to_string(), status(ParticipantState::Running, 1));
        assert_eq!(system_state(&map), system_state(&map));
        assert_eq!(system_state(&map), ParticipantState::Running);
    }

    #[test]
    fn error_dominates() {
        let mut map = BTreeMap::new();
        map.insert("A".to_string(), status(ParticipantState::Running, 1));
        map.insert("B".to_string(), status(ParticipantState::Error, 1));
        assert_eq!(system_state(&map), ParticipantState::Error);
    }

    #[test]
    fn weakest_link_when_adjacent() {
        let mut map = BTreeMap::new();
        map.insert("A".to_string(), status(ParticipantState::Running, 1));
        map.insert("B".to_string(), status(ParticipantState::Stopping, 1));
        assert_eq!(system_state(&map), ParticipantState::Running);
    }

    #[test]
    fn non_adjacent_spread_is_invalid() {
        let mut map = BTreeMap::new();
        map.insert("A".to_string(), status(ParticipantState::Invalid, 1));
        map.insert("B".to_string(), status(ParticipantState::Running, 1));
        assert_eq!(system_state(&map), ParticipantState::Invalid);
    }

    #[test]
    fn monitor_fires_system_state_handler_once_per_change() {
        let mut monitor = SystemMonitor::new();
        monitor.set_required_participants(vec!["Unit".to_string()]);
        let fired = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let fired2 = fired.clone();
        monitor.on_system_state_change(move |s| fired2.lock().unwrap().push(s));
        monitor.receive_participant_status("Unit", status(ParticipantState::ServicesCreated, 1));
        monitor.receive_participant_status("Unit", status(ParticipantState::ServicesCreated, 2));
        monitor.receive_participant_status("Unit", status(ParticipantState::Running, 3));
        let events = fired.lock().unwrap();
        assert_eq!(*events, vec![ParticipantState::ServicesCreated, ParticipantState::Running]);
    }

    struct RecordingSender {
        system: Vec<CommandKind>,
        targeted: Vec<(u64, CommandKind)>,
    }
    impl ControlSender for RecordingSender {
        fn broadcast_system_command(&mut self, kind: CommandKind) {
            self.system.push(kind);
        }
        fn send_participant_command(&mut self, target: u64, kind: CommandKind) {
            self.targeted.push((target, kind));
        }
    }

    #[test]
    fn controller_broadcasts_and_targets() {
        let mut ctrl = SystemController::new(RecordingSender { system: vec![], targeted: vec![] });
        ctrl.system_command(CommandKind::Stop);
        ctrl.participant_command(7, CommandKind::Shutdown);
        assert_eq!(ctrl.sender.system, vec![CommandKind::Stop]);
        assert_eq!(ctrl.sender.targeted, vec![(7, CommandKind::Shutdown)]);
    }
}
