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

//! The per-participant lifecycle state graph (spec.md §4.7).

use thiserror::Error;

/// A participant's lifecycle state. Ordering follows the "forward" edges
/// of the state graph, used by the system monitor's weakest-link rule
/// (`monitor::system_state`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParticipantState {
    /// Not yet started.
    Invalid,
    /// `StartLifecycle` called; services are being created.
    ServicesCreated,
    /// Announcements sent; waiting on peer handshakes.
    CommunicationInitializing,
    /// All peers connected.
    CommunicationInitialized,
    /// `CommunicationReadyHandler` completed.
    ReadyToRun,
    /// Executing.
    Running,
    /// Suspended via `Pause`.
    Paused,
    /// `Stop` received/issued; draining.
    Stopping,
    /// Drained.
    Stopped,
    /// `Shutdown` received/issued; tearing down.
    ShuttingDown,
    /// Terminal: process may exit.
    Shutdown,
    /// Terminal (unless `Restart`ed): a user handler threw or `Error` was
    /// reported.
    Error,
    /// Transient on the way to `Shutdown` via `AbortSimulation`.
    Aborting,
}

impl ParticipantState {
    /// `true` for states from which the lifecycle future will never resume
    /// (`Shutdown`, or `Error` unless a `Restart` command arrives).
    pub fn is_terminal(self) -> bool {
        matches!(self, ParticipantState::Shutdown | ParticipantState::Error)
    }

    /// Wire tag for `ParticipantStatus::state`.
    pub fn to_wire(self) -> u8 {
        self as u8
    }
}

impl std::fmt::Display for ParticipantState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ParticipantState::Invalid => "Invalid",
            ParticipantState::ServicesCreated => "ServicesCreated",
            ParticipantState::CommunicationInitializing => "CommunicationInitializing",
            ParticipantState::CommunicationInitialized => "CommunicationInitialized",
            ParticipantState::ReadyToRun => "ReadyToRun",
            ParticipantState::Running => "Running",
            ParticipantState::Paused => "Paused",
            ParticipantState::Stopping => "Stopping",
            ParticipantState::Stopped => "Stopped",
            ParticipantState::ShuttingDown => "ShuttingDown",
            ParticipantState::Shutdown => "Shutdown",
            ParticipantState::Error => "Error",
            ParticipantState::Aborting => "Aborting",
        };
        f.write_str(s)
    }
}

/// Lifecycle inputs: user calls, system commands, and internal completion
/// signals (spec.md §4.7).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// `StartLifecycle`: Invalid -> ServicesCreated.
    Start,
    /// Announcements sent: ServicesCreated -> CommunicationInitializing.
    AnnouncementsSent,
    /// All peers connected: CommunicationInitializing -> CommunicationInitialized.
    AllPeersConnected,
    /// `CommunicationReadyHandler` (sync return, or async `Complete()`) done:
    /// CommunicationInitialized -> ReadyToRun.
    CommReadyDone,
    /// `Run`: ReadyToRun -> Running.
    Run,
    /// `Pause(reason)`: Running -> Paused.
    Pause,
    /// `Continue`: Paused -> Running.
    Continue,
    /// `Stop`: Running/Paused -> Stopping.
    Stop,
    /// Internal: send queues flushed, stop handler done: Stopping -> Stopped.
    StopHandlerDone,
    /// Uncoordinated stop: Stopped -> ShuttingDown (self-commanded, no
    /// `Shutdown` cluster command needed).
    UncoordinatedShutdown,
    /// `Shutdown`: Stopped/Error -> ShuttingDown.
    Shutdown,
    /// Internal: shutdown handler done: ShuttingDown -> Shutdown.
    ShutdownHandlerDone,
    /// `Restart`: Stopped/Error -> ServicesCreated.
    Restart,
    /// `AbortSimulation`: any non-terminal -> Aborting.
    AbortSimulation,
    /// Internal: abort teardown done: Aborting -> Shutdown.
    AbortHandlerDone,
    /// `Error(reason)`: any non-terminal -> Error.
    Error,
}

/// An input was not a valid edge of the state graph from the current
/// state. Logged and counted; state is unchanged (spec.md §4.7, §7).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("invalid transition: {transition:?} not allowed from {from}")]
pub struct InvalidTransition {
    /// State the participant was in when the input arrived.
    pub from: ParticipantState,
    /// The rejected input.
    pub transition: Transition,
}

/// Apply `transition` to `from`, returning the next state or
/// `InvalidTransition` if the input is not one of the graph's edges.
pub fn apply(from: ParticipantState, transition: Transition) -> Result<ParticipantState, InvalidTransition> {
    use ParticipantState::*;
    use Transition::*;

    let next = match (from, transition) {
        (Invalid, Start) => ServicesCreated,
        (ServicesCreated, AnnouncementsSent) => CommunicationInitializing,
        (CommunicationInitializing, AllPeersConnected) => CommunicationInitialized,
        (CommunicationInitialized, CommReadyDone) => ReadyToRun,
        (ReadyToRun, Run) => Running,
        (Running, Pause) => Paused,
        (Paused, Continue) => Running,
        (Running, Stop) | (Paused, Stop) => Stopping,
        (Stopping, StopHandlerDone) => Stopped,
        (Stopped, UncoordinatedShutdown) => ShuttingDown,
        (Stopped, Shutdown) | (Error, Shutdown) => ShuttingDown,
        (ShuttingDown, ShutdownHandlerDone) => Shutdown,
        (Stopped, Restart) | (Error, Restart) => ServicesCreated,
        (state, AbortSimulation) if !state.is_terminal() => Aborting,
        (Aborting, AbortHandlerDone) => Shutdown,
        (state, Error) if !state.is_terminal() => ParticipantState::Error,
        (from, transition) => return Err(InvalidTransition { from, transition }),
    };
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ParticipantState::*;
    use Transition::*;

    #[test]
    fn coordinated_run_path_matches_scenario_one() {
        let path = [
            (Invalid, Start, ServicesCreated),
            (ServicesCreated, AnnouncementsSent, CommunicationInitializing),
            (CommunicationInitializing, AllPeersConnected, CommunicationInitialized),
            (CommunicationInitialized, CommReadyDone, ReadyToRun),
            (ReadyToRun, Run, Running),
            (Running, Stop, Stopping),
            (Stopping, StopHandlerDone, Stopped),
            (Stopped, Shutdown, ShuttingDown),
            (ShuttingDown, ShutdownHandlerDone, Shutdown),
        ];
        for (from, t, expected) in path {
            assert_eq!(apply(from, t).unwrap(), expected);
        }
    }

    #[test]
    fn pause_continue_cycle() {
        assert_eq!(apply(Running, Pause).unwrap(), Paused);
        assert_eq!(apply(Paused, Continue).unwrap(), Running);
    }

    #[test]
    fn abort_from_any_nonterminal_state() {
        for state in [ServicesCreated, CommunicationInitializing, Running, Paused, Stopping] {
            assert_eq!(apply(state, AbortSimulation).unwrap(), Aborting);
        }
        assert_eq!(apply(Aborting, AbortHandlerDone).unwrap(), Shutdown);
    }

    #[test]
    fn invalid_transition_is_rejected_without_state_change() {
        let err = apply(ServicesCreated, Run).unwrap_err();
        assert_eq!(err.from, ServicesCreated);
        assert_eq!(err.transition, Run);
    }

    #[test]
    fn error_unreachable_from_terminal_states() {
        assert!(apply(Shutdown, Error).is_err());
        assert!(apply(ParticipantState::Error, Error).is_err());
    }

    #[test]
    fn restart_returns_to_services_created() {
        assert_eq!(apply(Stopped, Restart).unwrap(), ServicesCreated);
        assert_eq!(apply(ParticipantState::Error, Restart).unwrap(), ServicesCreated);
    }
}
