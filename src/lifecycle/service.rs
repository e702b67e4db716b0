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

//! Drives one participant's [`ParticipantState`] from user calls, cluster
//! commands, and handler completions.

use std::panic::AssertUnwindSafe;

use thiserror::Error;
use tokio::sync::oneshot;

use super::state::{self, InvalidTransition, ParticipantState, Transition};

/// A user handler threw, or an illegal transition was attempted while
/// applying a command.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The requested command was not a valid edge from the current state.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    /// A synchronous user handler panicked. The lifecycle moves to `Error`.
    #[error("user lifecycle handler panicked")]
    HandlerPanicked,
}

/// Signalled by an asynchronous `CommunicationReadyHandler` once its
/// helper-thread work is done.
pub struct CompleteHandle(oneshot::Sender<()>);

impl CompleteHandle {
    /// Resolve the wait started by [`LifecycleService::wait_comm_ready`].
    pub fn complete(self) {
        let _ = self.0.send(());
    }
}

/// The two `CommunicationReadyHandler` variants (spec.md §4.7).
pub enum CommReadyHandlerKind {
    /// Completion is implicit in the closure returning.
    Sync(Box<dyn FnMut() + Send>),
    /// Runs on a dedicated helper thread; must call
    /// [`CompleteHandle::complete`] when done. The lifecycle stays in
    /// `CommunicationInitialized` until then.
    Async(Box<dyn FnOnce(CompleteHandle) + Send>),
}

/// User-supplied lifecycle handlers.
#[derive(Default)]
pub struct Handlers {
    /// Runs on the ReadyToRun -> Running transition.
    pub starting: Option<Box<dyn FnMut() + Send>>,
    /// Runs on the Stopping -> Stopped transition.
    pub stop: Option<Box<dyn FnMut() + Send>>,
    /// Runs on the ShuttingDown -> Shutdown transition (also used for the
    /// Aborting -> Shutdown teardown).
    pub shutdown: Option<Box<dyn FnMut() + Send>>,
    /// Runs on the CommunicationInitialized -> ReadyToRun transition.
    pub comm_ready: Option<CommReadyHandlerKind>,
}

/// Owns one participant's lifecycle state, handler set, and final-state
/// future.
pub struct LifecycleService {
    participant_name: String,
    state: ParticipantState,
    invalid_transition_count: u64,
    coordinated_start: bool,
    coordinated_stop: bool,
    handlers: Handlers,
    comm_ready_helper: Option<std::thread::JoinHandle<()>>,
    pending_comm_ready: Option<oneshot::Receiver<()>>,
    final_state_tx: Option<oneshot::Sender<ParticipantState>>,
}

impl LifecycleService {
    /// Construct a lifecycle in the `Invalid` state. Returns the service
    /// plus a receiver that resolves exactly once, to the terminal state
    /// (`Shutdown` or `Error`) the lifecycle future ends in.
    pub fn new(
        participant_name: impl Into<String>,
        coordinated_start: bool,
        coordinated_stop: bool,
        handlers: Handlers,
    ) -> (Self, oneshot::Receiver<ParticipantState>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                participant_name: participant_name.into(),
                state: ParticipantState::Invalid,
                invalid_transition_count: 0,
                coordinated_start,
                coordinated_stop,
                handlers,
                comm_ready_helper: None,
                pending_comm_ready: None,
                final_state_tx: Some(tx),
            },
            rx,
        )
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ParticipantState {
        self.state
    }

    /// Count of rejected (invalid) transition attempts (spec.md §7).
    pub fn invalid_transition_count(&self) -> u64 {
        self.invalid_transition_count
    }

    fn transition(&mut self, t: Transition) -> Result<ParticipantState, InvalidTransition> {
        match state::apply(self.state, t) {
            Ok(next) => {
                tracing::debug!(
                    participant = %self.participant_name,
                    from = %self.state,
                    to = %next,
                    "lifecycle transition"
                );
                self.state = next;
                Ok(next)
            }
            Err(e) => {
                self.invalid_transition_count += 1;
                tracing::warn!(participant = %self.participant_name, %e, "invalid lifecycle transition");
                Err(e)
            }
        }
    }

    fn resolve_final(&mut self, state: ParticipantState) {
        if let Some(tx) = self.final_state_tx.take() {
            let _ = tx.send(state);
        }
    }

    fn invoke(&mut self, f: &mut dyn FnMut()) -> Result<(), LifecycleError> {
        if std::panic::catch_unwind(AssertUnwindSafe(|| f())).is_err() {
            tracing::warn!(participant = %self.participant_name, "lifecycle handler panicked");
            let _ = self.transition(Transition::Error);
            self.resolve_final(ParticipantState::Error);
            return Err(LifecycleError::HandlerPanicked);
        }
        Ok(())
    }

    /// `StartLifecycle`: Invalid -> ServicesCreated.
    pub fn start(&mut self) -> Result<ParticipantState, InvalidTransition> {
        self.transition(Transition::Start)
    }

    /// Connection manager reports its announcements were sent:
    /// ServicesCreated -> CommunicationInitializing.
    pub fn announcements_sent(&mut self) -> Result<ParticipantState, InvalidTransition> {
        self.transition(Transition::AnnouncementsSent)
    }

    /// Connection manager reports every peer link is up:
    /// CommunicationInitializing -> CommunicationInitialized, then runs the
    /// `CommunicationReadyHandler`.
    ///
    /// For a synchronous handler (or none registered) this resolves
    /// immediately, including the self-commanded `Run` when
    /// `coordinated_start` is unset. For an asynchronous handler, call
    /// [`Self::wait_comm_ready`] afterwards to await its completion.
    pub fn all_peers_connected(&mut self) -> Result<ParticipantState, LifecycleError> {
        self.transition(Transition::AllPeersConnected)?;
        match self.handlers.comm_ready.take() {
            Some(CommReadyHandlerKind::Sync(mut f)) => {
                self.invoke(&mut *f)?;
                self.transition(Transition::CommReadyDone)?;
                self.maybe_self_run()
            }
            Some(CommReadyHandlerKind::Async(f)) => {
                let (tx, rx) = oneshot::channel();
                self.pending_comm_ready = Some(rx);
                self.comm_ready_helper = Some(std::thread::spawn(move || {
                    f(CompleteHandle(tx));
                }));
                Ok(self.state)
            }
            None => {
                self.transition(Transition::CommReadyDone)?;
                self.maybe_self_run()
            }
        }
    }

    /// Await an asynchronous `CommunicationReadyHandler`'s completion
    /// signal, then complete the CommunicationInitialized -> ReadyToRun
    /// transition. A no-op (returns the current state immediately) if no
    /// async handler is pending.
    pub async fn wait_comm_ready(&mut self) -> Result<ParticipantState, LifecycleError> {
        if let Some(rx) = self.pending_comm_ready.take() {
            let _ = rx.await;
            if let Some(h) = self.comm_ready_helper.take() {
                let _ = h.join();
            }
            self.transition(Transition::CommReadyDone)?;
            self.maybe_self_run()
        } else {
            Ok(self.state)
        }
    }

    fn maybe_self_run(&mut self) -> Result<ParticipantState, LifecycleError> {
        if !self.coordinated_start {
            self.run()
        } else {
            Ok(self.state)
        }
    }

    /// `Run`: ReadyToRun -> Running.
    pub fn run(&mut self) -> Result<ParticipantState, LifecycleError> {
        let next = self.transition(Transition::Run)?;
        if let Some(mut f) = self.handlers.starting.take() {
            self.invoke(&mut *f)?;
        }
        Ok(next)
    }

    /// `Pause(reason)`: Running -> Paused.
    pub fn pause(&mut self) -> Result<ParticipantState, InvalidTransition> {
        self.transition(Transition::Pause)
    }

    /// `Continue`: Paused -> Running.
    pub fn continue_(&mut self) -> Result<ParticipantState, InvalidTransition> {
        self.transition(Transition::Continue)
    }

    /// `Stop`: Running/Paused -> Stopping -> Stopped. If `coordinated_stop`
    /// is unset, immediately self-commands the ShuttingDown/Shutdown
    /// sequence rather than waiting for an explicit `Shutdown` command.
    pub fn stop(&mut self) -> Result<ParticipantState, LifecycleError> {
        self.transition(Transition::Stop)?;
        if let Some(mut f) = self.handlers.stop.take() {
            self.invoke(&mut *f)?;
        }
        let next = self.transition(Transition::StopHandlerDone)?;
        if !self.coordinated_stop {
            self.transition(Transition::UncoordinatedShutdown)?;
            self.teardown(Transition::ShutdownHandlerDone)
        } else {
            Ok(next)
        }
    }

    /// `Shutdown`: Stopped/Error -> ShuttingDown -> Shutdown.
    pub fn shutdown(&mut self) -> Result<ParticipantState, LifecycleError> {
        self.transition(Transition::Shutdown)?;
        self.teardown(Transition::ShutdownHandlerDone)
    }

    /// `Restart`: Stopped/Error -> ServicesCreated.
    pub fn restart(&mut self) -> Result<ParticipantState, InvalidTransition> {
        self.invalid_transition_count = 0;
        self.transition(Transition::Restart)
    }

    /// `AbortSimulation`: any non-terminal -> Aborting -> Shutdown. The
    /// cluster-wide error funnel (spec.md §7): once issued, local errors
    /// elsewhere are suppressed in favour of this orderly teardown.
    pub fn abort(&mut self) -> Result<ParticipantState, LifecycleError> {
        self.transition(Transition::AbortSimulation)?;
        self.teardown(Transition::AbortHandlerDone)
    }

    /// `Error(reason)`: any non-terminal -> Error. Resolves the final-state
    /// future to `Error`.
    pub fn report_error(&mut self) -> Result<ParticipantState, InvalidTransition> {
        let next = self.transition(Transition::Error)?;
        self.resolve_final(ParticipantState::Error);
        Ok(next)
    }

    fn teardown(&mut self, done: Transition) -> Result<ParticipantState, LifecycleError> {
        if let Some(mut f) = self.handlers.shutdown.take() {
            self.invoke(&mut *f)?;
        }
        let next = self.transition(done)?;
        self.resolve_final(next);
        Ok(next)
    }
}

impl Drop for LifecycleService {
    fn drop(&mut self) {
        if let Some(h) = self.comm_ready_helper.take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn coordinated_run_then_stop_then_shutdown() {
        let started = Arc::new(AtomicBool::new(false));
        let started2 = started.clone();
        let handlers = Handlers {
            starting: Some(Box::new(move || started2.store(true, Ordering::SeqCst))),
            ..Default::default()
        };
        let (mut svc, rx) = LifecycleService::new("Unit", true, true, handlers);
        svc.start().unwrap();
        svc.announcements_sent().unwrap();
        svc.all_peers_connected().unwrap();
        assert_eq!(svc.state(), ParticipantState::ReadyToRun);
        svc.run().unwrap();
        assert!(started.load(Ordering::SeqCst));
        assert_eq!(svc.state(), ParticipantState::Running);
        svc.stop().unwrap();
        assert_eq!(svc.state(), ParticipantState::Stopped);
        svc.shutdown().unwrap();
        assert_eq!(svc.state(), ParticipantState::Shutdown);
        assert_eq!(rx.try_recv().unwrap(), ParticipantState::Shutdown);
    }

    #[test]
    fn uncoordinated_stop_self_shuts_down() {
        let (mut svc, rx) = LifecycleService::new("Unit", false, false, Handlers::default());
        svc.start().unwrap();
        svc.announcements_sent().unwrap();
        svc.all_peers_connected().unwrap();
        // uncoordinated_start self-commands Run as part of all_peers_connected.
        assert_eq!(svc.state(), ParticipantState::Running);
        svc.stop().unwrap();
        assert_eq!(svc.state(), ParticipantState::Shutdown);
        assert_eq!(rx.try_recv().unwrap(), ParticipantState::Shutdown);
    }

    #[test]
    fn handler_panic_moves_to_error() {
        let handlers = Handlers {
            starting: Some(Box::new(|| panic!("boom"))),
            ..Default::default()
        };
        let (mut svc, rx) = LifecycleService::new("Unit", true, true, handlers);
        svc.start().unwrap();
        svc.announcements_sent().unwrap();
        svc.all_peers_connected().unwrap();
        let err = svc.run().unwrap_err();
        assert!(matches!(err, LifecycleError::HandlerPanicked));
        assert_eq!(svc.state(), ParticipantState::Error);
        assert_eq!(rx.try_recv().unwrap(), ParticipantState::Error);
    }

    #[test]
    fn async_comm_ready_gates_until_complete() {
        let (mut svc, _rx) = LifecycleService::new(
            "Unit",
            true,
            true,
            Handlers {
                comm_ready: Some(CommReadyHandlerKind::Async(Box::new(|complete| {
                    complete.complete();
                }))),
                ..Default::default()
            },
        );
        svc.start().unwrap();
        svc.announcements_sent().unwrap();
        svc.all_peers_connected().unwrap();
        assert_eq!(svc.state(), ParticipantState::CommunicationInitialized);
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(svc.wait_comm_ready()).unwrap();
        assert_eq!(svc.state(), ParticipantState::ReadyToRun);
    }

    #[test]
    fn abort_from_running_reaches_shutdown() {
        let (mut svc, rx) = LifecycleService::new("Unit", true, true, Handlers::default());
        svc.start().unwrap();
        svc.announcements_sent().unwrap();
        svc.all_peers_connected().unwrap();
        svc.run().unwrap();
        svc.abort().unwrap();
        assert_eq!(svc.state(), ParticipantState::Shutdown);
        assert_eq!(rx.try_recv().unwrap(), ParticipantState::Shutdown);
    }
}
