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

//! Virtual-time synchronisation: `NextSimTask` token exchange under strict
//! coupling (spec.md §4.9).

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Notify;

use crate::wire::NextSimTask;

/// A synchronised participant's time-sync state: its own virtual clock plus
/// the last-seen token from every other synchronised peer.
pub struct TimeSyncEngine {
    now: i64,
    step: i64,
    paused: bool,
    aborted: bool,
    peer_tasks: BTreeMap<String, NextSimTask>,
    expected_peers: Vec<String>,
    notify: Arc<Notify>,
}

/// Why a wait on the time-sync engine ended without advancing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The policy condition was satisfied; the caller may execute its step.
    Ready,
    /// `AbortSimulation` released all waiters (spec.md §4.9 cancellation).
    Aborted,
}

impl TimeSyncEngine {
    /// Construct an engine for a synchronised participant expecting tokens
    /// from `expected_peers` (the other participants discovered via
    /// service-discovery entries tagged with the sync capability).
    pub fn new(initial_step: i64, expected_peers: Vec<String>) -> Self {
        Self {
            now: 0,
            step: initial_step,
            paused: false,
            aborted: false,
            peer_tasks: BTreeMap::new(),
            expected_peers,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Current virtual time.
    pub fn now(&self) -> i64 {
        self.now
    }

    /// Next step duration.
    pub fn step(&self) -> i64 {
        self.step
    }

    /// The initial token broadcast on entry to `Running` (spec.md §4.9
    /// startup).
    pub fn initial_token(&self) -> NextSimTask {
        NextSimTask { time_point: 0, duration: self.step }
    }

    /// Record a `NextSimTask` received from a synchronised peer.
    pub fn receive_peer_task(&mut self, peer: &str, task: NextSimTask) {
        self.peer_tasks.insert(peer.to_string(), task);
        self.notify.notify_waiters();
    }

    /// `Pause`: stop advancing or emitting tokens; peers block waiting.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// `Continue`: resume emission.
    pub fn continue_(&mut self) {
        self.paused = false;
        self.notify.notify_waiters();
    }

    /// `AbortSimulation`: release all waiters with a cancellation signal.
    pub fn abort(&mut self) {
        self.aborted = true;
        self.notify.notify_waiters();
    }

    fn policy_satisfied(&self) -> bool {
        if self.paused {
            return false;
        }
        if self.peer_tasks.len() < self.expected_peers.len() {
            return false;
        }
        self.expected_peers
            .iter()
            .all(|p| self.peer_tasks.get(p).map(|t| t.time_point >= self.now).unwrap_or(false))
    }

    /// Block (as a suspension point returned to the owning I/O context,
    /// spec.md §5) until every synchronised peer's `nextTask.timePoint >=
    /// now`, or until aborted.
    ///
    /// Strict coupling policy (spec.md §4.9): the participant may execute
    /// its task at `now` only when this condition holds for every peer.
    pub async fn wait_for_step(&mut self) -> WaitOutcome {
        loop {
            if self.aborted {
                return WaitOutcome::Aborted;
            }
            if self.policy_satisfied() {
                return WaitOutcome::Ready;
            }
            let notify = self.notify.clone();
            notify.notified().await;
        }
    }

    /// After executing the task at `now`, advance the clock and produce the
    /// token to broadcast.
    pub fn advance(&mut self) -> NextSimTask {
        self.now += self.step;
        NextSimTask { time_point: self.now, duration: self.step }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn waits_until_all_peers_caught_up_then_advances() {
        let mut engine = TimeSyncEngine::new(1, vec!["B".to_string()]);
        engine.receive_peer_task("B", NextSimTask { time_point: 0, duration: 1 });
        assert_eq!(engine.wait_for_step().await, WaitOutcome::Ready);
        let token = engine.advance();
        assert_eq!(token.time_point, 1);
        assert_eq!(engine.now(), 1);
    }

    #[tokio::test]
    async fn stays_blocked_until_peer_token_is_recent_enough() {
        let mut engine = TimeSyncEngine::new(1, vec!["B".to_string()]);
        engine.receive_peer_task("B", NextSimTask { time_point: -1, duration: 1 });
        assert!(!engine.policy_satisfied());
        engine.receive_peer_task("B", NextSimTask { time_point: 0, duration: 1 });
        let outcome = tokio::time::timeout(std::time::Duration::from_millis(200), engine.wait_for_step())
            .await
            .expect("should not deadlock");
        assert_eq!(outcome, WaitOutcome::Ready);
    }

    #[tokio::test]
    async fn pause_blocks_continue_releases() {
        let mut engine = TimeSyncEngine::new(1, vec![]);
        engine.pause();
        let paused = engine.policy_satisfied();
        assert!(!paused);
        engine.continue_();
        assert_eq!(engine.wait_for_step().await, WaitOutcome::Ready);
    }

    #[tokio::test]
    async fn abort_releases_waiter() {
        let mut engine = TimeSyncEngine::new(1, vec!["B".to_string()]);
        let notify = engine.notify.clone();
        let waiter = tokio::spawn(async move {
            notify.notified().await;
        });
        engine.abort();
        let outcome = engine.wait_for_step().await;
        assert_eq!(outcome, WaitOutcome::Aborted);
        let _ = waiter.await;
    }
}
