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

//! Step-duration watchdog (spec.md §5): measures each simulation step
//! against `softResponseTimeout`/`hardResponseTimeout` and invokes
//! warn/error handlers on breach. Breaches never auto-terminate the
//! participant.

use std::time::{Duration, Instant};

use crate::config::HealthCheckConfig;

/// Which budget a step exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Breach {
    /// Exceeded `softResponseTimeout` but not `hardResponseTimeout`.
    Soft,
    /// Exceeded `hardResponseTimeout`.
    Hard,
}

/// Measures one step's wall-clock duration against the configured budgets.
pub struct Watchdog {
    soft: Duration,
    hard: Duration,
}

impl Watchdog {
    /// Build a watchdog from the participant's configured timeouts.
    pub fn new(config: &HealthCheckConfig) -> Self {
        Self { soft: config.soft_response_timeout(), hard: config.hard_response_timeout() }
    }

    /// Begin timing a step. Call [`StepGuard::finish`] (or drop it) when
    /// the step completes.
    pub fn start_step(&self) -> StepGuard<'_> {
        StepGuard { watchdog: self, started: Instant::now() }
    }
}

/// An in-flight step measurement.
pub struct StepGuard<'a> {
    watchdog: &'a Watchdog,
    started: Instant,
}

impl StepGuard<'_> {
    /// Finish timing and return the breach, if any, logging at `warn` (soft)
    /// or `error` (hard) per spec.md §5. Never terminates the participant.
    pub fn finish(self) -> Option<Breach> {
        let elapsed = self.started.elapsed();
        if elapsed >= self.watchdog.hard {
            tracing::error!(elapsed_ms = elapsed.as_millis() as u64, "step exceeded hard response timeout");
            Some(Breach::Hard)
        } else if elapsed >= self.watchdog.soft {
            tracing::warn!(elapsed_ms = elapsed.as_millis() as u64, "step exceeded soft response timeout");
            Some(Breach::Soft)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_step_does_not_breach() {
        let wd = Watchdog::new(&HealthCheckConfig { soft_response_timeout_ms: 1000, hard_response_timeout_ms: 2000 });
        let guard = wd.start_step();
        assert_eq!(guard.finish(), None);
    }

    #[test]
    fn breach_classification_orders_hard_over_soft() {
        let wd = Watchdog::new(&HealthCheckConfig { soft_response_timeout_ms: 0, hard_response_timeout_ms: 50 });
        let guard = wd.start_step();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(guard.finish(), Some(Breach::Soft));
    }
}
