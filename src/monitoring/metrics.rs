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

use prometheus::{IntCounter, IntGauge, Registry};
use thiserror::Error;

/// Metrics registration errors.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// A metric failed to construct or register with the Prometheus
    /// registry (e.g. a name collision).
    #[error("prometheus registration error: {0}")]
    Prom(#[from] prometheus::Error),
}

/// Per-participant metrics, handed explicitly to the connection manager,
/// lifecycle service, and time-sync engine (no process-wide singleton).
#[derive(Clone)]
pub struct Metrics {
    /// Registry these metrics are bound to; scraped by the HTTP surface.
    pub registry: Registry,

    /// Currently established peer-links.
    pub peers_connected: IntGauge,
    /// Registry join attempts that failed (`JoinError`).
    pub join_failures_total: IntCounter,
    /// Peer-links lost to I/O or codec errors.
    pub peer_lost_total: IntCounter,

    /// Lifecycle transitions applied successfully.
    pub lifecycle_transitions_total: IntCounter,
    /// Rejected (invalid) lifecycle transition attempts.
    pub lifecycle_invalid_transitions_total: IntCounter,
    /// System-state changes observed by the monitor.
    pub system_state_changes_total: IntCounter,

    /// `NextSimTask` tokens sent.
    pub sync_tokens_sent_total: IntCounter,
    /// `NextSimTask` tokens received from peers.
    pub sync_tokens_received_total: IntCounter,
    /// Current virtual time, nanoseconds (synchronised participants only).
    pub sync_virtual_time_ns: IntGauge,

    /// Depth of the connection manager's inbound dispatch queue.
    pub dispatch_queue_depth: IntGauge,

    /// Step-duration watchdog soft-timeout breaches.
    pub watchdog_soft_breaches_total: IntCounter,
    /// Step-duration watchdog hard-timeout breaches.
    pub watchdog_hard_breaches_total: IntCounter,
}

macro_rules! register {
    ($registry:expr, $ctor:expr) => {{
        let metric = $ctor?;
        $registry.register(Box::new(metric.clone()))?;
        metric
    }};
}

impl Metrics {
    /// Construct and register a fresh metric set under its own registry.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let peers_connected =
            register!(registry, IntGauge::new("meshsim_peers_connected", "Currently established peer-links"));
        let join_failures_total = register!(
            registry,
            IntCounter::new("meshsim_join_failures_total", "Registry join attempts that failed")
        );
        let peer_lost_total =
            register!(registry, IntCounter::new("meshsim_peer_lost_total", "Peer-links lost to I/O or codec errors"));

        let lifecycle_transitions_total = register!(
            registry,
            IntCounter::new("meshsim_lifecycle_transitions_total", "Lifecycle transitions applied successfully")
        );
        let lifecycle_invalid_transitions_total = register!(
            registry,
            IntCounter::new("meshsim_lifecycle_invalid_transitions_total", "Rejected lifecycle transition attempts")
        );
        let system_state_changes_total = register!(
            registry,
            IntCounter::new("meshsim_system_state_changes_total", "System-state changes observed by the monitor")
        );

        let sync_tokens_sent_total =
            register!(registry, IntCounter::new("meshsim_sync_tokens_sent_total", "NextSimTask tokens sent"));
        let sync_tokens_received_total = register!(
            registry,
            IntCounter::new("meshsim_sync_tokens_received_total", "NextSimTask tokens received from peers")
        );
        let sync_virtual_time_ns =
            register!(registry, IntGauge::new("meshsim_sync_virtual_time_ns", "Current virtual time, nanoseconds"));

        let dispatch_queue_depth = register!(
            registry,
            IntGauge::new("meshsim_dispatch_queue_depth", "Depth of the connection manager's inbound dispatch queue")
        );

        let watchdog_soft_breaches_total = register!(
            registry,
            IntCounter::new("meshsim_watchdog_soft_breaches_total", "Step-duration watchdog soft-timeout breaches")
        );
        let watchdog_hard_breaches_total = register!(
            registry,
            IntCounter::new("meshsim_watchdog_hard_breaches_total", "Step-duration watchdog hard-timeout breaches")
        );

        Ok(Self {
            registry,
            peers_connected,
            join_failures_total,
            peer_lost_total,
            lifecycle_transitions_total,
            lifecycle_invalid_transitions_total,
            system_state_changes_total,
            sync_tokens_sent_total,
            sync_tokens_received_total,
            sync_virtual_time_ns,
            dispatch_queue_depth,
            watchdog_soft_breaches_total,
            watchdog_hard_breaches_total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructs_and_registers_without_name_collisions() {
        let metrics = Metrics::new().expect("metrics construct");
        metrics.peers_connected.set(3);
        assert_eq!(metrics.peers_connected.get(), 3);
        assert!(!metrics.registry.gather().is_empty());
    }
}
