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

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Meshsim - a distributed co-simulation middleware coordination plane.
//!
//! This crate provides:
//! - A registry service for participant join/discovery (`networking::registry`)
//! - A per-participant connection manager with receiver-index routing
//!   (`networking::connection`)
//! - Service discovery and publisher/subscriber matching (`networking::discovery`,
//!   `networking::pubsub`)
//! - The participant lifecycle state graph and its driving service (`lifecycle`)
//! - Cluster-wide system-state aggregation and command broadcast (`monitor`)
//! - Virtual-time synchronisation under strict coupling (`timesync`)
//! - A length-prefixed framed wire protocol with version negotiation (`wire`)
//! - Monitoring via Prometheus metrics and an `axum` HTTP surface (`monitoring`)

/// Deterministic participant id derivation.
pub mod ids;
/// Participant configuration loading and validation.
pub mod config;
/// Per-participant lifecycle state graph and driving service.
pub mod lifecycle;
/// Cluster-wide system-state aggregation and command broadcast.
pub mod monitor;
/// Registry, connection manager, service discovery, and pub/sub.
pub mod networking;
/// Virtual-time synchronisation engine.
pub mod timesync;
/// Step-duration watchdog.
pub mod watchdog;
/// Length-prefixed framed wire protocol.
pub mod wire;
/// Observability (Prometheus metrics, HTTP surface).
pub mod monitoring;
