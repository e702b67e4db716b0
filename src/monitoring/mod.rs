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

//! Observability: Prometheus metrics and the `/metrics`/`/healthz` HTTP
//! surface (spec.md §2 ambient stack).

/// Prometheus counters/gauges for the mesh, lifecycle, and time-sync.
pub mod metrics;
/// `axum` server exposing `/metrics` and `/healthz`.
pub mod http;

pub use metrics::{Metrics, MetricsError};
