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

//! Per-participant lifecycle: the state graph and the service that drives
//! it from user calls, cluster commands, and handler completions.

/// The state graph itself (spec.md §4.7, §3).
pub mod state;
/// The service that owns one participant's lifecycle state and handlers.
pub mod service;

pub use service::{CommReadyHandlerKind, Handlers, LifecycleError, LifecycleService};
pub use state::{apply, InvalidTransition, ParticipantState, Transition};
