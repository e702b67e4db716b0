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

//! Deterministic participant ids.
//!
//! `DefaultHasher` (unlike the `RandomState` behind `HashMap`) hashes with
//! fixed keys, so every process that hashes the same name arrives at the
//! same id without any registry round-trip to learn it.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Derive a stable numeric id for a participant name.
pub fn participant_id(name: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    name.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_name_hashes_identically_every_time() {
        assert_eq!(participant_id("Driver"), participant_id("Driver"));
    }

    #[test]
    fn different_names_usually_differ() {
        assert_ne!(participant_id("Driver"), participant_id("Sensor"));
    }
}
