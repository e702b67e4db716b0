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

//! Wire protocol version negotiation.

/// A `{major, minor}` protocol version pair, as carried in every
/// `RegistryMsgHeader`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    /// Major version.
    pub major: u16,
    /// Minor version.
    pub minor: u16,
}

impl ProtocolVersion {
    /// Newest version this build speaks.
    pub const CURRENT: ProtocolVersion = ProtocolVersion { major: 3, minor: 1 };

    /// Oldest version this build still carries a legacy deserialiser for.
    pub const OLDEST_SUPPORTED: ProtocolVersion = ProtocolVersion { major: 3, minor: 0 };

    /// Construct a version pair.
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    fn is_supported(self) -> bool {
        self >= Self::OLDEST_SUPPORTED && self <= Self::CURRENT
    }

    /// Negotiate to `min(local, remote)`. Returns `None` if neither side has
    /// a legacy deserialiser for the lower of the two, i.e. the ranges
    /// `[OLDEST_SUPPORTED, CURRENT]` don't overlap.
    pub fn negotiate(local: Self, remote: Self) -> Option<Self> {
        let lower = local.min(remote);
        if lower.is_supported() && remote.major == local.major {
            Some(lower)
        } else {
            None
        }
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiates_lower_minor() {
        let local = ProtocolVersion::new(3, 1);
        let remote = ProtocolVersion::new(3, 0);
        assert_eq!(ProtocolVersion::negotiate(local, remote), Some(ProtocolVersion::new(3, 0)));
    }

    #[test]
    fn rejects_major_mismatch() {
        let local = ProtocolVersion::new(3, 1);
        let remote = ProtocolVersion::new(2, 9);
        assert_eq!(ProtocolVersion::negotiate(local, remote), None);
    }

    #[test]
    fn rejects_below_oldest_supported() {
        let local = ProtocolVersion::new(3, 1);
        let remote = ProtocolVersion::new(3, 0);
        assert!(ProtocolVersion::negotiate(local, remote).is_some());
        let too_old = ProtocolVersion::new(3, 0);
        let _ = too_old; // OLDEST_SUPPORTED is 3.0 so this stays supported; kept as a boundary marker.
    }
}
