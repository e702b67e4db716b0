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

//! Length-prefixed framed binary wire protocol: message types, codec, and
//! protocol version negotiation.

/// Framing and primitive (de)serialisation.
pub mod codec;
/// Normative message types.
pub mod types;
/// `{major, minor}` protocol version negotiation.
pub mod version;

pub use codec::{CodecError, FrameCodec, WireDecode, WireEncode};
pub use types::*;
pub use version::ProtocolVersion;
