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

//! Length-prefixed framed binary codec.
//!
//! A frame on the wire is `[u32 size][u8 kind][payload]`, `size` covering
//! the whole frame including itself. Primitive encodings are little-endian
//! fixed width; strings/byte vectors/sequences are `[u32 len][elements]`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use super::types::Frame;
use super::version::ProtocolVersion;

/// Maximum accepted frame size (64 MiB); guards against memory exhaustion
/// from a corrupt or hostile length prefix.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Errors raised by the wire codec.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum CodecError {
    /// Not enough bytes were available to decode a complete value.
    #[error("truncated frame")]
    Truncated,
    /// An unrecognised tag/kind byte was encountered.
    #[error("bad tag: {0}")]
    BadTag(u8),
    /// The negotiated protocol version has no deserialiser for this message.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(ProtocolVersion),
    /// The declared frame size exceeded `MAX_FRAME_SIZE`.
    #[error("frame size {0} exceeds limit")]
    TooLarge(u32),
    /// A string field was not valid UTF-8.
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
}

/// Encode a value onto the wire under a negotiated protocol version.
pub trait WireEncode {
    /// Append the wire representation of `self` to `buf`.
    fn encode(&self, version: ProtocolVersion, buf: &mut BytesMut);
}

/// Decode a value from the wire under a negotiated protocol version.
pub trait WireDecode: Sized {
    /// Consume the wire representation of `Self` from the front of `buf`.
    fn decode(version: ProtocolVersion, buf: &mut Bytes) -> Result<Self, CodecError>;
}

/// Read a `u8`, failing with `Truncated` rather than panicking.
pub fn get_u8(buf: &mut Bytes) -> Result<u8, CodecError> {
    if buf.remaining() < 1 {
        return Err(CodecError::Truncated);
    }
    Ok(buf.get_u8())
}

/// Read a little-endian `u16`.
pub fn get_u16(buf: &mut Bytes) -> Result<u16, CodecError> {
    if buf.remaining() < 2 {
        return Err(CodecError::Truncated);
    }
    Ok(buf.get_u16_le())
}

/// Read a little-endian `u32`.
pub fn get_u32(buf: &mut Bytes) -> Result<u32, CodecError> {
    if buf.remaining() < 4 {
        return Err(CodecError::Truncated);
    }
    Ok(buf.get_u32_le())
}

/// Read a little-endian `u64`.
pub fn get_u64(buf: &mut Bytes) -> Result<u64, CodecError> {
    if buf.remaining() < 8 {
        return Err(CodecError::Truncated);
    }
    Ok(buf.get_u64_le())
}

/// Read a little-endian `i64` (durations/time points, per spec).
pub fn get_i64(buf: &mut Bytes) -> Result<i64, CodecError> {
    if buf.remaining() < 8 {
        return Err(CodecError::Truncated);
    }
    Ok(buf.get_i64_le())
}

/// Read a `[u32 len][bytes]` UTF-8 string.
pub fn get_string(buf: &mut Bytes) -> Result<String, CodecError> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(CodecError::Truncated);
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8)
}

/// Read a `[u32 len][bytes]` opaque byte vector.
pub fn get_bytes(buf: &mut Bytes) -> Result<Vec<u8>, CodecError> {
    let len = get_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(CodecError::Truncated);
    }
    Ok(buf.copy_to_bytes(len).to_vec())
}

/// Read a `[u32 count][elements]` sequence.
pub fn get_vec<T: WireDecode>(version: ProtocolVersion, buf: &mut Bytes) -> Result<Vec<T>, CodecError> {
    let count = get_u32(buf)? as usize;
    let mut out = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        out.push(T::decode(version, buf)?);
    }
    Ok(out)
}

/// Append a `[u32 len][bytes]` UTF-8 string.
pub fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

/// Append a `[u32 len][bytes]` opaque byte vector.
pub fn put_bytes(buf: &mut BytesMut, b: &[u8]) {
    buf.put_u32_le(b.len() as u32);
    buf.put_slice(b);
}

/// Append a `[u32 count][elements]` sequence.
pub fn put_vec<T: WireEncode>(version: ProtocolVersion, buf: &mut BytesMut, items: &[T]) {
    buf.put_u32_le(items.len() as u32);
    for item in items {
        item.encode(version, buf);
    }
}

/// `tokio_util::codec` adapter binding [`Frame`] en/decoding to a single
/// peer-link's negotiated protocol version.
///
/// Each link owns its own `FrameCodec` instance (not a process-wide
/// singleton), since two simultaneous links may have negotiated different
/// versions.
pub struct FrameCodec {
    version: ProtocolVersion,
}

impl FrameCodec {
    /// Build a codec for a link that has negotiated `version`. Before
    /// negotiation completes (during the initial handshake exchange) links
    /// use [`ProtocolVersion::CURRENT`], since `ParticipantAnnouncement`
    /// itself carries the version and is always encoded/decoded at the
    /// newest format this build supports.
    pub fn new(version: ProtocolVersion) -> Self {
        Self { version }
    }

    /// Update the negotiated version after a handshake completes.
    pub fn set_version(&mut self, version: ProtocolVersion) {
        self.version = version;
    }

    /// Currently negotiated version.
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut body = BytesMut::new();
        item.encode(self.version, &mut body);
        // size covers itself: 4 (size) + body.len()
        let total = 4u32
            .checked_add(body.len() as u32)
            .ok_or(CodecError::TooLarge(u32::MAX))?;
        if total > MAX_FRAME_SIZE {
            return Err(CodecError::TooLarge(total));
        }
        dst.put_u32_le(total);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let size = u32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        // `size` covers itself (4 bytes) plus at least a one-byte kind tag;
        // anything smaller can never hold a real frame and would underflow
        // the `advance(4)` below.
        if size < 5 {
            return Err(CodecError::Truncated);
        }
        if size > MAX_FRAME_SIZE {
            return Err(CodecError::TooLarge(size));
        }
        if (src.len() as u32) < size {
            src.reserve((size as usize).saturating_sub(src.len()));
            return Ok(None);
        }
        let mut frame_bytes = src.split_to(size as usize);
        frame_bytes.advance(4); // drop the size prefix we already consumed
        let mut body = frame_bytes.freeze();
        let frame = Frame::decode(self.version, &mut body)?;
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undersized_length_prefix_is_rejected_not_a_panic() {
        let mut codec = FrameCodec::new(ProtocolVersion::CURRENT);
        for size in 0u32..5 {
            let mut src = BytesMut::new();
            src.put_u32_le(size);
            let err = codec.decode(&mut src).expect_err("size < 5 must be rejected");
            assert_eq!(err, CodecError::Truncated);
        }
    }

    #[test]
    fn zero_bytes_does_not_panic() {
        let mut codec = FrameCodec::new(ProtocolVersion::CURRENT);
        let mut src = BytesMut::from(&[0u8, 0, 0, 0][..]);
        assert_eq!(codec.decode(&mut src), Err(CodecError::Truncated));
    }

    #[test]
    fn incomplete_length_prefix_awaits_more_data() {
        let mut codec = FrameCodec::new(ProtocolVersion::CURRENT);
        let mut src = BytesMut::from(&[0u8, 0, 0][..]);
        assert_eq!(codec.decode(&mut src), Ok(None));
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut codec = FrameCodec::new(ProtocolVersion::CURRENT);
        let mut src = BytesMut::new();
        src.put_u32_le(MAX_FRAME_SIZE + 1);
        assert_eq!(codec.decode(&mut src), Err(CodecError::TooLarge(MAX_FRAME_SIZE + 1)));
    }
}
