// Copyright (c) 2026 Meshsim
// Licensed under the Apache-2.0 License.

#![no_main]
#![forbid(unsafe_code)]

use libfuzzer_sys::fuzz_target;
use meshsim::wire::{FrameCodec, ProtocolVersion};
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must never panic the decoder, regardless of how the
    // length prefix or message kind tag is corrupted.
    let mut codec = FrameCodec::new(ProtocolVersion::CURRENT);
    let mut buf = bytes::BytesMut::from(data);
    loop {
        match codec.decode(&mut buf) {
            Ok(Some(_frame)) => continue,
            Ok(None) | Err(_) => break,
        }
    }
});
