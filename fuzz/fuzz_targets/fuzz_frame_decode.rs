//! Fuzzes the wire frame decoder: arbitrary bytes must never panic and
//! never produce a frame larger than the configured maximum.

#![no_main]

use bytes::BytesMut;
use estuary::protocol::FrameCodec;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    let mut codec = FrameCodec::new(4096);
    let mut buffer = BytesMut::from(data);
    // Decode as many frames as the input yields; errors are fine,
    // panics are not.
    while let Ok(Some(frame)) = codec.decode(&mut buffer) {
        assert!(frame.payload.len() <= 4096);
    }
});
