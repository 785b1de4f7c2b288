#![no_main]

use bytes::BytesMut;
use covert_mux::core::codec::FrameCodec;
use covert_mux::core::frame::Frame;
use covert_mux::utils::crypto::SessionSecret;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Plaintext parser first, then the full segment decoder
    let _ = Frame::parse_plain(data);

    let Ok(secret) = SessionSecret::from_bytes(b"fuzzing-secret!!") else {
        return;
    };
    let mut codec = FrameCodec::new(&[0u8; 32], &secret);
    let mut buf = BytesMut::from(data);
    while let Ok(Some(_)) = codec.decode(&mut buf) {}
    let _ = codec.decode_eof(&mut buf);
});
