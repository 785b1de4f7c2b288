#![no_main]

use covert_mux::core::token::RequestToken;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(token) = RequestToken::parse(text) {
        let _ = token.encode();
        let _ = token.requester_ip();
        let _ = token.certificate();
    }
});
