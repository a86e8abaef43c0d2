//! Fuzz target for inbound datagram handling
//!
//! Arbitrary bytes arriving on the wire must be rejected or accepted
//! without panicking, under every suite.

#![no_main]

use libfuzzer_sys::fuzz_target;
use veil_crypto::{CipherSuite, resolve};
use veil_transport::DatagramCodec;
use veil_transport::params::KCP_HEADER_SIZE;
use veil_transport::session::is_close_segment;

fuzz_target!(|data: &[u8]| {
    let Some((&selector, rest)) = data.split_first() else {
        return;
    };
    let suites = CipherSuite::all();
    let suite = suites[usize::from(selector) % suites.len()];
    let Ok(crypt) = resolve("fuzz", suite.name()) else {
        return;
    };
    let codec = DatagramCodec::new(crypt);

    let mut datagram = rest.to_vec();
    if let Some(payload) = codec.decode(&mut datagram) {
        let _ = is_close_segment(payload);
        if payload.len() >= KCP_HEADER_SIZE {
            let _ = kcp::get_conv(payload);
        }
    }
});
