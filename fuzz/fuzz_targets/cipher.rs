//! Fuzz target for suite construction and whole-datagram encryption
//!
//! Any passphrase, suite name and buffer must round-trip through
//! encrypt/decrypt.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use veil_crypto::resolve;

#[derive(Debug, Arbitrary)]
struct CipherInput {
    seed: String,
    suite: String,
    buf: Vec<u8>,
}

fuzz_target!(|input: CipherInput| {
    // Unknown suite names fall back; construction must not panic
    let Ok(Some(crypt)) = resolve(&input.seed, &input.suite) else {
        return;
    };

    let mut buf = input.buf.clone();
    crypt.encrypt(&mut buf);
    crypt.decrypt(&mut buf);
    assert_eq!(buf, input.buf);
});
