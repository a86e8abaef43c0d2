//! Fuzz test for configuration file parsing
//!
//! Tests that arbitrary TOML input doesn't cause panics when parsed and
//! validated as a VEIL session configuration.

#![no_main]

use libfuzzer_sys::fuzz_target;
use veil_core::SessionConfig;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let _: Result<toml::Value, _> = toml::from_str(s);

        // Parsing may fail; a parsed config must validate without panicking
        if let Ok(config) = SessionConfig::from_toml_str(s) {
            if config.validate().is_ok() {
                let _ = config.params();
            }
        }
    }
});
