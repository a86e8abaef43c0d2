//! Cipher suite registry.
//!
//! Suites are selected by name. The set is closed: a name that matches
//! nothing resolves to AES-128 rather than failing, so peers built with
//! older or newer suite lists still come up (with the default cipher).

use std::fmt;
use std::sync::Arc;

use crate::block::{CfbCrypt, CipherInstance, NoneCrypt, Salsa20Crypt, XorCrypt};
use crate::error::CryptoError;
use crate::kdf::derive_key;

/// A named symmetric cipher suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherSuite {
    /// Encryption disabled entirely: no cipher, no framing header.
    Null,
    /// Framing header without encryption.
    None,
    /// XOR with a derived pad.
    Xor,
    /// TEA (16 rounds) in CFB mode.
    Tea,
    /// XTEA in CFB mode.
    Xtea,
    /// Triple DES (EDE3) in CFB mode.
    TripleDes,
    /// Blowfish in CFB mode.
    Blowfish,
    /// CAST5 in CFB mode.
    Cast5,
    /// Twofish in CFB mode.
    Twofish,
    /// Salsa20 stream cipher.
    Salsa20,
    /// SM4 in CFB mode.
    Sm4,
    /// AES-128 in CFB mode. The default.
    Aes128,
    /// AES-192 in CFB mode.
    Aes192,
    /// AES-256 in CFB mode.
    Aes256,
}

/// Outcome of looking a suite name up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The name matched a suite.
    Known(CipherSuite),
    /// The name matched nothing; the default suite applies.
    Fallback(CipherSuite),
}

impl Resolution {
    /// The suite to use either way.
    #[must_use]
    pub fn suite(self) -> CipherSuite {
        match self {
            Self::Known(s) | Self::Fallback(s) => s,
        }
    }

    /// True when the name was not recognized.
    #[must_use]
    pub fn is_fallback(self) -> bool {
        matches!(self, Self::Fallback(_))
    }
}

impl CipherSuite {
    /// Suite used when a name is not recognized.
    pub const DEFAULT: CipherSuite = CipherSuite::Aes128;

    /// Every suite, in registry order.
    #[must_use]
    pub fn all() -> &'static [CipherSuite] {
        &[
            Self::Null,
            Self::None,
            Self::Xor,
            Self::Tea,
            Self::Xtea,
            Self::TripleDes,
            Self::Blowfish,
            Self::Cast5,
            Self::Twofish,
            Self::Salsa20,
            Self::Sm4,
            Self::Aes128,
            Self::Aes192,
            Self::Aes256,
        ]
    }

    /// Canonical configuration name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::None => "none",
            Self::Xor => "xor",
            Self::Tea => "tea",
            Self::Xtea => "xtea",
            Self::TripleDes => "3des",
            Self::Blowfish => "blowfish",
            Self::Cast5 => "cast5",
            Self::Twofish => "twofish",
            Self::Salsa20 => "salsa20",
            Self::Sm4 => "sm4",
            Self::Aes128 => "aes-128",
            Self::Aes192 => "aes-192",
            Self::Aes256 => "aes-256",
        }
    }

    /// Look a name up. Matching is exact; `"aes"` is an alias for AES-128.
    #[must_use]
    pub fn parse(name: &str) -> Resolution {
        let suite = match name {
            "aes" => Some(Self::Aes128),
            other => Self::all().iter().copied().find(|s| s.name() == other),
        };
        match suite {
            Some(s) => Resolution::Known(s),
            None => Resolution::Fallback(Self::DEFAULT),
        }
    }

    /// Key length the suite derives from the passphrase.
    ///
    /// Zero for `null` and `none`, which never derive a key.
    #[must_use]
    pub fn key_len(self) -> usize {
        match self {
            Self::Null | Self::None => 0,
            Self::Tea | Self::Xtea | Self::Cast5 | Self::Sm4 | Self::Aes128 => 16,
            Self::TripleDes | Self::Aes192 => 24,
            Self::Xor | Self::Blowfish | Self::Twofish | Self::Salsa20 | Self::Aes256 => 32,
        }
    }

    /// Cipher block size, or `None` for stream and passthrough suites.
    #[must_use]
    pub fn block_size(self) -> Option<usize> {
        match self {
            Self::Null | Self::None | Self::Xor | Self::Salsa20 => None,
            Self::Tea | Self::Xtea | Self::TripleDes | Self::Blowfish | Self::Cast5 => Some(8),
            Self::Twofish | Self::Sm4 | Self::Aes128 | Self::Aes192 | Self::Aes256 => Some(16),
        }
    }

    /// Derive this suite's key from `seed` and construct the cipher.
    ///
    /// Returns `Ok(None)` for [`CipherSuite::Null`].
    pub fn build(self, seed: &str) -> Result<Option<CipherInstance>, CryptoError> {
        let key = derive_key(seed, self.key_len());
        let key = key.as_bytes();
        let crypt: CipherInstance = match self {
            Self::Null => return Ok(None),
            Self::None => Arc::new(NoneCrypt),
            Self::Xor => Arc::new(XorCrypt::new(key)),
            Self::Tea => Arc::new(CfbCrypt::tea(key)?),
            Self::Xtea => Arc::new(CfbCrypt::xtea(key)?),
            Self::TripleDes => Arc::new(CfbCrypt::rustcrypto::<des::TdesEde3>(self, key)?),
            Self::Blowfish => Arc::new(CfbCrypt::rustcrypto::<blowfish::Blowfish>(self, key)?),
            Self::Cast5 => Arc::new(CfbCrypt::rustcrypto::<cast5::Cast5>(self, key)?),
            Self::Twofish => Arc::new(CfbCrypt::rustcrypto::<twofish::Twofish>(self, key)?),
            Self::Salsa20 => Arc::new(Salsa20Crypt::new(key)?),
            Self::Sm4 => Arc::new(CfbCrypt::rustcrypto::<sm4::Sm4>(self, key)?),
            Self::Aes128 => Arc::new(CfbCrypt::rustcrypto::<aes::Aes128>(self, key)?),
            Self::Aes192 => Arc::new(CfbCrypt::rustcrypto::<aes::Aes192>(self, key)?),
            Self::Aes256 => Arc::new(CfbCrypt::rustcrypto::<aes::Aes256>(self, key)?),
        };
        Ok(Some(crypt))
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Resolve a suite name and build its cipher from `seed`.
///
/// `"null"` yields `Ok(None)`. Unrecognized names build AES-128 and log
/// the substitution at debug level.
pub fn resolve(seed: &str, name: &str) -> Result<Option<CipherInstance>, CryptoError> {
    let resolution = CipherSuite::parse(name);
    if resolution.is_fallback() {
        tracing::debug!(
            requested = name,
            suite = %resolution.suite(),
            "unknown cipher suite, using default"
        );
    }
    resolution.suite().build(seed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(crypt: &CipherInstance) {
        let original: Vec<u8> = (0..300u32).map(|i| (i * 7) as u8).collect();
        let mut buf = original.clone();
        crypt.encrypt(&mut buf);
        crypt.decrypt(&mut buf);
        assert_eq!(buf, original, "suite {}", crypt.suite());
    }

    #[test]
    fn test_names_round_trip() {
        for &suite in CipherSuite::all() {
            assert_eq!(CipherSuite::parse(suite.name()), Resolution::Known(suite));
        }
    }

    #[test]
    fn test_aes_alias() {
        assert_eq!(CipherSuite::parse("aes"), Resolution::Known(CipherSuite::Aes128));
    }

    #[test]
    fn test_unknown_falls_back_to_aes128() {
        for name in ["", "rot13", "AES", "aes-512"] {
            let r = CipherSuite::parse(name);
            assert!(r.is_fallback(), "{name:?}");
            assert_eq!(r.suite(), CipherSuite::Aes128);
        }
    }

    #[test]
    fn test_null_is_absent() {
        assert!(resolve("seed", "null").unwrap().is_none());
    }

    #[test]
    fn test_none_is_passthrough() {
        let crypt = resolve("seed", "none").unwrap().unwrap();
        let mut buf = *b"plaintext";
        crypt.encrypt(&mut buf);
        assert_eq!(&buf, b"plaintext");
    }

    #[test]
    fn test_every_suite_builds_and_round_trips() {
        for &suite in CipherSuite::all() {
            match suite.build("test-seed").unwrap() {
                Some(crypt) => {
                    assert_eq!(crypt.suite(), suite);
                    round_trip(&crypt);
                }
                None => assert_eq!(suite, CipherSuite::Null),
            }
        }
    }

    #[test]
    fn test_unknown_name_interoperates_with_aes128() {
        let fallback = resolve("shared", "nonsense").unwrap().unwrap();
        let explicit = resolve("shared", "aes-128").unwrap().unwrap();
        let mut buf = b"interchangeable".to_vec();
        fallback.encrypt(&mut buf);
        explicit.decrypt(&mut buf);
        assert_eq!(buf, b"interchangeable");
    }

    #[test]
    fn test_same_inputs_interchangeable() {
        let a = resolve("seed", "twofish").unwrap().unwrap();
        let b = resolve("seed", "twofish").unwrap().unwrap();
        let mut x = vec![0u8; 100];
        let mut y = vec![0u8; 100];
        a.encrypt(&mut x);
        b.encrypt(&mut y);
        assert_eq!(x, y);
    }

    #[test]
    fn test_different_seeds_do_not_interoperate() {
        let a = resolve("seed-a", "aes-256").unwrap().unwrap();
        let b = resolve("seed-b", "aes-256").unwrap().unwrap();
        let original = vec![0x42u8; 64];
        let mut buf = original.clone();
        a.encrypt(&mut buf);
        b.decrypt(&mut buf);
        assert_ne!(buf, original);
    }

    #[test]
    fn test_key_lengths() {
        assert_eq!(CipherSuite::TripleDes.key_len(), 24);
        assert_eq!(CipherSuite::Aes192.key_len(), 24);
        assert_eq!(CipherSuite::Cast5.key_len(), 16);
        assert_eq!(CipherSuite::Salsa20.key_len(), 32);
        assert_eq!(CipherSuite::Null.key_len(), 0);
    }

    #[test]
    fn test_block_sizes() {
        assert_eq!(CipherSuite::Blowfish.block_size(), Some(8));
        assert_eq!(CipherSuite::Sm4.block_size(), Some(16));
        assert_eq!(CipherSuite::Salsa20.block_size(), None);
    }
}
