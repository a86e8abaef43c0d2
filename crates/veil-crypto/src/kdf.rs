//! Passphrase key derivation.
//!
//! Keys are PBKDF2-HMAC-SHA1 over the passphrase with the fixed
//! [`KDF_SALT`](crate::KDF_SALT) and [`KDF_ITERATIONS`](crate::KDF_ITERATIONS).
//! Peers configured independently with the same passphrase land on the
//! same bytes; nothing about the derivation is negotiable at runtime.

use pbkdf2::pbkdf2_hmac;
use sha1::Sha1;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{KDF_ITERATIONS, KDF_SALT};

/// Key material derived from a passphrase.
///
/// Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey(Vec<u8>);

impl DerivedKey {
    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Key length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for zero-length keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("len", &self.0.len())
            .finish_non_exhaustive()
    }
}

/// Stretch `passphrase` into `key_len` bytes.
///
/// An empty passphrase is accepted and yields a valid (weak) key.
#[must_use]
pub fn derive_key(passphrase: &str, key_len: usize) -> DerivedKey {
    let mut out = vec![0u8; key_len];
    if key_len > 0 {
        pbkdf2_sha1(passphrase.as_bytes(), KDF_SALT, KDF_ITERATIONS, &mut out);
    }
    DerivedKey(out)
}

/// Raw PBKDF2-HMAC-SHA1, filling `out`.
///
/// [`derive_key`] is this with the fixed salt and rounds. The XOR suite
/// also uses it to stretch its pad from an already derived key.
pub fn pbkdf2_sha1(password: &[u8], salt: &[u8], rounds: u32, out: &mut [u8]) {
    pbkdf2_hmac::<Sha1>(password, salt, rounds, out);
}
