//! # VEIL Crypto
//!
//! Datagram obfuscation primitives for VEIL sessions.
//!
//! This crate provides:
//! - A closed registry of symmetric cipher suites selected by name
//! - Passphrase key derivation (PBKDF2-HMAC-SHA1, fixed salt and rounds)
//! - Whole-datagram block encryption (CFB, Salsa20, XOR pad, passthrough)
//! - Random conversation id generation for handshake-less sessions
//!
//! There is no key exchange. Both peers derive the same key from the same
//! passphrase, so the derivation parameters below are part of the wire
//! contract and must never change.
//!
//! ## Cipher Suites
//!
//! | Suite | Construction | Key | Block |
//! |-------|--------------|-----|-------|
//! | `null` | absent (cleartext, no header) | - | - |
//! | `none` | passthrough | - | - |
//! | `xor` | 1500-byte derived pad | 32 | - |
//! | `tea` | TEA-16 CFB | 16 | 8 |
//! | `xtea` | XTEA CFB | 16 | 8 |
//! | `3des` | 3DES-EDE3 CFB | 24 | 8 |
//! | `blowfish` | Blowfish CFB | 32 | 8 |
//! | `cast5` | CAST5 CFB | 16 | 8 |
//! | `twofish` | Twofish CFB | 32 | 16 |
//! | `salsa20` | Salsa20 stream | 32 | - |
//! | `sm4` | SM4 CFB | 16 | 16 |
//! | `aes-128` / `aes` | AES-128 CFB | 16 | 16 |
//! | `aes-192` | AES-192 CFB | 24 | 16 |
//! | `aes-256` | AES-256 CFB | 32 | 16 |
//!
//! Unknown suite names resolve to `aes-128`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod block;
pub mod error;
pub mod kdf;
pub mod random;
pub mod suite;
pub mod tea;

pub use block::{BlockCrypt, CipherInstance};
pub use error::CryptoError;
pub use kdf::{DerivedKey, derive_key};
pub use random::{ConvIdGenerator, RECENT_IDS};
pub use suite::{CipherSuite, Resolution, resolve};

/// Salt mixed into every passphrase derivation.
pub const KDF_SALT: &[u8] = b"kcp-go";

/// PBKDF2 iteration count for passphrase derivation.
pub const KDF_ITERATIONS: u32 = 4096;

/// Largest key any suite requires.
pub const MAX_KEY_SIZE: usize = 32;

/// Largest datagram the XOR pad covers without wrapping.
pub const XOR_PAD_SIZE: usize = 1500;
