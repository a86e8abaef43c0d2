//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Derived key does not fit the cipher
    #[error("invalid key length for {suite}: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Suite being constructed
        suite: &'static str,
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,

    /// Conversation id space exhausted after repeated collisions
    #[error("could not draw an unused conversation id after {attempts} attempts")]
    ConvIdExhausted {
        /// Draws attempted
        attempts: usize,
    },
}
