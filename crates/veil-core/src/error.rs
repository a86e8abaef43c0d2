//! Error types for session wiring.
//!
//! Configuration problems are reported before any socket is opened;
//! resource failures carry the transport's error; accept failures are
//! split so the accept loop can tell shutdown from a transient fault.

use thiserror::Error;
use veil_crypto::CryptoError;
use veil_transport::TransportError;

/// Errors from client and server construction.
#[derive(Debug, Error)]
pub enum VeilError {
    /// Configuration rejected before any resource was opened
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Cipher construction or id generation failed
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Resolve, bind or session setup failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl VeilError {
    /// Check if error is transient (may succeed on retry)
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(TransportError::Io(_) | TransportError::Resolve(_))
        )
    }
}

/// Out-of-range or unreadable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// MTU outside the supported range
    #[error("mtu {mtu} outside {min}..={max}")]
    Mtu {
        /// Configured value
        mtu: usize,
        /// Smallest usable value for the configured suite
        min: usize,
        /// Largest supported value
        max: usize,
    },

    /// Window size outside 1..=65535
    #[error("{name} {value} outside 1..=65535")]
    Window {
        /// Field name
        name: &'static str,
        /// Configured value
        value: u32,
    },

    /// DSCP outside 0..=63
    #[error("dscp {0} outside 0..=63")]
    Dscp(u32),

    /// Update interval outside 1..=5000 ms
    #[error("interval {0} outside 1..=5000")]
    Interval(u32),

    /// Fast-retransmit trigger too large for the KCP engine
    #[error("resend {0} exceeds 2147483647")]
    Resend(u32),

    /// Configuration file could not be parsed
    #[error("parse error: {0}")]
    Parse(String),

    /// Configuration file could not be read or written
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why an accept did not yield a session.
#[derive(Debug, Error)]
pub enum AcceptError {
    /// The listener was closed; no further sessions will arrive
    #[error("listener closed")]
    Closed,

    /// A transient transport fault; accepting may continue
    #[error("accept failed: {0}")]
    Transport(TransportError),
}

impl From<TransportError> for AcceptError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => Self::Closed,
            other => Self::Transport(other),
        }
    }
}
