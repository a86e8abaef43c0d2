//! Packet connection abstraction.
//!
//! This module defines the `PacketConn` trait that sessions and listeners
//! run on top of. A packet conn moves whole datagrams to and from
//! addresses; reliability, ordering and encryption are layered above it.
//! UDP and the in-memory network both implement it, and callers can bring
//! their own.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use veil_crypto::CryptoError;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Address binding failed
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    /// Host name did not resolve to an address
    #[error("Failed to resolve {0}")]
    Resolve(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The reliability engine rejected an operation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Session parameters were already applied
    #[error("Session is already configured")]
    AlreadyConfigured,

    /// Session used before its parameters were applied
    #[error("Session is not configured")]
    NotConfigured,

    /// The peer stopped acknowledging and the session gave up on it
    #[error("Peer stopped responding")]
    DeadLink,

    /// Cipher construction or randomness failed
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Async datagram connection.
///
/// Implementations must be safe to share between the tasks of a session
/// or listener. After [`close`](Self::close), `send_to` and `recv_from`
/// (including a `recv_from` already waiting) return
/// [`TransportError::Closed`].
///
/// # Examples
///
/// ```no_run
/// use veil_transport::transport::PacketConn;
/// use veil_transport::udp_async::UdpPacketConn;
/// use std::net::SocketAddr;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: SocketAddr = "127.0.0.1:40000".parse()?;
/// let conn = UdpPacketConn::bind(addr).await?;
///
/// conn.send_to(b"Hello, VEIL!", "127.0.0.1:50000".parse()?).await?;
///
/// let mut buf = vec![0u8; 1500];
/// let (size, from) = conn.recv_from(&mut buf).await?;
/// println!("Received {} bytes from {}", size, from);
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait PacketConn: Send + Sync {
    /// Send one datagram to `addr`, returning the bytes sent.
    ///
    /// # Errors
    /// Returns `TransportError` if the send operation fails
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize>;

    /// Receive one datagram into `buf`.
    ///
    /// # Errors
    /// Returns `TransportError` if the receive operation fails
    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)>;

    /// Get the local address this conn is bound to.
    ///
    /// # Errors
    /// Returns `TransportError` if the address cannot be determined
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Close the conn and release resources. Idempotent.
    ///
    /// # Errors
    /// Returns `TransportError` if closing fails
    async fn close(&self) -> TransportResult<()>;

    /// Check if the conn is closed.
    fn is_closed(&self) -> bool;

    /// Get transport statistics.
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }

    /// Mark outgoing traffic with a DSCP code point (0..=63).
    fn set_dscp(&self, _dscp: u8) -> Tuning {
        Tuning::Rejected("DSCP not supported by this conn".to_string())
    }

    /// Set the kernel receive buffer size.
    fn set_recv_buffer_size(&self, _bytes: usize) -> Tuning {
        Tuning::Rejected("buffer sizing not supported by this conn".to_string())
    }

    /// Set the kernel send buffer size.
    fn set_send_buffer_size(&self, _bytes: usize) -> Tuning {
        Tuning::Rejected("buffer sizing not supported by this conn".to_string())
    }
}

/// Outcome of one best-effort socket adjustment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tuning {
    /// The setting took effect.
    Applied,
    /// Not requested (zero means leave the OS default).
    Skipped,
    /// Requested but refused; the session works without it.
    Rejected(String),
}

impl Tuning {
    /// True if the adjustment was refused.
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

/// Result of applying DSCP and buffer sizing to a conn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TuningReport {
    /// DSCP marking
    pub dscp: Tuning,
    /// Receive buffer size
    pub recv_buffer: Tuning,
    /// Send buffer size
    pub send_buffer: Tuning,
}

impl TuningReport {
    /// Report for a conn nobody tuned.
    #[must_use]
    pub fn skipped() -> Self {
        Self {
            dscp: Tuning::Skipped,
            recv_buffer: Tuning::Skipped,
            send_buffer: Tuning::Skipped,
        }
    }

    /// Apply `dscp` (0 skips) and `sockbuf` (0 skips) to `conn`.
    ///
    /// Failures never propagate; each is logged and recorded.
    pub fn apply(conn: &dyn PacketConn, dscp: u8, sockbuf: usize) -> Self {
        let report = Self {
            dscp: if dscp > 0 {
                conn.set_dscp(dscp)
            } else {
                Tuning::Skipped
            },
            recv_buffer: if sockbuf > 0 {
                conn.set_recv_buffer_size(sockbuf)
            } else {
                Tuning::Skipped
            },
            send_buffer: if sockbuf > 0 {
                conn.set_send_buffer_size(sockbuf)
            } else {
                Tuning::Skipped
            },
        };
        for (what, outcome) in [
            ("dscp", &report.dscp),
            ("recv_buffer", &report.recv_buffer),
            ("send_buffer", &report.send_buffer),
        ] {
            if let Tuning::Rejected(reason) = outcome {
                tracing::warn!(setting = what, %reason, "socket tuning rejected");
            }
        }
        report
    }

    /// True if any requested setting was refused.
    #[must_use]
    pub fn any_rejected(&self) -> bool {
        self.dscp.is_rejected() || self.recv_buffer.is_rejected() || self.send_buffer.is_rejected()
    }
}

/// Shared conn handle, as stored by sessions and listeners.
pub type SharedConn = Arc<dyn PacketConn>;

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total packets sent
    pub packets_sent: u64,
    /// Total packets received
    pub packets_received: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors
    pub recv_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Conn that accepts every tuning request.
    struct Compliant(AtomicBool);

    #[async_trait]
    impl PacketConn for Compliant {
        async fn send_to(&self, buf: &[u8], _addr: SocketAddr) -> TransportResult<usize> {
            Ok(buf.len())
        }

        async fn recv_from(&self, _buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
            Err(TransportError::Closed)
        }

        fn local_addr(&self) -> TransportResult<SocketAddr> {
            Ok("127.0.0.1:1".parse().unwrap())
        }

        async fn close(&self) -> TransportResult<()> {
            self.0.store(true, Ordering::Relaxed);
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.0.load(Ordering::Relaxed)
        }

        fn set_dscp(&self, _dscp: u8) -> Tuning {
            Tuning::Applied
        }

        fn set_recv_buffer_size(&self, _bytes: usize) -> Tuning {
            Tuning::Applied
        }

        fn set_send_buffer_size(&self, _bytes: usize) -> Tuning {
            Tuning::Applied
        }
    }

    /// Conn relying on the default (refusing) tuning methods.
    struct Plain;

    #[async_trait]
    impl PacketConn for Plain {
        async fn send_to(&self, buf: &[u8], _addr: SocketAddr) -> TransportResult<usize> {
            Ok(buf.len())
        }

        async fn recv_from(&self, _buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
            Err(TransportError::Closed)
        }

        fn local_addr(&self) -> TransportResult<SocketAddr> {
            Ok("127.0.0.1:1".parse().unwrap())
        }

        async fn close(&self) -> TransportResult<()> {
            Ok(())
        }

        fn is_closed(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Closed;
        assert_eq!(err.to_string(), "Transport is closed");

        let err = TransportError::BindFailed("test".to_string());
        assert!(err.to_string().contains("Failed to bind"));

        let err = TransportError::Resolve("nowhere:1".to_string());
        assert!(err.to_string().contains("nowhere:1"));

        let err = TransportError::AlreadyConfigured;
        assert!(err.to_string().contains("already configured"));

        let err = TransportError::DeadLink;
        assert_eq!(err.to_string(), "Peer stopped responding");
    }

    #[test]
    fn test_transport_error_from_crypto() {
        let err = TransportError::from(CryptoError::RandomFailed);
        assert!(matches!(err, TransportError::Crypto(_)));
    }

    #[test]
    fn test_default_stats_are_zero() {
        let stats = Plain.stats();
        assert_eq!(stats.bytes_sent, 0);
        assert_eq!(stats.packets_received, 0);
        assert_eq!(stats.send_errors + stats.recv_errors, 0);
    }

    #[test]
    fn test_tuning_zero_skips() {
        let conn = Plain;
        let report = TuningReport::apply(&conn, 0, 0);
        assert_eq!(report, TuningReport::skipped());
        assert!(!report.any_rejected());
    }

    #[test]
    fn test_tuning_defaults_reject() {
        let conn = Plain;
        let report = TuningReport::apply(&conn, 46, 1 << 20);
        assert!(report.dscp.is_rejected());
        assert!(report.recv_buffer.is_rejected());
        assert!(report.send_buffer.is_rejected());
    }

    #[test]
    fn test_tuning_applied() {
        let conn = Compliant(AtomicBool::new(false));
        let report = TuningReport::apply(&conn, 46, 0);
        assert_eq!(report.dscp, Tuning::Applied);
        assert_eq!(report.recv_buffer, Tuning::Skipped);
        assert!(!report.any_rejected());
    }

    #[tokio::test]
    async fn test_close_flag() {
        let conn = Compliant(AtomicBool::new(false));
        assert!(!conn.is_closed());
        conn.close().await.unwrap();
        assert!(conn.is_closed());
    }
}
