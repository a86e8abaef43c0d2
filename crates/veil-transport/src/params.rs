//! Immutable session parameter snapshots.

use crate::transport::{TransportError, TransportResult};

/// Fixed KCP segment header size.
pub const KCP_HEADER_SIZE: usize = 24;

/// Smallest MTU the KCP engine accepts.
pub const KCP_MIN_MTU: usize = 50;

/// Retransmissions of one segment before a session gives up on its peer.
pub const DEFAULT_DEAD_LINK: u32 = 20;

/// Transport parameters applied once to each session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionParams {
    /// Disable the minimum RTO clamp and retransmit aggressively.
    pub nodelay: bool,
    /// Internal update interval in milliseconds.
    pub interval: u32,
    /// Fast-retransmit trigger (duplicate ACK count, 0 disables).
    pub resend: u32,
    /// Disable congestion control.
    pub nc: bool,
    /// Send window in packets.
    pub snd_wnd: u16,
    /// Receive window in packets.
    pub rcv_wnd: u16,
    /// Datagram MTU including the crypto header.
    pub mtu: usize,
    /// Flush ACKs as soon as input arrives.
    pub ack_nodelay: bool,
    /// Transmissions of one segment without an ACK after which the peer
    /// is considered gone.
    pub dead_link: u32,
}

impl SessionParams {
    /// Check the parameters against a codec adding `overhead` bytes.
    ///
    /// # Errors
    /// `TransportError::InvalidConfig` naming the offending field.
    pub fn validate(&self, overhead: usize) -> TransportResult<()> {
        if self.mtu < overhead + KCP_MIN_MTU.max(KCP_HEADER_SIZE + 1) {
            return Err(TransportError::InvalidConfig(format!(
                "mtu {} leaves no room after {} header bytes",
                self.mtu,
                overhead + KCP_HEADER_SIZE
            )));
        }
        if self.snd_wnd == 0 || self.rcv_wnd == 0 {
            return Err(TransportError::InvalidConfig(
                "window sizes must be non-zero".to_string(),
            ));
        }
        if self.interval == 0 {
            return Err(TransportError::InvalidConfig(
                "update interval must be non-zero".to_string(),
            ));
        }
        self.engine_timing()?;
        if self.dead_link == 0 {
            return Err(TransportError::InvalidConfig(
                "dead link threshold must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Interval and resend in the signed form the KCP engine takes.
    ///
    /// # Errors
    /// `TransportError::InvalidConfig` if either exceeds `i32::MAX`.
    pub fn engine_timing(&self) -> TransportResult<(i32, i32)> {
        let signed = |name: &str, value: u32| {
            i32::try_from(value).map_err(|_| {
                TransportError::InvalidConfig(format!("{name} {value} exceeds {}", i32::MAX))
            })
        };
        Ok((signed("interval", self.interval)?, signed("resend", self.resend)?))
    }

    /// MTU handed to the KCP engine once the crypto header is reserved.
    #[must_use]
    pub fn kcp_mtu(&self, overhead: usize) -> usize {
        self.mtu.saturating_sub(overhead)
    }

    /// Largest user payload that fits a single segment.
    #[must_use]
    pub fn mss(&self, overhead: usize) -> usize {
        self.kcp_mtu(overhead).saturating_sub(KCP_HEADER_SIZE)
    }
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            nodelay: false,
            interval: 40,
            resend: 2,
            nc: true,
            snd_wnd: 1024,
            rcv_wnd: 4096,
            mtu: 1200,
            ack_nodelay: false,
            dead_link: DEFAULT_DEAD_LINK,
        }
    }
}

/// Forward-error-correction shard counts carried by a session.
///
/// No FEC coding is performed; the counts are recorded so both sides can
/// report the configuration they were built with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FecShards {
    /// Data shards per group.
    pub data: usize,
    /// Parity shards per group.
    pub parity: usize,
}

impl FecShards {
    /// Shard counts `data`/`parity`.
    #[must_use]
    pub fn new(data: usize, parity: usize) -> Self {
        Self { data, parity }
    }
}
