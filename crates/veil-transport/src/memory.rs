//! In-process packet network.
//!
//! [`MemoryNetwork`] routes datagrams between [`MemoryPacketConn`]s
//! without touching the OS. It can drop and delay datagrams, which makes
//! it the harness for exercising retransmission, and it refuses every
//! socket tuning request the way a restricted environment would.

use crate::transport::{PacketConn, TransportError, TransportResult, TransportStats, Tuning};
use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};

type Datagram = (Vec<u8>, SocketAddr);

const NETWORK_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
const FIRST_PORT: u16 = 10_000;

struct NetworkInner {
    endpoints: DashMap<SocketAddr, mpsc::UnboundedSender<Datagram>>,
    next_port: AtomicU16,
    loss: f64,
    delay: Duration,
}

impl NetworkInner {
    fn deliver(self: &Arc<Self>, datagram: Vec<u8>, from: SocketAddr, to: SocketAddr) {
        if self.loss > 0.0 && rand::thread_rng().gen_bool(self.loss) {
            tracing::trace!(%from, %to, len = datagram.len(), "memory network dropped datagram");
            return;
        }
        if self.delay.is_zero() {
            self.route(datagram, from, to);
        } else {
            let net = Arc::clone(self);
            let delay = self.delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                net.route(datagram, from, to);
            });
        }
    }

    fn route(&self, datagram: Vec<u8>, from: SocketAddr, to: SocketAddr) {
        // Unknown destinations behave like an unreachable UDP peer.
        if let Some(tx) = self.endpoints.get(&to) {
            let _ = tx.send((datagram, from));
        }
    }
}

/// A shared in-process network.
///
/// Cloning yields another handle to the same network.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    /// Lossless network with no added latency.
    #[must_use]
    pub fn new() -> Self {
        Self::lossy(0.0, Duration::ZERO)
    }

    /// Network that drops each datagram with probability `loss` and
    /// delivers the rest after `delay`.
    #[must_use]
    pub fn lossy(loss: f64, delay: Duration) -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                endpoints: DashMap::new(),
                next_port: AtomicU16::new(FIRST_PORT),
                loss: loss.clamp(0.0, 1.0),
                delay,
            }),
        }
    }

    /// Attach a new conn at the next free address.
    #[must_use]
    pub fn bind(&self) -> MemoryPacketConn {
        let port = self.inner.next_port.fetch_add(1, Ordering::Relaxed);
        let addr = SocketAddr::new(NETWORK_IP, port);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.endpoints.insert(addr, tx);
        let (closed, _) = watch::channel(false);
        MemoryPacketConn {
            addr,
            net: Arc::clone(&self.inner),
            rx: Mutex::new(rx),
            closed,
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
        }
    }

    /// Number of attached, open conns.
    #[must_use]
    pub fn endpoints(&self) -> usize {
        self.inner.endpoints.len()
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint on a [`MemoryNetwork`].
pub struct MemoryPacketConn {
    addr: SocketAddr,
    net: Arc<NetworkInner>,
    rx: Mutex<mpsc::UnboundedReceiver<Datagram>>,
    closed: watch::Sender<bool>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
}

#[async_trait]
impl PacketConn for MemoryPacketConn {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.bytes_sent.fetch_add(buf.len() as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.net.deliver(buf.to_vec(), self.addr, addr);
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(TransportError::Closed);
        }
        let mut rx = self.rx.lock().await;
        let (datagram, from) = tokio::select! {
            item = rx.recv() => item.ok_or(TransportError::Closed)?,
            _ = closed.changed() => return Err(TransportError::Closed),
        };
        // Oversized datagrams are truncated, as with a short UDP buffer.
        let n = datagram.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram[..n]);
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        Ok((n, from))
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.addr)
    }

    async fn close(&self) -> TransportResult<()> {
        if !self.closed.send_replace(true) {
            self.net.endpoints.remove(&self.addr);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            send_errors: 0,
            recv_errors: 0,
        }
    }

    fn set_dscp(&self, _dscp: u8) -> Tuning {
        Tuning::Rejected("in-memory network carries no IP header".to_string())
    }
}

impl Drop for MemoryPacketConn {
    fn drop(&mut self) {
        self.net.endpoints.remove(&self.addr);
    }
}
