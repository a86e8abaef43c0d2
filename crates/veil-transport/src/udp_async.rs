//! Async UDP packet conn.
//!
//! This module provides the UDP implementation of `PacketConn` using
//! Tokio, with socket2 for socket setup and the best-effort DSCP and
//! buffer tuning sessions ask for.

use crate::transport::{PacketConn, TransportError, TransportResult, TransportStats, Tuning};
use async_trait::async_trait;
use parking_lot::Mutex;
use socket2::SockRef;
use std::future::poll_fn;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::Poll;
use tokio::io::ReadBuf;
use tokio::net::UdpSocket;
use tokio::sync::watch;

/// Async UDP packet conn using Tokio.
///
/// Cloning yields another handle to the same socket. Closing any handle
/// closes all of them, wakes every pending `recv_from` and releases the
/// socket, so the address can be bound again as soon as `close` returns.
///
/// Only one task should receive at a time: a second concurrent
/// `recv_from` takes over the read wakeup from the first.
///
/// # Examples
///
/// ```no_run
/// use veil_transport::udp_async::UdpPacketConn;
/// use veil_transport::transport::PacketConn;
/// use std::net::SocketAddr;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: SocketAddr = "127.0.0.1:0".parse()?;
/// let conn = UdpPacketConn::bind(addr).await?;
/// println!("Listening on {}", conn.local_addr()?);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct UdpPacketConn {
    // Never locked across an await; polls borrow the socket one step at a time.
    socket: Arc<Mutex<Option<UdpSocket>>>,
    closed: Arc<watch::Sender<bool>>,
    bytes_sent: Arc<AtomicU64>,
    bytes_received: Arc<AtomicU64>,
    packets_sent: Arc<AtomicU64>,
    packets_received: Arc<AtomicU64>,
    send_errors: Arc<AtomicU64>,
    recv_errors: Arc<AtomicU64>,
}

impl UdpPacketConn {
    /// Bind a new UDP socket to `addr`.
    ///
    /// Kernel buffer sizes are left at the OS default; sessions size them
    /// through [`PacketConn::set_recv_buffer_size`] when configured to.
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if binding fails
    pub async fn bind<A: Into<SocketAddr>>(addr: A) -> TransportResult<Self> {
        let addr = addr.into();

        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };

        let socket2 =
            socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
                .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        socket2
            .bind(&addr.into())
            .map_err(|e| TransportError::BindFailed(format!("{addr}: {e}")))?;

        // Convert to std socket, then to tokio socket
        socket2
            .set_nonblocking(true)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        let std_socket: std::net::UdpSocket = socket2.into();
        let socket = UdpSocket::from_std(std_socket)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        Ok(Self::from_socket(socket))
    }

    /// Create from an existing Tokio UdpSocket.
    #[must_use]
    pub fn from_socket(socket: UdpSocket) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            socket: Arc::new(Mutex::new(Some(socket))),
            closed: Arc::new(closed),
            bytes_sent: Arc::new(AtomicU64::new(0)),
            bytes_received: Arc::new(AtomicU64::new(0)),
            packets_sent: Arc::new(AtomicU64::new(0)),
            packets_received: Arc::new(AtomicU64::new(0)),
            send_errors: Arc::new(AtomicU64::new(0)),
            recv_errors: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Run `f` against the open socket.
    fn with_socket<T>(&self, f: impl FnOnce(&UdpSocket) -> T) -> TransportResult<T> {
        self.socket
            .lock()
            .as_ref()
            .map(f)
            .ok_or(TransportError::Closed)
    }

    fn tune(&self, what: &str, f: impl FnOnce(SockRef<'_>) -> std::io::Result<()>) -> Tuning {
        match self.with_socket(|socket| f(SockRef::from(socket))) {
            Ok(Ok(())) => Tuning::Applied,
            Ok(Err(e)) => Tuning::Rejected(format!("{what}: {e}")),
            Err(e) => Tuning::Rejected(format!("{what}: {e}")),
        }
    }
}

#[cfg(any(
    target_os = "android",
    target_os = "freebsd",
    target_os = "linux",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd",
))]
fn set_traffic_class(sock: &SockRef<'_>, tclass: u32) -> std::io::Result<()> {
    sock.set_tclass_v6(tclass)
}

#[cfg(not(any(
    target_os = "android",
    target_os = "freebsd",
    target_os = "linux",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd",
)))]
fn set_traffic_class(_sock: &SockRef<'_>, _tclass: u32) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "traffic class marking is not available on this platform",
    ))
}

#[async_trait]
impl PacketConn for UdpPacketConn {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        let result = poll_fn(|cx| match self.socket.lock().as_ref() {
            Some(socket) => socket.poll_send_to(cx, buf, addr).map_err(TransportError::Io),
            None => Poll::Ready(Err(TransportError::Closed)),
        })
        .await;

        match result {
            Ok(sent) => {
                self.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
                self.packets_sent.fetch_add(1, Ordering::Relaxed);
                Ok(sent)
            }
            Err(TransportError::Closed) => Err(TransportError::Closed),
            Err(e) => {
                self.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(TransportError::Closed);
        }

        let mut read = ReadBuf::new(buf);
        let recv = poll_fn(|cx| match self.socket.lock().as_ref() {
            Some(socket) => match socket.poll_recv_from(cx, &mut read) {
                Poll::Ready(Ok(from)) => Poll::Ready(Ok((read.filled().len(), from))),
                Poll::Ready(Err(e)) => Poll::Ready(Err(TransportError::Io(e))),
                Poll::Pending => Poll::Pending,
            },
            None => Poll::Ready(Err(TransportError::Closed)),
        });

        tokio::select! {
            result = recv => match result {
                Ok((size, addr)) => {
                    self.bytes_received.fetch_add(size as u64, Ordering::Relaxed);
                    self.packets_received.fetch_add(1, Ordering::Relaxed);
                    Ok((size, addr))
                }
                Err(TransportError::Closed) => Err(TransportError::Closed),
                Err(e) => {
                    self.recv_errors.fetch_add(1, Ordering::Relaxed);
                    Err(e)
                }
            },
            _ = closed.changed() => Err(TransportError::Closed),
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.with_socket(UdpSocket::local_addr)?
            .map_err(TransportError::Io)
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.send_replace(true);
        let socket = self.socket.lock().take();
        if let Some(socket) = socket {
            tracing::debug!(local = ?socket.local_addr().ok(), "udp socket released");
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
            send_errors: self.send_errors.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
        }
    }

    fn set_dscp(&self, dscp: u8) -> Tuning {
        if dscp > 63 {
            return Tuning::Rejected(format!("dscp {dscp} out of range"));
        }
        let tos = u32::from(dscp) << 2;
        match self.local_addr() {
            Ok(SocketAddr::V4(_)) => self.tune("IP_TOS", |sock| sock.set_tos_v4(tos)),
            Ok(SocketAddr::V6(_)) => {
                self.tune("IPV6_TCLASS", |sock| set_traffic_class(&sock, tos))
            }
            Err(e) => Tuning::Rejected(e.to_string()),
        }
    }

    fn set_recv_buffer_size(&self, bytes: usize) -> Tuning {
        self.tune("SO_RCVBUF", |sock| sock.set_recv_buffer_size(bytes))
    }

    fn set_send_buffer_size(&self, bytes: usize) -> Tuning {
        self.tune("SO_SNDBUF", |sock| sock.set_send_buffer_size(bytes))
    }
}
