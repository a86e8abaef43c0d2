//! Session and listener constructors.
//!
//! These are the entry points the client factories and server accept
//! loop build on: dial a remote over a fresh or supplied packet conn, or
//! listen on an address or a supplied conn.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use veil_crypto::CipherInstance;

use crate::codec::DatagramCodec;
use crate::listener::Listener;
use crate::params::FecShards;
use crate::session::{Role, Session, SessionInner};
use crate::transport::{SharedConn, TransportError, TransportResult};
use crate::udp_async::UdpPacketConn;

/// Resolve `addr` (`host:port`) to its first address.
///
/// # Errors
/// `TransportError::Resolve` if the lookup fails or yields nothing.
pub async fn resolve_addr(addr: &str) -> TransportResult<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await
        .map_err(|e| TransportError::Resolve(format!("{addr}: {e}")))?
        .next()
        .ok_or_else(|| TransportError::Resolve(format!("{addr}: no addresses")))
}

/// Wildcard address of the same family as `remote`, any port.
#[must_use]
pub fn unspecified_for(remote: SocketAddr) -> SocketAddr {
    let ip = match remote {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}

/// Dial `remote` over a fresh UDP socket the session owns.
///
/// The session is returned unconfigured.
///
/// # Errors
/// `Resolve` or `BindFailed`.
pub async fn dial(
    remote: &str,
    crypt: Option<CipherInstance>,
    fec: FecShards,
    conv: u32,
) -> TransportResult<Session> {
    let remote = resolve_addr(remote).await?;
    let conn = UdpPacketConn::bind(unspecified_for(remote)).await?;
    Ok(dial_with_conv(conv, remote, crypt, fec, Arc::new(conn), true))
}

/// Build a session to `remote` over `conn`.
///
/// With `owns_conn` the session closes `conn` when it closes. The session
/// reads `conn` itself once configured, so `conn` must not be shared with
/// another reader.
#[must_use]
pub fn dial_with_conv(
    conv: u32,
    remote: SocketAddr,
    crypt: Option<CipherInstance>,
    fec: FecShards,
    conn: SharedConn,
    owns_conn: bool,
) -> Session {
    tracing::debug!(conv, %remote, "dialing");
    Session::from_inner(SessionInner::new(
        conv,
        remote,
        conn,
        owns_conn,
        Role::Dialer,
        DatagramCodec::new(crypt),
        fec,
    ))
}

/// Listen on `addr` over a fresh UDP socket.
///
/// # Errors
/// `Resolve` or `BindFailed`.
pub async fn listen(
    addr: &str,
    crypt: Option<CipherInstance>,
    fec: FecShards,
) -> TransportResult<Listener> {
    let addr = resolve_addr(addr).await?;
    let conn = UdpPacketConn::bind(addr).await?;
    serve_conn(crypt, fec, Arc::new(conn))
}

/// Listen on a caller-supplied conn. The listener closes it on close.
///
/// Must be called within a Tokio runtime.
///
/// # Errors
/// `Closed` if `conn` is already closed.
pub fn serve_conn(
    crypt: Option<CipherInstance>,
    fec: FecShards,
    conn: SharedConn,
) -> TransportResult<Listener> {
    if conn.is_closed() {
        return Err(TransportError::Closed);
    }
    let local = conn.local_addr()?;
    let listener = Listener::start(conn, DatagramCodec::new(crypt), fec);
    tracing::info!(%local, "listening");
    Ok(listener)
}
