//! Server-side session demultiplexing.
//!
//! A [`Listener`] owns one packet conn. Its input task decodes every
//! datagram, keys it by `(source address, conversation id)` and feeds the
//! matching session, creating a new one for unknown keys and queueing it
//! for [`Listener::accept`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc, watch};

use crate::codec::DatagramCodec;
use crate::params::{FecShards, KCP_HEADER_SIZE};
use crate::session::{
    MAX_DATAGRAM, RECV_BACKOFF, Role, Session, SessionInner, is_close_segment,
};
use crate::transport::{SharedConn, TransportError, TransportResult, TuningReport};

/// Sessions waiting for `accept`.
const ACCEPT_BACKLOG: usize = 128;

/// How long a closed session's key keeps absorbing stray segments.
const TOMBSTONE_TTL: Duration = Duration::from_secs(30);

/// Tombstone count that triggers pruning.
const TOMBSTONE_PRUNE_AT: usize = 1024;

type SessionKey = (SocketAddr, u32);

struct ListenerInner {
    conn: SharedConn,
    codec: DatagramCodec,
    fec: FecShards,
    sessions: DashMap<SessionKey, Arc<SessionInner>>,
    tombstones: DashMap<SessionKey, Instant>,
    accept_tx: mpsc::Sender<TransportResult<Session>>,
    accept_rx: Mutex<mpsc::Receiver<TransportResult<Session>>>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
    tuning: parking_lot::Mutex<Option<TuningReport>>,
}

impl ListenerInner {
    fn is_shut(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn dispatch(self: &Arc<Self>, datagram: &mut [u8], from: SocketAddr) {
        let Some(payload) = self.codec.decode(datagram) else {
            tracing::trace!(%from, len = datagram.len(), "dropped undecodable datagram");
            return;
        };
        if payload.len() < KCP_HEADER_SIZE {
            tracing::trace!(%from, len = payload.len(), "dropped runt segment");
            return;
        }
        let conv = kcp::get_conv(payload);
        let key = (from, conv);

        let existing = self.sessions.get(&key).map(|entry| Arc::clone(entry.value()));
        if let Some(session) = existing {
            session.input(payload);
            return;
        }
        if is_close_segment(payload) {
            return;
        }
        if self.is_tombstoned(&key) {
            tracing::trace!(%from, conv, "segment for closed session");
            return;
        }

        let session = SessionInner::new(
            conv,
            from,
            Arc::clone(&self.conn),
            false,
            Role::Accepted,
            self.codec.clone(),
            self.fec,
        );
        let weak = Arc::downgrade(self);
        session.set_on_close(Box::new(move || {
            if let Some(listener) = weak.upgrade() {
                listener.sessions.remove(&key);
                listener.tombstone(key);
            }
        }));
        session.input(payload);

        match self.accept_tx.try_send(Ok(Session::from_inner(Arc::clone(&session)))) {
            Ok(()) => {
                self.sessions.insert(key, session);
                tracing::info!(%from, conv, suite = self.codec.suite_name(), "new session");
            }
            Err(_) => {
                // Dropping the refused session must not tombstone its key,
                // so the peer's retransmissions can try again.
                session.clear_on_close();
                tracing::warn!(%from, conv, "accept backlog full, refusing session");
            }
        }
    }

    fn is_tombstoned(&self, key: &SessionKey) -> bool {
        match self.tombstones.get(key).map(|at| at.elapsed()) {
            Some(age) if age < TOMBSTONE_TTL => true,
            Some(_) => {
                self.tombstones.remove(key);
                false
            }
            None => false,
        }
    }

    fn tombstone(&self, key: SessionKey) {
        if self.tombstones.len() >= TOMBSTONE_PRUNE_AT {
            self.tombstones.retain(|_, at| at.elapsed() < TOMBSTONE_TTL);
        }
        self.tombstones.insert(key, Instant::now());
    }

    async fn run_input(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut buf = vec![0u8; MAX_DATAGRAM];
        while !self.is_shut() {
            let result = tokio::select! {
                result = self.conn.recv_from(&mut buf) => result,
                _ = shutdown.changed() => break,
            };
            match result {
                Ok((n, from)) => self.dispatch(&mut buf[..n], from),
                Err(TransportError::Closed) => {
                    tracing::debug!("listener conn closed");
                    self.shutdown.send_replace(true);
                    break;
                }
                Err(e) => {
                    // Surfaced through accept; the loop keeps serving.
                    let _ = self.accept_tx.try_send(Err(e));
                    tokio::time::sleep(RECV_BACKOFF).await;
                }
            }
        }
    }
}

/// Accepts sessions arriving on one packet conn.
pub struct Listener {
    inner: Arc<ListenerInner>,
}

impl Listener {
    /// Start demultiplexing `conn`. Must be called within a Tokio runtime.
    pub(crate) fn start(conn: SharedConn, codec: DatagramCodec, fec: FecShards) -> Self {
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(ListenerInner {
            conn,
            codec,
            fec,
            sessions: DashMap::new(),
            tombstones: DashMap::new(),
            accept_tx,
            accept_rx: Mutex::new(accept_rx),
            shutdown,
            closed: AtomicBool::new(false),
            tuning: parking_lot::Mutex::new(None),
        });
        tokio::spawn(Arc::clone(&inner).run_input());
        Self { inner }
    }

    /// Wait for the next new session.
    ///
    /// The returned session is not configured yet; segments it receives
    /// in the meantime are held.
    ///
    /// # Errors
    /// `TransportError::Closed` once the listener (or its conn) is closed;
    /// other variants report receive failures and are transient.
    pub async fn accept(&self) -> TransportResult<Session> {
        let mut shutdown = self.inner.shutdown.subscribe();
        if *shutdown.borrow() {
            return Err(TransportError::Closed);
        }
        let mut rx = self.inner.accept_rx.lock().await;
        tokio::select! {
            item = rx.recv() => item.unwrap_or(Err(TransportError::Closed)),
            _ = shutdown.changed() => Err(TransportError::Closed),
        }
    }

    /// Local address of the conn.
    ///
    /// # Errors
    /// Propagates the conn's error.
    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.inner.conn.local_addr()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Best-effort DSCP and buffer tuning of the listening conn.
    pub fn tune_socket(&self, dscp: u8, sockbuf: usize) -> TuningReport {
        let report = TuningReport::apply(self.inner.conn.as_ref(), dscp, sockbuf);
        *self.inner.tuning.lock() = Some(report.clone());
        report
    }

    /// Outcome of the last [`tune_socket`](Self::tune_socket) call.
    #[must_use]
    pub fn tuning_report(&self) -> Option<TuningReport> {
        self.inner.tuning.lock().clone()
    }

    /// True once closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop accepting, close every live session and close the conn.
    /// Idempotent; a pending `accept` returns `Closed`.
    ///
    /// # Errors
    /// Propagates a failure closing the conn.
    pub async fn close(&self) -> TransportResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.shutdown.send_replace(true);

        let live: Vec<Arc<SessionInner>> = self
            .inner
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.inner.sessions.clear();
        for session in &live {
            session.clear_on_close();
            if let Err(e) = session.close(false).await {
                tracing::debug!(error = %e, "session close failed");
            }
        }
        tracing::info!(sessions = live.len(), "listener closed");
        self.inner.conn.close().await
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("suite", &self.inner.codec.suite_name())
            .field("sessions", &self.inner.sessions.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNetwork;
    use crate::params::SessionParams;
    use crate::session::close_segment;
    use crate::transport::PacketConn;
    use tokio::time::timeout;
    use veil_crypto::resolve;

    fn codec() -> DatagramCodec {
        DatagramCodec::new(resolve("listener-seed", "salsa20").unwrap())
    }

    fn dialer(net: &MemoryNetwork, server: SocketAddr, conv: u32) -> Session {
        let conn: SharedConn = Arc::new(net.bind());
        Session::from_inner(SessionInner::new(
            conv,
            server,
            conn,
            true,
            Role::Dialer,
            codec(),
            FecShards::default(),
        ))
    }

    #[tokio::test]
    async fn test_accept_and_echo() {
        let net = MemoryNetwork::new();
        let listener = Listener::start(Arc::new(net.bind()), codec(), FecShards::new(10, 3));
        let server_addr = listener.local_addr().unwrap();

        let client = dialer(&net, server_addr, 42);
        client.configure(&SessionParams::default()).unwrap();
        client.write(b"hello").await.unwrap();

        let session = timeout(Duration::from_secs(2), listener.accept())
            .await
            .expect("Timeout")
            .unwrap();
        assert_eq!(session.conv(), 42);
        assert_eq!(session.fec(), FecShards::new(10, 3));
        session.configure(&SessionParams::default()).unwrap();

        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(2), session.read(&mut buf))
            .await
            .expect("Timeout")
            .unwrap();
        assert_eq!(&buf[..n], b"hello");

        session.write(&buf[..n]).await.unwrap();
        let n = timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("Timeout")
            .unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(listener.session_count(), 1);
    }

    #[tokio::test]
    async fn test_distinct_convs_are_distinct_sessions() {
        let net = MemoryNetwork::new();
        let listener = Listener::start(Arc::new(net.bind()), codec(), FecShards::default());
        let server_addr = listener.local_addr().unwrap();

        let a = dialer(&net, server_addr, 1);
        let b = dialer(&net, server_addr, 2);
        for s in [&a, &b] {
            s.configure(&SessionParams::default()).unwrap();
            s.write(b"hi").await.unwrap();
        }

        let first = timeout(Duration::from_secs(2), listener.accept()).await.unwrap().unwrap();
        let second = timeout(Duration::from_secs(2), listener.accept()).await.unwrap().unwrap();
        assert_ne!(first.conv(), second.conv());
    }

    #[tokio::test]
    async fn test_stray_close_segment_ignored() {
        let net = MemoryNetwork::new();
        let listener = Listener::start(Arc::new(net.bind()), codec(), FecShards::default());
        let stray = net.bind();
        let datagram = codec().encode(&close_segment(5)).unwrap();
        stray.send_to(&datagram, listener.local_addr().unwrap()).await.unwrap();

        assert!(
            timeout(Duration::from_millis(100), listener.accept())
                .await
                .is_err()
        );
        assert_eq!(listener.session_count(), 0);
    }

    #[tokio::test]
    async fn test_garbage_ignored() {
        let net = MemoryNetwork::new();
        let listener = Listener::start(Arc::new(net.bind()), codec(), FecShards::default());
        let stray = net.bind();
        stray
            .send_to(&[0xFFu8; 100], listener.local_addr().unwrap())
            .await
            .unwrap();
        assert!(
            timeout(Duration::from_millis(100), listener.accept())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_close_unblocks_accept() {
        let net = MemoryNetwork::new();
        let listener = Arc::new(Listener::start(
            Arc::new(net.bind()),
            codec(),
            FecShards::default(),
        ));
        let waiting = Arc::clone(&listener);
        let pending = tokio::spawn(async move { waiting.accept().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        listener.close().await.unwrap();
        listener.close().await.unwrap();

        let result = timeout(Duration::from_secs(1), pending)
            .await
            .expect("accept did not wake")
            .unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
        assert!(matches!(listener.accept().await, Err(TransportError::Closed)));
        assert_eq!(net.endpoints(), 0);
    }

    #[tokio::test]
    async fn test_session_close_deregisters() {
        let net = MemoryNetwork::new();
        let listener = Listener::start(Arc::new(net.bind()), codec(), FecShards::default());
        let client = dialer(&net, listener.local_addr().unwrap(), 77);
        client.configure(&SessionParams::default()).unwrap();
        client.write(b"x").await.unwrap();

        let session = timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();
        session.configure(&SessionParams::default()).unwrap();
        assert_eq!(listener.session_count(), 1);
        session.close().await.unwrap();
        assert_eq!(listener.session_count(), 0);
        assert!(listener.inner.is_tombstoned(&(client.local_addr().unwrap(), 77)));
    }

    #[tokio::test]
    async fn test_unresponsive_peer_deregisters() {
        let net = MemoryNetwork::new();
        let listener = Listener::start(Arc::new(net.bind()), codec(), FecShards::default());
        let conn: SharedConn = Arc::new(net.bind());
        let client_addr = conn.local_addr().unwrap();
        let client = Session::from_inner(SessionInner::new(
            78,
            listener.local_addr().unwrap(),
            Arc::clone(&conn),
            true,
            Role::Dialer,
            codec(),
            FecShards::default(),
        ));
        client.configure(&SessionParams::default()).unwrap();
        client.write(b"x").await.unwrap();

        let session = timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();
        session
            .configure(&SessionParams {
                dead_link: 3,
                ..SessionParams::default()
            })
            .unwrap();
        let mut buf = [0u8; 8];
        timeout(Duration::from_secs(2), session.read(&mut buf))
            .await
            .expect("Timeout")
            .unwrap();

        // The client vanishes without sending a close segment.
        conn.close().await.unwrap();
        session.write(b"anyone there?").await.unwrap();

        let result = timeout(Duration::from_secs(5), session.read(&mut buf))
            .await
            .expect("dead peer never detected");
        assert!(matches!(result, Err(TransportError::DeadLink)));
        assert_eq!(listener.session_count(), 0);
        assert!(listener.inner.is_tombstoned(&(client_addr, 78)));
    }
}
