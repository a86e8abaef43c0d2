//! Reliable sessions driven by a KCP control block.
//!
//! A [`Session`] is built from an identity (conversation id and remote
//! address), a packet conn, a codec and FEC shard counts. It carries no
//! traffic until [`Session::configure`] applies an immutable
//! [`SessionParams`] snapshot; inbound segments arriving earlier are held
//! and replayed once parameters are in place.
//!
//! Each configured session runs:
//! - a timer task calling `update` on the control block,
//! - an output task encoding and sending whatever KCP flushes,
//! - for dialed sessions, an input task reading the conn.
//!
//! Accepted sessions are fed by their listener instead.

use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use kcp::Kcp;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc, watch};

use crate::codec::DatagramCodec;
use crate::params::{FecShards, KCP_HEADER_SIZE, SessionParams};
use crate::transport::{
    SharedConn, TransportError, TransportResult, TransportStats, Tuning, TuningReport,
};

/// Command byte of the out-of-band close segment.
pub const CLOSE_CMD: u8 = 0x60;

/// Times the close segment is sent.
const CLOSE_REPEAT: usize = 3;

/// Longest a closing session waits for unacknowledged data.
const LINGER: Duration = Duration::from_secs(1);
const LINGER_POLL: Duration = Duration::from_millis(10);

/// Segments held for a session that is not configured yet.
const BACKLOG_LIMIT: usize = 256;

/// Pause after a transient receive error.
pub(crate) const RECV_BACKOFF: Duration = Duration::from_millis(10);

/// Receive buffer for one datagram.
pub(crate) const MAX_DATAGRAM: usize = 64 * 1024;

/// Build the close segment for `conv`.
#[must_use]
pub fn close_segment(conv: u32) -> [u8; KCP_HEADER_SIZE] {
    let mut segment = [0u8; KCP_HEADER_SIZE];
    segment[..4].copy_from_slice(&conv.to_le_bytes());
    segment[4] = CLOSE_CMD;
    segment
}

/// True if `payload` is a close segment.
#[must_use]
pub fn is_close_segment(payload: &[u8]) -> bool {
    payload.len() == KCP_HEADER_SIZE && payload[4] == CLOSE_CMD
}

/// KCP output adapter: every flushed datagram goes to the output task.
struct OutputSink(mpsc::UnboundedSender<Vec<u8>>);

impl Write for OutputSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // A gone receiver means the session shut down; drop silently.
        let _ = self.0.send(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Who reads the packet conn for this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    /// The session runs its own input task.
    Dialer,
    /// A listener demultiplexes into the session.
    Accepted,
}

struct KcpState {
    kcp: Kcp<OutputSink>,
    params: Option<SessionParams>,
    backlog: Vec<Vec<u8>>,
    pending: Vec<u8>,
    pending_pos: usize,
    peer_closed: bool,
}

impl KcpState {
    /// Copy from the partially delivered message, if any.
    fn take_pending(&mut self, buf: &mut [u8]) -> Option<usize> {
        let rest = &self.pending[self.pending_pos..];
        if rest.is_empty() {
            return None;
        }
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        self.pending_pos += n;
        if self.pending_pos == self.pending.len() {
            self.pending.clear();
            self.pending_pos = 0;
        }
        Some(n)
    }
}

type CloseHook = Box<dyn FnOnce() + Send>;

pub(crate) struct SessionInner {
    conv: u32,
    remote: SocketAddr,
    conn: SharedConn,
    owns_conn: bool,
    role: Role,
    codec: DatagramCodec,
    fec: FecShards,
    state: Mutex<KcpState>,
    output_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    readable: Notify,
    writable: Notify,
    shutdown: watch::Sender<bool>,
    closing: AtomicBool,
    dead: AtomicBool,
    dropped: AtomicU64,
    tuning: Mutex<Option<TuningReport>>,
    on_close: Mutex<Option<CloseHook>>,
    epoch: Instant,
}

impl SessionInner {
    pub(crate) fn new(
        conv: u32,
        remote: SocketAddr,
        conn: SharedConn,
        owns_conn: bool,
        role: Role,
        codec: DatagramCodec,
        fec: FecShards,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            conv,
            remote,
            conn,
            owns_conn,
            role,
            codec,
            fec,
            state: Mutex::new(KcpState {
                kcp: Kcp::new(conv, OutputSink(tx)),
                params: None,
                backlog: Vec::new(),
                pending: Vec::new(),
                pending_pos: 0,
                peer_closed: false,
            }),
            output_rx: Mutex::new(Some(rx)),
            readable: Notify::new(),
            writable: Notify::new(),
            shutdown,
            closing: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            tuning: Mutex::new(None),
            on_close: Mutex::new(None),
            epoch: Instant::now(),
        })
    }

    pub(crate) fn set_on_close(&self, hook: CloseHook) {
        *self.on_close.lock() = Some(hook);
    }

    pub(crate) fn clear_on_close(&self) {
        self.on_close.lock().take();
    }

    fn clock(&self) -> u32 {
        // KCP timestamps are 32-bit milliseconds and compared with wrapping.
        self.epoch.elapsed().as_millis() as u32
    }

    fn is_shut(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub(crate) fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Feed one decoded KCP payload.
    pub(crate) fn input(&self, payload: &[u8]) {
        let mut state = self.state.lock();
        if state.params.is_none() {
            if state.backlog.len() < BACKLOG_LIMIT {
                state.backlog.push(payload.to_vec());
            } else {
                self.record_drop();
            }
            return;
        }
        let readable = self.input_locked(&mut state, payload);
        drop(state);
        if readable {
            self.readable.notify_one();
        }
        self.writable.notify_one();
    }

    fn input_locked(&self, state: &mut KcpState, payload: &[u8]) -> bool {
        if is_close_segment(payload) {
            if !state.peer_closed {
                tracing::debug!(conv = self.conv, remote = %self.remote, "peer closed session");
            }
            state.peer_closed = true;
            return true;
        }
        if let Err(e) = state.kcp.input(payload) {
            tracing::trace!(conv = self.conv, error = ?e, "segment rejected");
            self.record_drop();
            return false;
        }
        if state.params.is_some_and(|p| p.ack_nodelay) {
            if let Err(e) = state.kcp.flush() {
                tracing::debug!(conv = self.conv, error = ?e, "ack flush failed");
            }
        }
        state.kcp.peeksize().is_ok()
    }

    fn configure(self: &Arc<Self>, params: &SessionParams) -> TransportResult<()> {
        let overhead = self.codec.overhead();
        params.validate(overhead)?;
        let (interval, resend) = params.engine_timing()?;

        let mut state = self.state.lock();
        if state.params.is_some() {
            return Err(TransportError::AlreadyConfigured);
        }
        if self.closing.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        state
            .kcp
            .set_mtu(params.kcp_mtu(overhead))
            .map_err(|e| TransportError::InvalidConfig(format!("{e:?}")))?;
        state.kcp.set_nodelay(params.nodelay, interval, resend, params.nc);
        state.kcp.set_wndsize(params.snd_wnd, params.rcv_wnd);
        state.kcp.set_maximum_resend_times(params.dead_link);
        state.params = Some(*params);
        if let Err(e) = state.kcp.update(self.clock()) {
            tracing::debug!(conv = self.conv, error = ?e, "initial update failed");
        }

        let backlog = std::mem::take(&mut state.backlog);
        let mut readable = false;
        for payload in &backlog {
            readable |= self.input_locked(&mut state, payload);
        }
        drop(state);
        if readable {
            self.readable.notify_one();
        }

        let output_rx = self.output_rx.lock().take();
        if let Some(rx) = output_rx {
            tokio::spawn(Arc::clone(self).run_output(rx));
        }
        tokio::spawn(Arc::clone(self).run_timer(params.interval));
        if self.role == Role::Dialer {
            tokio::spawn(Arc::clone(self).run_input());
        }

        tracing::debug!(
            conv = self.conv,
            remote = %self.remote,
            suite = self.codec.suite_name(),
            mtu = params.mtu,
            snd_wnd = params.snd_wnd,
            rcv_wnd = params.rcv_wnd,
            "session configured"
        );
        Ok(())
    }

    /// Error for I/O on a session that has stopped.
    fn stopped(&self) -> TransportError {
        if self.dead.load(Ordering::Acquire) {
            TransportError::DeadLink
        } else {
            TransportError::Closed
        }
    }

    /// Tear the session down after its peer stopped acknowledging.
    async fn fail_dead_link(&self) {
        self.dead.store(true, Ordering::Release);
        let already_closing = self.closing.swap(true, Ordering::AcqRel);
        // Deregister before shutdown wakes readers.
        if !already_closing {
            let hook = self.on_close.lock().take();
            if let Some(hook) = hook {
                hook();
            }
        }
        self.shutdown.send_replace(true);
        tracing::warn!(
            conv = self.conv,
            remote = %self.remote,
            "peer stopped responding, session dropped"
        );
        if !already_closing && self.owns_conn {
            if let Err(e) = self.conn.close().await {
                tracing::debug!(conv = self.conv, error = %e, "conn close failed");
            }
        }
    }

    async fn run_timer(self: Arc<Self>, interval: u32) {
        let mut shutdown = self.shutdown.subscribe();
        while !self.is_shut() {
            let (wait, dead) = {
                let mut state = self.state.lock();
                if let Err(e) = state.kcp.update(self.clock()) {
                    tracing::debug!(conv = self.conv, error = ?e, "update failed");
                }
                (
                    state.kcp.check(self.clock()).clamp(1, interval),
                    state.kcp.is_dead_link(),
                )
            };
            if dead {
                self.fail_dead_link().await;
                break;
            }
            self.writable.notify_one();
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(u64::from(wait))) => {}
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn run_output(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
        let mut shutdown = self.shutdown.subscribe();
        while !self.is_shut() {
            let packet = tokio::select! {
                packet = rx.recv() => match packet {
                    Some(packet) => packet,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };
            let datagram = match self.codec.encode(&packet) {
                Ok(datagram) => datagram,
                Err(e) => {
                    tracing::warn!(conv = self.conv, error = %e, "failed to encode datagram");
                    continue;
                }
            };
            match self.conn.send_to(&datagram, self.remote).await {
                Ok(_) => {}
                Err(TransportError::Closed) => break,
                Err(e) => {
                    tracing::debug!(conv = self.conv, remote = %self.remote, error = %e, "send failed");
                }
            }
        }
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
                Ok((n, from)) => {
                    if from != self.remote {
                        tracing::trace!(conv = self.conv, %from, "datagram from unexpected peer");
                        continue;
                    }
                    match self.codec.decode(&mut buf[..n]) {
                        Some(payload) => self.input(payload),
                        None => {
                            tracing::trace!(conv = self.conv, len = n, "dropped undecodable datagram");
                            self.record_drop();
                        }
                    }
                }
                Err(TransportError::Closed) => {
                    tracing::debug!(conv = self.conv, "packet conn closed under session");
                    self.closing.store(true, Ordering::Release);
                    self.shutdown.send_replace(true);
                    break;
                }
                Err(e) => {
                    tracing::debug!(conv = self.conv, error = %e, "receive failed");
                    tokio::time::sleep(RECV_BACKOFF).await;
                }
            }
        }
    }

    /// Close the session. With `linger`, wait (bounded) for queued data to
    /// be acknowledged first.
    pub(crate) async fn close(&self, linger: bool) -> TransportResult<()> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let configured = self.state.lock().params.is_some();
        if configured && !self.is_shut() {
            if linger {
                let deadline = Instant::now() + LINGER;
                while Instant::now() < deadline {
                    let idle = self.state.lock().kcp.wait_snd() == 0;
                    if idle {
                        break;
                    }
                    tokio::time::sleep(LINGER_POLL).await;
                }
            }
            match self.codec.encode(&close_segment(self.conv)) {
                Ok(datagram) => {
                    for _ in 0..CLOSE_REPEAT {
                        if self.conn.send_to(&datagram, self.remote).await.is_err() {
                            break;
                        }
                    }
                }
                Err(e) => tracing::debug!(conv = self.conv, error = %e, "close segment not sent"),
            }
        }

        self.shutdown.send_replace(true);
        let hook = self.on_close.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        tracing::debug!(conv = self.conv, remote = %self.remote, "session closed");

        if self.owns_conn {
            self.conn.close().await?;
        }
        Ok(())
    }
}

/// Counters for one session.
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    /// Datagrams discarded for failing decryption, CRC or KCP checks.
    pub dropped_datagrams: u64,
    /// Segments queued or in flight, not yet acknowledged.
    pub waiting_to_send: usize,
    /// Counters of the underlying packet conn.
    pub conn: TransportStats,
}

/// A reliable, ordered, optionally encrypted byte session.
///
/// Dropping a session closes it in the background.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    /// Conversation id shared with the peer.
    #[must_use]
    pub fn conv(&self) -> u32 {
        self.inner.conv
    }

    /// Peer address.
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote
    }

    /// Local address of the underlying conn.
    ///
    /// # Errors
    /// Propagates the conn's error.
    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.inner.conn.local_addr()
    }

    /// FEC shard counts the session was built with.
    #[must_use]
    pub fn fec(&self) -> FecShards {
        self.inner.fec
    }

    /// Cipher suite name, `"null"` when unencrypted.
    #[must_use]
    pub fn suite(&self) -> &'static str {
        self.inner.codec.suite_name()
    }

    /// Parameters in effect, once configured.
    #[must_use]
    pub fn params(&self) -> Option<SessionParams> {
        self.inner.state.lock().params
    }

    /// Apply `params` and start the session. Succeeds once.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    /// `InvalidConfig` for unusable parameters, `AlreadyConfigured` on a
    /// second call, `Closed` after close.
    pub fn configure(&self, params: &SessionParams) -> TransportResult<()> {
        self.inner.configure(params)
    }

    /// Best-effort DSCP and buffer tuning of the session's conn.
    ///
    /// Accepted sessions share the listener's conn, which is tuned through
    /// the listener; requests here are reported as rejected.
    pub fn tune_socket(&self, dscp: u8, sockbuf: usize) -> TuningReport {
        let report = match self.inner.role {
            Role::Dialer => TuningReport::apply(self.inner.conn.as_ref(), dscp, sockbuf),
            Role::Accepted => {
                let refuse = |requested: bool| {
                    if requested {
                        Tuning::Rejected("tune the listener instead".to_string())
                    } else {
                        Tuning::Skipped
                    }
                };
                TuningReport {
                    dscp: refuse(dscp > 0),
                    recv_buffer: refuse(sockbuf > 0),
                    send_buffer: refuse(sockbuf > 0),
                }
            }
        };
        *self.inner.tuning.lock() = Some(report.clone());
        report
    }

    /// Outcome of the last [`tune_socket`](Self::tune_socket) call.
    #[must_use]
    pub fn tuning_report(&self) -> Option<TuningReport> {
        self.inner.tuning.lock().clone()
    }

    /// Session counters.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            dropped_datagrams: self.inner.dropped.load(Ordering::Relaxed),
            waiting_to_send: self.inner.state.lock().kcp.wait_snd(),
            conn: self.inner.conn.stats(),
        }
    }

    /// True once closed locally, after the conn closed underneath or after
    /// the peer stopped acknowledging.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    /// Read into `buf`.
    ///
    /// Messages larger than `buf` are delivered over several calls.
    /// Returns `Ok(0)` once the peer has closed and everything it sent
    /// has been read.
    ///
    /// # Errors
    /// `NotConfigured` before [`configure`](Self::configure), `Closed`
    /// after a local close, `DeadLink` once the peer stopped acknowledging.
    pub async fn read(&self, buf: &mut [u8]) -> TransportResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let mut shutdown = self.inner.shutdown.subscribe();
            {
                let mut state = self.inner.state.lock();
                if state.params.is_none() {
                    return Err(TransportError::NotConfigured);
                }
                if let Some(n) = state.take_pending(buf) {
                    return Ok(n);
                }
                if let Ok(size) = state.kcp.peeksize() {
                    let mut message = vec![0u8; size];
                    let got = state
                        .kcp
                        .recv(&mut message)
                        .map_err(|e| TransportError::Protocol(format!("{e:?}")))?;
                    message.truncate(got);
                    state.pending = message;
                    state.pending_pos = 0;
                    continue;
                }
                if state.peer_closed {
                    return Ok(0);
                }
                if self.inner.is_shut() {
                    return Err(self.inner.stopped());
                }
            }
            tokio::select! {
                _ = self.inner.readable.notified() => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Queue all of `data` for reliable delivery.
    ///
    /// Waits while the send window is full. Returns the bytes queued,
    /// which is `data.len()` on success.
    ///
    /// # Errors
    /// `NotConfigured` before [`configure`](Self::configure), `Closed`
    /// once closing has begun, `DeadLink` once the peer stopped
    /// acknowledging.
    pub async fn write(&self, data: &[u8]) -> TransportResult<usize> {
        let overhead = self.inner.codec.overhead();
        let mut written = 0;
        while written < data.len() {
            let mut shutdown = self.inner.shutdown.subscribe();
            if self.inner.closing.load(Ordering::Acquire) {
                return Err(self.inner.stopped());
            }
            {
                let mut state = self.inner.state.lock();
                let Some(params) = state.params else {
                    return Err(TransportError::NotConfigured);
                };
                let mss = params.mss(overhead).max(1);
                let window = usize::from(params.snd_wnd);
                let mut queued = false;
                while written < data.len() && state.kcp.wait_snd() < window {
                    let end = (written + mss).min(data.len());
                    state
                        .kcp
                        .send(&data[written..end])
                        .map_err(|e| TransportError::Protocol(format!("{e:?}")))?;
                    written = end;
                    queued = true;
                }
                if queued {
                    if let Err(e) = state.kcp.flush() {
                        tracing::debug!(conv = self.inner.conv, error = ?e, "flush failed");
                    }
                }
                if written == data.len() {
                    break;
                }
            }
            tokio::select! {
                _ = self.inner.writable.notified() => {}
                _ = shutdown.changed() => {}
            }
        }
        Ok(written)
    }

    /// Close the session: wait up to a second for unacknowledged data,
    /// tell the peer, stop all tasks and, if the session owns its conn,
    /// close that too. Idempotent.
    ///
    /// # Errors
    /// Propagates a failure closing an owned conn.
    pub async fn close(&self) -> TransportResult<()> {
        self.inner.close(true).await
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.inner.closing.load(Ordering::Acquire) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = inner.close(true).await;
                });
            }
            Err(_) => {
                inner.closing.store(true, Ordering::Release);
                inner.shutdown.send_replace(true);
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("conv", &self.inner.conv)
            .field("remote", &self.inner.remote)
            .field("suite", &self.inner.codec.suite_name())
            .finish_non_exhaustive()
    }
}
