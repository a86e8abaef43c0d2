//! Server accept loop.
//!
//! A [`Server`] owns a listener and a background task that accepts new
//! sessions, applies the configured parameters to each one and hands it
//! to a [`SessionHandler`]. Without a handler, accepted sessions are kept
//! open until the server closes.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use veil_transport::{Listener, Session, SessionParams, SharedConn, TuningReport, listen, serve_conn};

use crate::config::SessionConfig;
use crate::error::{AcceptError, VeilError};

/// Receives each accepted, configured session.
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    /// Serve one session. Runs on its own task.
    async fn handle(&self, session: Session);
}

/// A listening server and its accept loop.
pub struct Server {
    listener: Arc<Listener>,
    tuning: TuningReport,
    held: Arc<Mutex<Vec<Session>>>,
    accept_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Listen on `addr` (`host:port`) and start accepting.
    ///
    /// # Errors
    ///
    /// `Config` before anything is opened, then `Crypto` or `Transport`.
    pub async fn bind(
        addr: &str,
        config: &SessionConfig,
        handler: Option<Arc<dyn SessionHandler>>,
    ) -> Result<Self, VeilError> {
        let params = config.params()?;
        let crypt = config.cipher()?;
        let listener = listen(addr, crypt, config.fec()).await?;
        Ok(Self::start(listener, config, params, handler))
    }

    /// Accept sessions on a caller-supplied conn.
    ///
    /// The server closes `conn` when it closes.
    ///
    /// # Errors
    ///
    /// As [`bind`](Self::bind). A configuration error leaves `conn`
    /// untouched.
    pub fn with_conn(
        conn: SharedConn,
        config: &SessionConfig,
        handler: Option<Arc<dyn SessionHandler>>,
    ) -> Result<Self, VeilError> {
        let params = config.params()?;
        let crypt = config.cipher()?;
        let listener = serve_conn(crypt, config.fec(), conn)?;
        Ok(Self::start(listener, config, params, handler))
    }

    fn start(
        listener: Listener,
        config: &SessionConfig,
        params: SessionParams,
        handler: Option<Arc<dyn SessionHandler>>,
    ) -> Self {
        let tuning = listener.tune_socket(config.dscp_byte(), config.sockbuf);
        let listener = Arc::new(listener);
        let held = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(accept_loop(
            Arc::clone(&listener),
            params,
            handler,
            Arc::clone(&held),
        ));
        Self {
            listener,
            tuning,
            held,
            accept_task: tokio::sync::Mutex::new(Some(task)),
        }
    }

    /// Local address of the listening conn.
    ///
    /// # Errors
    ///
    /// Propagates the conn's error.
    pub fn local_addr(&self) -> Result<SocketAddr, VeilError> {
        Ok(self.listener.local_addr()?)
    }

    /// Outcome of socket tuning at construction.
    #[must_use]
    pub fn tuning_report(&self) -> &TuningReport {
        &self.tuning
    }

    /// Number of live sessions on the listener.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.listener.session_count()
    }

    /// Stop accepting, close every session and the conn. Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates a failure closing the conn.
    pub async fn close(&self) -> Result<(), VeilError> {
        self.listener.close().await?;
        self.held.lock().clear();
        Ok(())
    }

    /// Wait for the accept loop to finish, which happens once the server
    /// (or its conn) is closed.
    pub async fn closed(&self) {
        let task = self.accept_task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "accept loop panicked");
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.listener.is_closed() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let listener = Arc::clone(&self.listener);
                let held = Arc::clone(&self.held);
                handle.spawn(async move {
                    if let Err(e) = listener.close().await {
                        tracing::debug!(error = %e, "listener close on drop failed");
                    }
                    held.lock().clear();
                });
            }
            Err(_) => {
                if let Some(task) = self.accept_task.get_mut().take() {
                    task.abort();
                }
            }
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("sessions", &self.listener.session_count())
            .field("closed", &self.listener.is_closed())
            .finish()
    }
}

async fn accept_loop(
    listener: Arc<Listener>,
    params: SessionParams,
    handler: Option<Arc<dyn SessionHandler>>,
    held: Arc<Mutex<Vec<Session>>>,
) {
    loop {
        let session = match listener.accept().await.map_err(AcceptError::from) {
            Ok(session) => session,
            Err(AcceptError::Closed) => {
                tracing::debug!("listener closed, accept loop exiting");
                return;
            }
            Err(AcceptError::Transport(e)) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };

        if let Err(e) = session.configure(&params) {
            tracing::warn!(conv = session.conv(), error = %e, "session configure failed");
            continue;
        }
        tracing::debug!(
            conv = session.conv(),
            remote = %session.remote_addr(),
            "session accepted"
        );

        match &handler {
            Some(handler) => {
                let handler = Arc::clone(handler);
                tokio::spawn(async move { handler.handle(session).await });
            }
            None => {
                let mut held = held.lock();
                held.retain(|s| !s.is_closed());
                held.push(session);
            }
        }
    }
}
