//! Stock session handlers.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use veil_transport::Session;

use crate::server::SessionHandler;

/// Read buffer used by the stock handlers.
const READ_BUFFER: usize = 64 * 1024;

/// Writes every byte it reads back to the sender.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

#[async_trait]
impl SessionHandler for EchoHandler {
    async fn handle(&self, session: Session) {
        let mut buf = vec![0u8; READ_BUFFER];
        loop {
            let n = match session.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(conv = session.conv(), error = %e, "echo read ended");
                    break;
                }
            };
            if let Err(e) = session.write(&buf[..n]).await {
                tracing::debug!(conv = session.conv(), error = %e, "echo write failed");
                break;
            }
        }
        if let Err(e) = session.close().await {
            tracing::debug!(conv = session.conv(), error = %e, "close failed");
        }
    }
}

/// Reads and discards everything, counting bytes.
#[derive(Debug, Default, Clone)]
pub struct SinkHandler {
    received: Arc<AtomicU64>,
}

impl SinkHandler {
    /// New sink with a zero count.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes received across all sessions so far.
    #[must_use]
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SessionHandler for SinkHandler {
    async fn handle(&self, session: Session) {
        let mut buf = vec![0u8; READ_BUFFER];
        let mut total = 0u64;
        loop {
            match session.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    total += n as u64;
                    self.received.fetch_add(n as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    tracing::debug!(conv = session.conv(), error = %e, "sink read ended");
                    break;
                }
            }
        }
        tracing::info!(conv = session.conv(), bytes = total, "sink session finished");
        if let Err(e) = session.close().await {
            tracing::debug!(conv = session.conv(), error = %e, "close failed");
        }
    }
}
