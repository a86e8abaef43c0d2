//! Handlers that record what the server side observed.

use async_trait::async_trait;
use tokio::sync::mpsc;
use veil_core::SessionHandler;
use veil_transport::Session;

/// Hands every accepted session to the test.
pub struct CollectHandler {
    tx: mpsc::UnboundedSender<Session>,
}

impl CollectHandler {
    /// Handler plus the receiving end for accepted sessions
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Session>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl SessionHandler for CollectHandler {
    async fn handle(&self, session: Session) {
        let _ = self.tx.send(session);
    }
}

/// Reads each session through a deliberately small buffer and reports
/// the reassembled stream once the peer closes.
pub struct TinyBufferHandler {
    buffer: usize,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl TinyBufferHandler {
    /// Handler reading `buffer` bytes at a time
    pub fn new(buffer: usize) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { buffer, tx }, rx)
    }
}

#[async_trait]
impl SessionHandler for TinyBufferHandler {
    async fn handle(&self, session: Session) {
        let mut buf = vec![0u8; self.buffer];
        let mut stream = Vec::new();
        loop {
            match session.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    assert!(n <= self.buffer);
                    stream.extend_from_slice(&buf[..n]);
                }
            }
        }
        let _ = self.tx.send(stream);
        let _ = session.close().await;
    }
}
