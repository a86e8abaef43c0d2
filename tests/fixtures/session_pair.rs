//! Client/server pair fixture
//!
//! Provides a reusable client and server wired over an in-memory network
//! (optionally lossy) or UDP loopback.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use veil_core::{EchoHandler, SessionConfig};
//! use veil_integration_tests::fixtures::SessionPair;
//!
//! # async fn example() {
//! let pair = SessionPair::memory(&SessionConfig::default(), Arc::new(EchoHandler))
//!     .await
//!     .unwrap();
//! pair.client.write(b"ping").await.unwrap();
//! pair.cleanup().await;
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;
use veil_core::{Client, Server, SessionConfig, SessionHandler, VeilError};
use veil_crypto::ConvIdGenerator;
use veil_transport::MemoryNetwork;

/// A server and one client connected to it
pub struct SessionPair {
    /// Network both ends are attached to (`None` for UDP)
    pub network: Option<MemoryNetwork>,
    /// Server side
    pub server: Server,
    /// Client side
    pub client: Client,
    /// Generator the client drew its id from
    pub ids: Arc<ConvIdGenerator>,
}

impl SessionPair {
    /// Pair over a lossless in-memory network
    pub async fn memory(
        config: &SessionConfig,
        handler: Arc<dyn SessionHandler>,
    ) -> Result<Self, VeilError> {
        Self::over(MemoryNetwork::new(), config, config, handler).await
    }

    /// Pair over an in-memory network dropping `loss` of datagrams and
    /// delaying the rest by `delay`
    pub async fn lossy(
        loss: f64,
        delay: Duration,
        config: &SessionConfig,
        handler: Arc<dyn SessionHandler>,
    ) -> Result<Self, VeilError> {
        Self::over(MemoryNetwork::lossy(loss, delay), config, config, handler).await
    }

    /// Pair with distinct client and server configurations
    pub async fn mismatched(
        client_config: &SessionConfig,
        server_config: &SessionConfig,
        handler: Arc<dyn SessionHandler>,
    ) -> Result<Self, VeilError> {
        Self::over(MemoryNetwork::new(), client_config, server_config, handler).await
    }

    async fn over(
        network: MemoryNetwork,
        client_config: &SessionConfig,
        server_config: &SessionConfig,
        handler: Arc<dyn SessionHandler>,
    ) -> Result<Self, VeilError> {
        let server = Server::with_conn(Arc::new(network.bind()), server_config, Some(handler))?;
        let ids = Arc::new(ConvIdGenerator::new());
        let client = Client::connect_with_conn_ids(
            Arc::new(network.bind()),
            server.local_addr()?,
            client_config,
            &ids,
        )
        .await?;
        Ok(Self {
            network: Some(network),
            server,
            client,
            ids,
        })
    }

    /// Pair over UDP loopback
    pub async fn udp(
        config: &SessionConfig,
        handler: Arc<dyn SessionHandler>,
    ) -> Result<Self, VeilError> {
        let server = Server::bind("127.0.0.1:0", config, Some(handler)).await?;
        let ids = Arc::new(ConvIdGenerator::new());
        let remote = server.local_addr()?.to_string();
        let client = Client::connect_with_local_ids("127.0.0.1:0", &remote, config, &ids).await?;
        Ok(Self {
            network: None,
            server,
            client,
            ids,
        })
    }

    /// Another client to the same server. Memory pairs only.
    pub async fn extra_client(&self, config: &SessionConfig) -> Result<Client, VeilError> {
        let addr = self.server.local_addr()?;
        match &self.network {
            Some(network) => {
                Client::connect_with_conn_ids(Arc::new(network.bind()), addr, config, &self.ids)
                    .await
            }
            None => {
                Client::connect_with_local_ids("127.0.0.1:0", &addr.to_string(), config, &self.ids)
                    .await
            }
        }
    }

    /// Read from the client until `len` bytes have arrived
    ///
    /// # Panics
    ///
    /// Panics on timeout, read error or early end of stream.
    pub async fn client_read_exact(&self, len: usize) -> Vec<u8> {
        read_exact(&self.client, len).await
    }

    /// Close both ends
    pub async fn cleanup(self) {
        let _ = self.client.close().await;
        let _ = self.server.close().await;
    }
}

/// Read from `client` until `len` bytes have arrived
///
/// # Panics
///
/// Panics on timeout, read error or early end of stream.
pub async fn read_exact(client: &Client, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut buf = vec![0u8; 8192];
    while out.len() < len {
        let n = tokio::time::timeout(Duration::from_secs(10), client.read(&mut buf))
            .await
            .expect("Timeout waiting for data")
            .expect("read failed");
        assert!(n > 0, "stream ended after {} of {len} bytes", out.len());
        out.extend_from_slice(&buf[..n]);
    }
    out
}
