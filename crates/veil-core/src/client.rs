//! Client session factories.
//!
//! Every factory follows the same order: validate the configuration,
//! build the cipher, open or adopt the packet conn, construct the
//! session under a fresh conversation id, apply parameters once, then
//! tune the socket. A failure after the conn is opened closes it again.

use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::Arc;

use veil_crypto::{CipherInstance, ConvIdGenerator};
use veil_transport::dial::unspecified_for;
use veil_transport::{
    Session, SessionParams, SharedConn, TuningReport, UdpPacketConn, dial_with_conv,
    resolve_addr,
};

use crate::config::SessionConfig;
use crate::error::VeilError;

/// A configured client session.
///
/// Dereferences to [`Session`] for reading, writing and closing.
#[derive(Debug)]
pub struct Client {
    session: Session,
    tuning: TuningReport,
}

impl Client {
    /// Dial `remote` (`host:port`) from an ephemeral local port.
    ///
    /// # Errors
    ///
    /// `Config` before anything is opened, then `Crypto` or `Transport`.
    pub async fn connect(remote: &str, config: &SessionConfig) -> Result<Self, VeilError> {
        Self::connect_with_ids(remote, config, &ConvIdGenerator::shared()).await
    }

    /// [`connect`](Self::connect) drawing the conversation id from `ids`.
    ///
    /// # Errors
    ///
    /// As [`connect`](Self::connect).
    pub async fn connect_with_ids(
        remote: &str,
        config: &SessionConfig,
        ids: &ConvIdGenerator,
    ) -> Result<Self, VeilError> {
        let params = config.params()?;
        let crypt = config.cipher()?;
        let remote = resolve_addr(remote).await?;
        let conn = UdpPacketConn::bind(unspecified_for(remote)).await?;
        Self::establish(Arc::new(conn), remote, config, &params, crypt, ids).await
    }

    /// Dial `remote` from the local address `local`.
    ///
    /// # Errors
    ///
    /// As [`connect`](Self::connect).
    pub async fn connect_with_local(
        local: &str,
        remote: &str,
        config: &SessionConfig,
    ) -> Result<Self, VeilError> {
        Self::connect_with_local_ids(local, remote, config, &ConvIdGenerator::shared()).await
    }

    /// [`connect_with_local`](Self::connect_with_local) drawing the
    /// conversation id from `ids`.
    ///
    /// # Errors
    ///
    /// As [`connect`](Self::connect).
    pub async fn connect_with_local_ids(
        local: &str,
        remote: &str,
        config: &SessionConfig,
        ids: &ConvIdGenerator,
    ) -> Result<Self, VeilError> {
        let params = config.params()?;
        let crypt = config.cipher()?;
        let local = resolve_addr(local).await?;
        let remote = resolve_addr(remote).await?;
        let conn = UdpPacketConn::bind(local).await?;
        Self::establish(Arc::new(conn), remote, config, &params, crypt, ids).await
    }

    /// Run a session to `remote` over a caller-supplied conn.
    ///
    /// The session takes ownership of `conn` and closes it when it closes,
    /// including when construction fails. `conn` must not have another
    /// reader.
    ///
    /// # Errors
    ///
    /// As [`connect`](Self::connect). A configuration error leaves `conn`
    /// untouched.
    pub async fn connect_with_conn(
        conn: SharedConn,
        remote: SocketAddr,
        config: &SessionConfig,
    ) -> Result<Self, VeilError> {
        Self::connect_with_conn_ids(conn, remote, config, &ConvIdGenerator::shared()).await
    }

    /// [`connect_with_conn`](Self::connect_with_conn) drawing the
    /// conversation id from `ids`.
    ///
    /// # Errors
    ///
    /// As [`connect_with_conn`](Self::connect_with_conn).
    pub async fn connect_with_conn_ids(
        conn: SharedConn,
        remote: SocketAddr,
        config: &SessionConfig,
        ids: &ConvIdGenerator,
    ) -> Result<Self, VeilError> {
        let params = config.params()?;
        let crypt = config.cipher()?;
        Self::establish(conn, remote, config, &params, crypt, ids).await
    }

    async fn establish(
        conn: SharedConn,
        remote: SocketAddr,
        config: &SessionConfig,
        params: &SessionParams,
        crypt: Option<CipherInstance>,
        ids: &ConvIdGenerator,
    ) -> Result<Self, VeilError> {
        let conv = match ids.next() {
            Ok(conv) => conv,
            Err(e) => {
                if let Err(close_err) = conn.close().await {
                    tracing::debug!(error = %close_err, "conn close failed");
                }
                return Err(e.into());
            }
        };

        let session = dial_with_conv(conv, remote, crypt, config.fec(), conn, true);
        if let Err(e) = session.configure(params) {
            if let Err(close_err) = session.close().await {
                tracing::debug!(error = %close_err, "session close failed");
            }
            return Err(e.into());
        }

        let tuning = session.tune_socket(config.dscp_byte(), config.sockbuf);
        tracing::info!(
            conv,
            %remote,
            suite = session.suite(),
            mtu = params.mtu,
            "client session established"
        );
        Ok(Self { session, tuning })
    }

    /// Outcome of socket tuning at construction.
    #[must_use]
    pub fn tuning_report(&self) -> &TuningReport {
        &self.tuning
    }

    /// Unwrap the underlying session.
    #[must_use]
    pub fn into_session(self) -> Session {
        self.session
    }
}

impl Deref for Client {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use veil_transport::{MemoryNetwork, PacketConn, Tuning, serve_conn};

    #[tokio::test]
    async fn test_invalid_config_opens_nothing() {
        let network = MemoryNetwork::new();
        let conn = Arc::new(network.bind());
        let config = SessionConfig {
            mtu: 10,
            ..SessionConfig::default()
        };
        let remote = "10.0.0.1:1".parse().unwrap();
        let result = Client::connect_with_conn(conn.clone(), remote, &config).await;
        assert!(matches!(
            result,
            Err(VeilError::Config(ConfigError::Mtu { .. }))
        ));
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_connect_invalid_remote() {
        let result = Client::connect("no-port-here", &SessionConfig::default()).await;
        assert!(matches!(result, Err(VeilError::Transport(_))));
    }

    #[tokio::test]
    async fn test_connect_with_conn_memory() {
        let network = MemoryNetwork::new();
        let config = SessionConfig::default();
        let server_conn = Arc::new(network.bind());
        let server_addr = server_conn.local_addr().unwrap();
        let listener = serve_conn(config.cipher().unwrap(), config.fec(), server_conn).unwrap();

        let ids = ConvIdGenerator::new();
        let client_conn = Arc::new(network.bind());
        let client =
            Client::connect_with_conn_ids(client_conn.clone(), server_addr, &config, &ids)
                .await
                .unwrap();
        assert_eq!(ids.issued(), 1);
        assert_eq!(client.suite(), "salsa20");
        assert_eq!(client.params().unwrap(), config.params().unwrap());
        assert_eq!(client.fec(), config.fec());
        // The memory conn refuses every tuning request
        assert!(matches!(client.tuning_report().dscp, Tuning::Skipped));
        assert!(client.tuning_report().recv_buffer.is_rejected());

        client.write(b"hi").await.unwrap();
        let accepted = listener.accept().await.unwrap();
        assert_eq!(accepted.conv(), client.conv());

        client.close().await.unwrap();
        assert!(client_conn.is_closed());
        listener.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_distinct_conv_ids() {
        let network = MemoryNetwork::new();
        let config = SessionConfig {
            crypt: "null".to_string(),
            ..SessionConfig::default()
        };
        let remote = network.bind().local_addr().unwrap();
        let ids = ConvIdGenerator::new();
        let a = Client::connect_with_conn_ids(Arc::new(network.bind()), remote, &config, &ids)
            .await
            .unwrap();
        let b = Client::connect_with_conn_ids(Arc::new(network.bind()), remote, &config, &ids)
            .await
            .unwrap();
        assert_ne!(a.conv(), b.conv());
        assert_ne!(a.conv(), 0);
        a.close().await.unwrap();
        b.close().await.unwrap();
    }
}
