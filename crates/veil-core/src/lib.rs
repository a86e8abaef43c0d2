//! # VEIL Core
//!
//! Session wiring for VEIL: one configuration type, client factories and
//! a server accept loop built on the transport and crypto crates.
//!
//! This crate provides:
//! - [`SessionConfig`] with TOML loading, mode presets and validation
//! - [`Client`] factories that open, configure and tune a session
//! - [`Server`], which accepts sessions and hands them to a [`SessionHandler`]
//! - Stock echo and sink handlers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Client / Server                              │
//! │   (validate config, open conn, configure sessions once)         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                    Session (veil-transport)                     │
//! │   (KCP reliability over framed, encrypted datagrams)            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                    Cipher (veil-crypto)                         │
//! │   (passphrase-derived key, named suite)                         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use veil_core::{Client, EchoHandler, Server, SessionConfig};
//!
//! # async fn example() -> Result<(), veil_core::VeilError> {
//! let config = SessionConfig::default();
//! let server = Server::bind("127.0.0.1:29900", &config, Some(Arc::new(EchoHandler))).await?;
//!
//! let client = Client::connect("127.0.0.1:29900", &config).await?;
//! client.write(b"hello").await?;
//! let mut buf = [0u8; 16];
//! let n = client.read(&mut buf).await?;
//! assert_eq!(&buf[..n], b"hello");
//!
//! client.close().await?;
//! server.close().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod error;
pub mod handlers;
pub mod server;

pub use client::Client;
pub use config::{FecConf, ModeConf, SessionConfig};
pub use error::{AcceptError, ConfigError, VeilError};
pub use handlers::{EchoHandler, SinkHandler};
pub use server::{Server, SessionHandler};
