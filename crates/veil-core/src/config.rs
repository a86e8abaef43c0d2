//! Session configuration.
//!
//! A [`SessionConfig`] is the single user-facing description of a
//! session: passphrase, cipher suite, KCP tuning and socket options. It
//! loads from TOML with every field optional, is validated before any
//! socket is opened, and converts into the immutable
//! [`SessionParams`] applied to each session.

use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::Path;
use veil_crypto::{CipherInstance, CipherSuite, CryptoError};
use veil_transport::codec::CRYPT_HEADER_SIZE;
use veil_transport::params::{DEFAULT_DEAD_LINK, KCP_MIN_MTU};
use veil_transport::{FecShards, SessionParams};

use crate::error::ConfigError;

/// Smallest accepted MTU.
pub const MIN_MTU: usize = 64;

/// Largest accepted MTU.
pub const MAX_MTU: usize = 1500;

/// Largest DSCP code point.
pub const MAX_DSCP: u32 = 63;

/// Largest update interval in milliseconds.
pub const MAX_INTERVAL: u32 = 5000;

/// Largest fast-retransmit trigger the KCP engine can represent.
pub const MAX_RESEND: u32 = i32::MAX as u32;

/// Names accepted by [`ModeConf::preset`].
pub const MODE_PRESETS: &[&str] = &["normal", "fast", "fast2", "fast3"];

/// Complete session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Passphrase the cipher key is derived from
    #[serde(default = "default_seed")]
    pub seed: String,

    /// Cipher suite name
    #[serde(default = "default_crypt")]
    pub crypt: String,

    /// Datagram MTU including the crypto header
    #[serde(default = "default_mtu")]
    pub mtu: usize,

    /// Send window in packets
    #[serde(default = "default_sndwnd")]
    pub sndwnd: u32,

    /// Receive window in packets
    #[serde(default = "default_rcvwnd")]
    pub rcvwnd: u32,

    /// DSCP code point for outgoing datagrams (0 leaves the socket alone)
    #[serde(default)]
    pub dscp: u32,

    /// Flush ACKs as soon as input arrives
    #[serde(default)]
    pub acknodelay: bool,

    /// Socket buffer size in bytes (0 leaves the socket alone)
    #[serde(default = "default_sockbuf")]
    pub sockbuf: usize,

    /// KCP timing, as a preset name or an explicit table
    #[serde(default, deserialize_with = "deserialize_mode")]
    pub mode: ModeConf,

    /// FEC shard counts carried by sessions
    #[serde(default)]
    pub fec: FecConf,
}

/// KCP timing knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeConf {
    /// Disable the minimum RTO clamp
    pub nodelay: bool,

    /// Update interval in milliseconds
    pub interval: u32,

    /// Fast-retransmit trigger
    pub resend: u32,

    /// Disable congestion control
    pub nc: bool,
}

/// FEC shard counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FecConf {
    /// Data shards per group
    pub datashard: usize,

    /// Parity shards per group
    pub parityshard: usize,
}

// Default values
fn default_seed() -> String {
    "test-seed".to_string()
}

fn default_crypt() -> String {
    "salsa20".to_string()
}

fn default_mtu() -> usize {
    1200
}

fn default_sndwnd() -> u32 {
    1024
}

fn default_rcvwnd() -> u32 {
    4096
}

fn default_sockbuf() -> usize {
    16_777_217
}

fn deserialize_mode<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ModeConf, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Preset(String),
        Explicit(ModeConf),
    }

    Ok(match Repr::deserialize(deserializer)? {
        Repr::Preset(name) => ModeConf::preset(&name),
        Repr::Explicit(mode) => mode,
    })
}

impl ModeConf {
    /// Timing preset by name.
    ///
    /// | name   | nodelay | interval |
    /// |--------|---------|----------|
    /// | normal | false   | 40       |
    /// | fast   | false   | 30       |
    /// | fast2  | true    | 20       |
    /// | fast3  | true    | 10       |
    ///
    /// All presets use resend 2 with congestion control off. Unknown names
    /// select `normal`.
    #[must_use]
    pub fn preset(name: &str) -> Self {
        let (nodelay, interval) = match name {
            "normal" => (false, 40),
            "fast" => (false, 30),
            "fast2" => (true, 20),
            "fast3" => (true, 10),
            other => {
                tracing::debug!(mode = other, "unknown mode preset, using normal");
                (false, 40)
            }
        };
        Self {
            nodelay,
            interval,
            resend: 2,
            nc: true,
        }
    }
}

impl Default for ModeConf {
    fn default() -> Self {
        Self::preset("normal")
    }
}

impl Default for FecConf {
    fn default() -> Self {
        Self {
            datashard: 10,
            parityshard: 3,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            crypt: default_crypt(),
            mtu: default_mtu(),
            sndwnd: default_sndwnd(),
            rcvwnd: default_rcvwnd(),
            dscp: 0,
            acknodelay: false,
            sockbuf: default_sockbuf(),
            mode: ModeConf::default(),
            fec: FecConf::default(),
        }
    }
}

impl SessionConfig {
    /// Parse a TOML document. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` for malformed TOML or mistyped fields.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Suite this configuration selects, after fallback.
    #[must_use]
    pub fn suite(&self) -> CipherSuite {
        CipherSuite::parse(&self.crypt).suite()
    }

    /// Bytes the datagram codec adds for the selected suite.
    #[must_use]
    pub fn overhead(&self) -> usize {
        if self.suite() == CipherSuite::Null {
            0
        } else {
            CRYPT_HEADER_SIZE
        }
    }

    /// Smallest MTU usable with the selected suite.
    #[must_use]
    pub fn min_mtu(&self) -> usize {
        MIN_MTU.max(self.overhead() + KCP_MIN_MTU)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns the first out-of-range field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let min = self.min_mtu();
        if self.mtu < min || self.mtu > MAX_MTU {
            return Err(ConfigError::Mtu {
                mtu: self.mtu,
                min,
                max: MAX_MTU,
            });
        }

        for (name, value) in [("sndwnd", self.sndwnd), ("rcvwnd", self.rcvwnd)] {
            if value == 0 || value > u32::from(u16::MAX) {
                return Err(ConfigError::Window { name, value });
            }
        }

        if self.dscp > MAX_DSCP {
            return Err(ConfigError::Dscp(self.dscp));
        }

        if self.mode.interval == 0 || self.mode.interval > MAX_INTERVAL {
            return Err(ConfigError::Interval(self.mode.interval));
        }

        if self.mode.resend > MAX_RESEND {
            return Err(ConfigError::Resend(self.mode.resend));
        }

        Ok(())
    }

    /// Validate and snapshot the transport parameters.
    ///
    /// # Errors
    ///
    /// Returns the first out-of-range field.
    pub fn params(&self) -> Result<SessionParams, ConfigError> {
        self.validate()?;
        let window = |value: u32, name: &'static str| {
            u16::try_from(value).map_err(|_| ConfigError::Window { name, value })
        };
        Ok(SessionParams {
            nodelay: self.mode.nodelay,
            interval: self.mode.interval,
            resend: self.mode.resend,
            nc: self.mode.nc,
            snd_wnd: window(self.sndwnd, "sndwnd")?,
            rcv_wnd: window(self.rcvwnd, "rcvwnd")?,
            mtu: self.mtu,
            ack_nodelay: self.acknodelay,
            dead_link: DEFAULT_DEAD_LINK,
        })
    }

    /// DSCP as the byte handed to socket tuning. Call after validation.
    #[must_use]
    pub fn dscp_byte(&self) -> u8 {
        u8::try_from(self.dscp.min(MAX_DSCP)).unwrap_or(0)
    }

    /// FEC shard counts.
    #[must_use]
    pub fn fec(&self) -> FecShards {
        FecShards::new(self.fec.datashard, self.fec.parityshard)
    }

    /// Build the cipher for this configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the suite cannot be constructed.
    pub fn cipher(&self) -> Result<Option<CipherInstance>, CryptoError> {
        veil_crypto::resolve(&self.seed, &self.crypt)
    }
}
