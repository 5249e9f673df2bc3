//! Load config from file and environment.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use peercast_core::{Identity, KeyDerivation, PublicKey};
use serde::Deserialize;

use crate::node::NodeSettings;

/// Node configuration. File: ~/.config/peercast/config.toml or /etc/peercast/config.toml.
/// Env overrides: PEERCAST_GROUP, PEERCAST_PORT, PEERCAST_INTERFACE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Multicast group this node binds and declares (default ff1e::5043:4153:54).
    #[serde(default = "default_group")]
    pub group: IpAddr,
    /// UDP port (default 1024).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interface name; the first reported interface when unset.
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default = "default_declare_interval_secs")]
    pub declare_interval_secs: u64,
    #[serde(default = "default_rejoin_interval_secs")]
    pub rejoin_interval_secs: u64,
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_peer_timeout_secs")]
    pub peer_timeout_secs: u64,
    /// Hash the DH output into the session key instead of using it directly.
    /// Every peer must agree.
    #[serde(default)]
    pub hash_session_key: bool,
    /// 32-byte Ed25519 seed as hex. A fresh identity is generated when unset.
    #[serde(default)]
    pub identity_seed: Option<String>,
    /// Hex public keys to accept. Empty accepts any peer.
    #[serde(default)]
    pub allowed_peers: Vec<String>,
    /// Allocate a unicast-prefix-based group from a local interface instead of `group`.
    #[serde(default)]
    pub prefixed_group: bool,
}

fn default_group() -> IpAddr {
    IpAddr::V6(std::net::Ipv6Addr::new(0xff1e, 0, 0, 0, 0, 0x5043, 0x4153, 0x54))
}
fn default_port() -> u16 {
    1024
}
fn default_declare_interval_secs() -> u64 {
    5
}
fn default_rejoin_interval_secs() -> u64 {
    30
}
fn default_session_ttl_secs() -> u64 {
    600
}
fn default_peer_timeout_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            group: default_group(),
            port: default_port(),
            interface: None,
            declare_interval_secs: default_declare_interval_secs(),
            rejoin_interval_secs: default_rejoin_interval_secs(),
            session_ttl_secs: default_session_ttl_secs(),
            peer_timeout_secs: default_peer_timeout_secs(),
            hash_session_key: false,
            identity_seed: None,
            allowed_peers: Vec::new(),
            prefixed_group: false,
        }
    }
}

impl Config {
    pub fn declare_interval(&self) -> Duration {
        Duration::from_secs(self.declare_interval_secs)
    }

    pub fn rejoin_interval(&self) -> Duration {
        Duration::from_secs(self.rejoin_interval_secs)
    }

    /// Identity from `identity_seed`, or a fresh one.
    pub fn identity(&self) -> Result<Identity, ConfigError> {
        match &self.identity_seed {
            Some(hex_seed) => {
                let seed = decode_32(hex_seed).ok_or(ConfigError::InvalidSeed)?;
                Ok(Identity::from_seed(&seed))
            }
            None => Identity::generate().map_err(|_| ConfigError::Randomness),
        }
    }

    pub fn node_settings(&self) -> Result<NodeSettings, ConfigError> {
        let allowed_peers = self
            .allowed_peers
            .iter()
            .map(|s| {
                decode_32(s)
                    .map(PublicKey::from_bytes)
                    .ok_or_else(|| ConfigError::InvalidPeerKey(s.clone()))
            })
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(NodeSettings {
            derivation: if self.hash_session_key {
                KeyDerivation::Sha256
            } else {
                KeyDerivation::Raw
            },
            session_ttl: Duration::from_secs(self.session_ttl_secs),
            peer_timeout: Duration::from_secs(self.peer_timeout_secs),
            allowed_peers,
        })
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("PEERCAST_GROUP") {
            if let Ok(g) = s.parse::<IpAddr>() {
                self.group = g;
            }
        }
        if let Some(s) = var("PEERCAST_PORT") {
            if let Ok(p) = s.parse::<u16>() {
                self.port = p;
            }
        }
        if let Some(s) = var("PEERCAST_INTERFACE") {
            if !s.is_empty() {
                self.interface = Some(s);
            }
        }
    }
}

fn decode_32(s: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(s.trim()).ok()?;
    bytes.try_into().ok()
}

/// Load config: an explicit path must exist and parse; otherwise the first
/// existing default path, or defaults. Environment overrides apply last.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match path {
        Some(p) => read_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => read_file(&p)?,
            None => Config::default(),
        },
    };
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/peercast/config.toml"));
    }
    out.push(PathBuf::from("/etc/peercast/config.toml"));
    out
}

fn read_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
    toml::from_str(&s).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("parsing {0}: {1}")]
    Parse(PathBuf, toml::de::Error),
    #[error("identity_seed must be 64 hex characters")]
    InvalidSeed,
    #[error("allowed peer {0:?} is not a 64-character hex key")]
    InvalidPeerKey(String),
    #[error("randomness source failed")]
    Randomness,
}
