//! Configuration loading.
//!
//! Sources, lowest precedence first:
//! 1. Built-in defaults
//! 2. JSON file at `COURIER_CONFIG`, or `<config dir>/event-courier/config.json`
//! 3. Environment variables (`PORT`, `REDIS_HOST`, ...)
//! 4. Command-line flags, applied by `main`

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::fs;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_PORT;
use crate::crypto::CipherKey;

/// Which [`EventStore`](crate::store::EventStore) the server uses.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Redis lists and keys.
    #[default]
    Redis,
    /// In-process store; nothing survives a restart.
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "memory" => Ok(Self::Memory),
            other => bail!("unknown store backend '{other}' (expected redis or memory)"),
        }
    }
}

/// Redis connection settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct RedisConfig {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Password for `AUTH`, if the server requires one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
        }
    }
}

/// Configuration for the event-courier server.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Address to listen on.
    pub bind_address: String,
    /// Port to listen on.
    pub port: u16,
    /// Redis settings, used when `store` is `redis`.
    pub redis: RedisConfig,
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Storage backend.
    pub store: StoreBackend,
    /// Base64 of a 32-byte payload key. Absent means the legacy shared key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_key: Option<String>,
    /// Largest partial frame a connection may buffer. Absent means unbounded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_frame_bytes: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            redis: RedisConfig::default(),
            log_level: "info".to_string(),
            store: StoreBackend::default(),
            shared_key: None,
            max_frame_bytes: None,
        }
    }
}

impl Config {
    /// Path of the configuration file, if one should be read.
    ///
    /// `COURIER_CONFIG` wins; otherwise the platform config directory.
    pub fn config_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("COURIER_CONFIG") {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join("event-courier").join("config.json"))
    }

    /// Load defaults, the config file (if present) and environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match Self::config_path() {
            Some(path) if path.exists() => Self::load_from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON config file. Missing fields take their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from a variable lookup.
    ///
    /// Values that fail to parse are ignored and the previous value kept.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(bind) = lookup("BIND_ADDRESS") {
            self.bind_address = bind;
        }

        if let Some(port) = lookup("PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.port = port;
            }
        }

        if let Some(host) = lookup("REDIS_HOST") {
            self.redis.host = host;
        }

        if let Some(port) = lookup("REDIS_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.redis.port = port;
            }
        }

        if let Some(password) = lookup("REDIS_PASSWORD") {
            self.redis.password = (!password.is_empty()).then_some(password);
        }

        if let Some(level) = lookup("LOG_LEVEL") {
            self.log_level = level;
        }

        if let Some(store) = lookup("STORE_BACKEND") {
            match store.parse() {
                Ok(backend) => self.store = backend,
                Err(e) => log::warn!("[Config] Ignoring STORE_BACKEND: {e}"),
            }
        }

        if let Some(key) = lookup("SHARED_KEY") {
            self.shared_key = Some(key);
        }

        if let Some(limit) = lookup("MAX_FRAME_BYTES") {
            if let Ok(limit) = limit.parse::<usize>() {
                self.max_frame_bytes = Some(limit);
            }
        }
    }

    /// Reject values that would fail later at runtime.
    pub fn validate(&self) -> Result<()> {
        if let Some(ref key) = self.shared_key {
            CipherKey::from_base64(key).context("shared_key is invalid")?;
        }
        if self.max_frame_bytes == Some(0) {
            bail!("max_frame_bytes must be greater than 0");
        }
        Ok(())
    }

    /// Payload key: the configured one, or the legacy shared key.
    pub fn cipher_key(&self) -> Result<CipherKey> {
        match self.shared_key {
            Some(ref key) => CipherKey::from_base64(key).context("shared_key is invalid"),
            None => Ok(CipherKey::legacy_shared()),
        }
    }

    /// Resolve `bind_address:port` to a socket address.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        (self.bind_address.as_str(), self.port)
            .to_socket_addrs()
            .with_context(|| format!("Invalid bind address {}", self.bind_address))?
            .next()
            .with_context(|| format!("{} resolved to no addresses", self.bind_address))
    }
}
