//! Client configuration.
//!
//! [`ClientConfig`] carries defaults for the node address and the sync
//! pipeline. It can be built programmatically or layered from an optional
//! TOML file and `EBB__*` environment variables with [`ClientConfig::load`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use ebb_core::ClientError;
use ebb_core::constants::{DEFAULT_HOST, DEFAULT_IN_FLIGHT, DEFAULT_PORT, DEFAULT_REQUEST_TIMEOUT_SECS};

/// Environment variable prefix; nested keys are separated by `__`.
pub const ENV_PREFIX: &str = "EBB";

/// Address of the node's WebSocket bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    /// Use `wss://` instead of `ws://`.
    pub tls: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            tls: false,
        }
    }
}

impl ConnectionConfig {
    pub fn url(&self) -> Result<Url, ClientError> {
        let scheme = if self.tls { "wss" } else { "ws" };
        let raw = format!("{scheme}://{}:{}", self.host, self.port);
        Url::parse(&raw).map_err(|e| ClientError::Config(format!("invalid node address '{raw}': {e}")))
    }
}

/// Configuration shared by every client on one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connection: ConnectionConfig,
    /// Number of `RequestNext` messages kept in flight.
    pub in_flight: usize,
    /// Run chain-sync handlers one at a time, in arrival order.
    pub sequential: bool,
    /// Tag `RequestNext` with sequence numbers and restore order from the echoes.
    pub resequence: bool,
    /// One-shot query timeout in seconds; `0` waits forever.
    pub request_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            in_flight: DEFAULT_IN_FLIGHT,
            sequential: true,
            resequence: true,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl ClientConfig {
    /// Layer defaults, an optional TOML file and `EBB__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ClientError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );
        let settings = builder
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;
        let config: Self = settings
            .try_deserialize()
            .map_err(|e| ClientError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.in_flight == 0 {
            return Err(ClientError::InvalidWindow(0));
        }
        self.connection.url().map(|_| ())
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }
}
