//! Service configuration.
//!
//! Sources are layered, later ones overriding earlier ones:
//!
//! 1. built-in defaults
//! 2. an optional file (toml / yaml / json, detected from the extension)
//! 3. environment variables prefixed `MOFA_EXTPROC_`, nested with `__`
//!    (e.g. `MOFA_EXTPROC_DISPATCHER__WORKERS=32`)

use crate::decoder::DEFAULT_MAX_DECODED_BYTES;
use crate::error::ConfigError;
use crate::ratelimit::DispatcherConfig;
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

pub const ENV_PREFIX: &str = "MOFA_EXTPROC";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExtProcConfig {
    /// Address the gRPC server binds to.
    pub listen_addr: String,
    pub dispatcher: DispatcherConfig,
    pub decoder: DecoderConfig,
    pub rate_limiter: RateLimiterConfig,
    pub log: LogConfig,
}

impl Default for ExtProcConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8082".to_string(),
            dispatcher: DispatcherConfig::default(),
            decoder: DecoderConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
            log: LogConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DecoderConfig {
    /// Decompressed bodies larger than this are not inspected.
    pub max_decoded_bytes: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            max_decoded_bytes: DEFAULT_MAX_DECODED_BYTES,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// gRPC endpoint of the rate-limit service. Batches are only logged when unset.
    pub endpoint: Option<String>,
    /// Rate-limit domain sent with every request.
    pub domain: String,
    /// Applies to establishing the connection only, never to a call.
    pub connect_timeout_ms: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            domain: "Default".to_string(),
            connect_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` wins when set.
    pub filter: String,
    /// Emit JSON lines instead of the human-readable format.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl ExtProcConfig {
    /// Load defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, environment())
    }

    fn load_with_env(path: Option<&Path>, env: Environment) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let config: Self = builder.add_source(env).build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a config document in the given format, without environment overrides.
    pub fn from_str(content: &str, format: FileFormat) -> Result<Self, ConfigError> {
        let config: Self = Config::builder()
            .add_source(File::from_str(content, format))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.socket_addr()?;
        if self.dispatcher.workers == 0 {
            return Err(invalid("dispatcher.workers", "must be greater than 0"));
        }
        if self.dispatcher.queue_capacity == 0 {
            return Err(invalid("dispatcher.queue_capacity", "must be greater than 0"));
        }
        if self.decoder.max_decoded_bytes == 0 {
            return Err(invalid("decoder.max_decoded_bytes", "must be greater than 0"));
        }
        if self.rate_limiter.domain.trim().is_empty() {
            return Err(invalid("rate_limiter.domain", "cannot be empty"));
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_addr
            .parse()
            .map_err(|e: std::net::AddrParseError| invalid("listen_addr", &e.to_string()))
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}
