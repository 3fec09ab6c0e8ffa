//! Layered configuration.
//!
//! Sources, lowest precedence first:
//! 1. built-in defaults (the `Default` impls below),
//! 2. a TOML file (`relay.toml` unless `--config` points elsewhere),
//! 3. `RELAY__<SECTION>__<KEY>` environment variables,
//! 4. command line flags.

// External crates
use anyhow::{Context, Result};
use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::instrument;

/// Config file looked up in the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "relay.toml";

#[derive(Debug, Default, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub connection: ConnectionConfig,
    pub queue: QueueConfig,
    pub shutdown: ShutdownConfig,
    pub logging: LoggingConfig,
}

/// Values given on the command line, applied on top of every other source.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub server_url: Option<String>,
    pub session_id: Option<String>,
    pub auth_token: Option<String>,
    pub quiet: bool,
}

impl Config {
    /// Load and merge every configuration source.
    ///
    /// An explicitly given file must exist, the default `relay.toml` may be
    /// missing.
    #[instrument(
        name = "relay_config::load",
        target = "helpers::load_config",
        level = "trace",
        skip_all
    )]
    pub fn load(path: Option<&Path>, overrides: &CliOverrides) -> Result<Self> {
        let (file_path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };

        tracing::trace!(
            configuration_file_path = %file_path.display(),
            required,
            "Loading relay configuration"
        );

        let mut builder = config::Config::builder()
            .add_source(
                File::from(file_path.clone())
                    .format(FileFormat::Toml)
                    .required(required),
            )
            .add_source(
                Environment::with_prefix("RELAY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("general.server_url", overrides.server_url.clone())?
            .set_override_option("general.session_id", overrides.session_id.clone())?
            .set_override_option("general.auth_token", overrides.auth_token.clone())?;

        if overrides.quiet {
            builder = builder.set_override("general.quiet", true)?;
        }

        let config: Config = builder
            .build()
            .with_context(|| format!("Failed to read configuration from {:?}", file_path))?
            .try_deserialize()
            .with_context(|| format!("Invalid configuration in {:?}", file_path))?;

        tracing::trace!(
            configuration_file_path = %file_path.display(),
            "Relay configuration loaded successfully"
        );
        Ok(config)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    /// Collector endpoint. `http(s)://` is accepted and rewritten to `ws(s)://`.
    pub server_url: String,
    pub session_id: Option<String>,
    /// Bearer token sent on the WebSocket handshake.
    pub auth_token: Option<String>,
    /// Base URL of the session viewer, printed at startup when set.
    pub viewer_url: Option<String>,
    /// Suppress status lines on stderr.
    pub quiet: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:4000/ws".to_string(),
            session_id: None,
            auth_token: None,
            viewer_url: None,
            quiet: false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ConnectionConfig {
    pub connection_timeout_ms: u64,
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u64>,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub backoff_factor: f64,
    pub retry_jitter: f64,
    /// Wait between issuing a join and starting delivery.
    pub join_settle_ms: u64,
    /// Events the transport accepts ahead of the socket before reporting saturation.
    pub outbound_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_timeout_ms: 10_000,
            max_reconnect_attempts: None,
            initial_retry_delay_ms: 500,
            max_retry_delay_ms: 10_000,
            backoff_factor: 2.0,
            retry_jitter: 0.2,
            join_settle_ms: 500,
            outbound_capacity: 64,
        }
    }
}

impl ConnectionConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn join_settle(&self) -> Duration {
        Duration::from_millis(self.join_settle_ms)
    }
}

/// What a bounded queue does with an event that does not fit.
#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    #[default]
    DropOldest,
    DropNewest,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct QueueConfig {
    /// `None` leaves the queue unbounded.
    pub capacity: Option<usize>,
    pub overflow_policy: OverflowPolicy,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ShutdownConfig {
    pub poll_interval_ms: u64,
    /// How long after end of input a connection that is not joined is waited
    /// for before queued events are forfeited.
    pub connect_grace_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            connect_grace_ms: 10_000,
        }
    }
}

impl ShutdownConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn connect_grace(&self) -> Duration {
        Duration::from_millis(self.connect_grace_ms)
    }
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set.
    pub level: String,
    pub format: LogFormat,
    /// Write logs to a daily rolling file in this directory instead of stderr.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: LogFormat::Pretty,
            directory: None,
        }
    }
}
