//! Configuration system for the `ProjChat` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/projchat/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use projchat_proto::message::{ChannelId, UserId};

use crate::chat::SessionConfig;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    connection: ConnectionFileConfig,
    reconnect: ReconnectFileConfig,
    typing: TypingFileConfig,
    api: ApiFileConfig,
    session: SessionFileConfig,
}

/// `[connection]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConnectionFileConfig {
    server_url: Option<String>,
    connect_timeout_ms: Option<u64>,
    handshake_timeout_ms: Option<u64>,
    leave_timeout_ms: Option<u64>,
    command_buffer: Option<usize>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    base_delay_ms: Option<u64>,
    multiplier: Option<f64>,
    jitter: Option<f64>,
    max_delay_ms: Option<u64>,
    max_retries: Option<u32>,
}

/// `[typing]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct TypingFileConfig {
    inactivity_timeout_ms: Option<u64>,
    remote_ttl_ms: Option<u64>,
    sweep_interval_ms: Option<u64>,
}

/// `[api]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ApiFileConfig {
    base_url: Option<String>,
    timeout_secs: Option<u64>,
}

/// `[session]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SessionFileConfig {
    channel_id: Option<String>,
    user_id: Option<String>,
    auth_token: Option<String>,
    event_buffer: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Reconnection backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt.
    pub base_delay: Duration,
    /// Growth factor applied per attempt (clamped to at least 1.0).
    pub multiplier: f64,
    /// Random extra delay as a fraction of the computed delay (0.0..=1.0).
    pub jitter: f64,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Attempts allowed before the connection is declared fatal.
    pub max_retries: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: 0.2,
            max_delay: Duration::from_secs(30),
            max_retries: 8,
        }
    }
}

/// Connection manager configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// Time allowed for the server to answer `authenticate`.
    pub handshake_timeout: Duration,
    /// Time `disconnect` waits for the graceful `leave-channel` + close.
    pub leave_timeout: Duration,
    /// Capacity of the outbound command queue.
    pub command_buffer: usize,
    /// Reconnection backoff.
    pub reconnect: ReconnectConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            leave_timeout: Duration::from_secs(2),
            command_buffer: 64,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Typing presence configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingConfig {
    /// Inactivity after which a local `typing:stop` is emitted.
    pub inactivity_timeout: Duration,
    /// Lifetime of a remote typing indicator without refresh.
    pub remote_ttl: Duration,
    /// How often the session sweeps expired remote indicators.
    pub sweep_interval: Duration,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_millis(2000),
            remote_ttl: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Connection --
    /// Chat server WebSocket URL.
    pub server_url: Option<String>,
    /// Timeout for opening the WebSocket.
    pub connect_timeout: Duration,
    /// Connection manager settings.
    pub connection: ConnectionConfig,

    // -- Typing --
    /// Typing presence settings.
    pub typing: TypingConfig,

    // -- REST --
    /// Base URL of the dashboard REST API.
    pub api_base_url: Option<String>,
    /// Per-request timeout for REST calls.
    pub api_timeout: Duration,

    // -- Session --
    /// Channel (project chat) to open.
    pub channel_id: Option<String>,
    /// The logged-in member.
    pub user_id: Option<String>,
    /// Session token used for the handshake and REST calls.
    pub auth_token: Option<String>,
    /// Capacity of the session event queue handed to the UI.
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            connect_timeout: Duration::from_secs(10),
            connection: ConnectionConfig::default(),
            typing: TypingConfig::default(),
            api_base_url: None,
            api_timeout: Duration::from_secs(15),
            channel_id: None,
            user_id: None,
            auth_token: None,
            event_buffer: 256,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path
    /// (`~/.config/projchat/config.toml`) is tried and silently ignored if
    /// missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let reconnect_defaults = defaults.connection.reconnect.clone();
        let ms = Duration::from_millis;

        Self {
            server_url: cli
                .server_url
                .clone()
                .or_else(|| file.connection.server_url.clone()),
            connect_timeout: file
                .connection
                .connect_timeout_ms
                .map_or(defaults.connect_timeout, ms),
            connection: ConnectionConfig {
                handshake_timeout: file
                    .connection
                    .handshake_timeout_ms
                    .map_or(defaults.connection.handshake_timeout, ms),
                leave_timeout: file
                    .connection
                    .leave_timeout_ms
                    .map_or(defaults.connection.leave_timeout, ms),
                command_buffer: file
                    .connection
                    .command_buffer
                    .unwrap_or(defaults.connection.command_buffer),
                reconnect: ReconnectConfig {
                    base_delay: file
                        .reconnect
                        .base_delay_ms
                        .map_or(reconnect_defaults.base_delay, ms),
                    multiplier: file
                        .reconnect
                        .multiplier
                        .unwrap_or(reconnect_defaults.multiplier),
                    jitter: file.reconnect.jitter.unwrap_or(reconnect_defaults.jitter),
                    max_delay: file
                        .reconnect
                        .max_delay_ms
                        .map_or(reconnect_defaults.max_delay, ms),
                    max_retries: cli
                        .max_retries
                        .or(file.reconnect.max_retries)
                        .unwrap_or(reconnect_defaults.max_retries),
                },
            },
            typing: TypingConfig {
                inactivity_timeout: file
                    .typing
                    .inactivity_timeout_ms
                    .map_or(defaults.typing.inactivity_timeout, ms),
                remote_ttl: file
                    .typing
                    .remote_ttl_ms
                    .map_or(defaults.typing.remote_ttl, ms),
                sweep_interval: file
                    .typing
                    .sweep_interval_ms
                    .map_or(defaults.typing.sweep_interval, ms),
            },
            api_base_url: cli
                .api_url
                .clone()
                .or_else(|| file.api.base_url.clone()),
            api_timeout: file
                .api
                .timeout_secs
                .map_or(defaults.api_timeout, Duration::from_secs),
            channel_id: cli
                .channel
                .clone()
                .or_else(|| file.session.channel_id.clone()),
            user_id: cli
                .user_id
                .clone()
                .or_else(|| file.session.user_id.clone()),
            auth_token: cli
                .token
                .clone()
                .or_else(|| file.session.auth_token.clone()),
            event_buffer: file
                .session
                .event_buffer
                .unwrap_or(defaults.event_buffer),
        }
    }

    /// Build a [`SessionConfig`] from this configuration, if the channel,
    /// user and token are all known.
    #[must_use]
    pub fn to_session_config(&self) -> Option<SessionConfig> {
        let channel_id = self.channel_id.clone().filter(|c| !c.is_empty())?;
        let user_id = self.user_id.clone().filter(|u| !u.is_empty())?;
        let auth_token = self.auth_token.clone()?;

        Some(SessionConfig {
            channel_id: ChannelId::new(channel_id),
            user_id: UserId::new(user_id),
            auth_token,
            typing: self.typing.clone(),
            event_buffer: self.event_buffer,
        })
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Real-time project chat client")]
pub struct CliArgs {
    /// WebSocket URL of the chat server.
    #[arg(long, env = "PROJCHAT_SERVER_URL")]
    pub server_url: Option<String>,

    /// Base URL of the REST API.
    #[arg(long, env = "PROJCHAT_API_URL")]
    pub api_url: Option<String>,

    /// Channel (project chat) to open.
    #[arg(long, env = "PROJCHAT_CHANNEL")]
    pub channel: Option<String>,

    /// Your member id.
    #[arg(long, env = "PROJCHAT_USER_ID")]
    pub user_id: Option<String>,

    /// Session token.
    #[arg(long, env = "PROJCHAT_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Reconnect attempts before giving up.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Path to config file (default: `~/.config/projchat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "PROJCHAT_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/projchat.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("projchat").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
