//! Configuration system for the `ProjChat` broker.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/projchat-broker/config.toml`)
//! 4. Compiled defaults
//!
//! Accounts come only from the file: each `[[users]]` entry maps a bearer
//! token to the member it authenticates as.

use std::path::PathBuf;
use std::time::Duration;

use projchat_proto::member::{Member, MemberRole};
use projchat_proto::message::{MAX_CONTENT_SIZE, UserId};

/// Errors that can occur when loading broker configuration.
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

    /// Two `[[users]]` entries share a token.
    #[error("duplicate token for user {0}")]
    DuplicateToken(String),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure for the broker.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct BrokerConfigFile {
    server: ServerFileConfig,
    users: Vec<UserFileEntry>,
}

/// `[server]` section of the broker config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    max_content_size: Option<usize>,
    auth_timeout_ms: Option<u64>,
}

/// One `[[users]]` entry.
#[derive(Debug, serde::Deserialize)]
struct UserFileEntry {
    token: String,
    id: String,
    name: String,
    email: String,
    #[serde(default)]
    avatar_url: Option<String>,
    #[serde(default = "default_role")]
    role: MemberRole,
}

const fn default_role() -> MemberRole {
    MemberRole::Member
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the broker.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "ProjChat channel broker")]
pub struct BrokerCliArgs {
    /// Address to bind the broker to.
    #[arg(short, long, env = "PROJCHAT_BROKER_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/projchat-broker/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Maximum message content size in bytes.
    #[arg(long)]
    pub max_content_size: Option<usize>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "PROJCHAT_BROKER_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// A bearer token and the member it authenticates as.
#[derive(Clone)]
pub struct Account {
    /// Token accepted by `authenticate` and the REST routes.
    pub token: String,
    /// Identity behind the token.
    pub member: Member,
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("token", &"<redacted>")
            .field("member", &self.member)
            .finish()
    }
}

impl Account {
    /// Convenience constructor for tests and demos.
    #[must_use]
    pub fn new(token: &str, id: &str, name: &str) -> Self {
        Self {
            token: token.to_string(),
            member: Member {
                id: UserId::new(id),
                name: name.to_string(),
                email: format!("{}@example.com", name.to_lowercase().replace(' ', ".")),
                avatar_url: None,
                role: MemberRole::Member,
            },
        }
    }
}

/// Fully resolved broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address to bind the server to (e.g., `0.0.0.0:9000`).
    pub bind_addr: String,
    /// Maximum accepted message content size in bytes.
    pub max_content_size: usize,
    /// How long a new connection may take to send `authenticate`.
    pub auth_timeout: Duration,
    /// Known accounts, in roster order.
    pub accounts: Vec<Account>,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".to_string(),
            max_content_size: MAX_CONTENT_SIZE,
            auth_timeout: Duration::from_secs(10),
            accounts: Vec::new(),
            log_level: "info".to_string(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path is tried and missing file
    /// is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, or if two accounts share a token.
    pub fn load(cli: &BrokerCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Self::resolve(cli, file)
    }

    /// Resolve a `BrokerConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    fn resolve(cli: &BrokerCliArgs, file: BrokerConfigFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let mut accounts: Vec<Account> = Vec::with_capacity(file.users.len());
        for entry in file.users {
            if accounts.iter().any(|a| a.token == entry.token) {
                return Err(ConfigError::DuplicateToken(entry.id));
            }
            accounts.push(Account {
                token: entry.token,
                member: Member {
                    id: UserId::new(entry.id),
                    name: entry.name,
                    email: entry.email,
                    avatar_url: entry.avatar_url,
                    role: entry.role,
                },
            });
        }

        Ok(Self {
            bind_addr: cli
                .bind
                .clone()
                .or(file.server.bind_addr)
                .unwrap_or(defaults.bind_addr),
            max_content_size: cli
                .max_content_size
                .or(file.server.max_content_size)
                .unwrap_or(defaults.max_content_size),
            auth_timeout: file
                .server
                .auth_timeout_ms
                .map_or(defaults.auth_timeout, Duration::from_millis),
            accounts,
            log_level: cli.log_level.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file for the broker.
fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<BrokerConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(BrokerConfigFile::default());
        };
        config_dir.join("projchat-broker").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BrokerConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
