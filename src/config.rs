//! Configuration loading and validation.
//!
//! The config file is human-owned TOML at `~/.filemailer/config.toml`.
//! Secrets never live here; the config names the `.env` keys that hold them.
//! The loaded [`Config`] is immutable and handed to constructors.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Telegram front-end settings.
    pub telegram: TelegramConfig,

    /// HTTP `/send` service settings.
    #[serde(default)]
    pub http: HttpConfig,

    /// Delivery pipeline policy.
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Outbound SMTP relay.
    pub smtp: SmtpConfig,

    /// Database location.
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Telegram-specific configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    /// Credential name holding the bot token.
    #[serde(default = "default_bot_token_env")]
    pub bot_token_env: String,

    /// Chat id of the administrative channel. Only this chat may decide
    /// e-mail change requests.
    pub admin_chat_id: i64,
}

/// HTTP service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Whether `start` also serves HTTP.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address.
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_listen(),
        }
    }
}

/// Delivery pipeline policy.
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Size ceiling in bytes; `0` disables it.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,

    /// Scratch directory for staged downloads.
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,

    /// Job log file.
    #[serde(default)]
    pub job_log: Option<PathBuf>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: default_max_file_bytes(),
            scratch_dir: None,
            job_log: None,
        }
    }
}

impl DeliveryConfig {
    /// The ceiling as an option, `None` when disabled.
    pub fn size_limit(&self) -> Option<u64> {
        (self.max_file_bytes > 0).then_some(self.max_file_bytes)
    }
}

/// TLS mode for the SMTP connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Plain connection upgraded with STARTTLS.
    #[default]
    Starttls,
    /// Implicit TLS.
    Tls,
    /// No TLS. Local relays only.
    None,
}

/// SMTP relay configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    /// Relay hostname.
    pub host: String,

    /// Relay port.
    #[serde(default = "default_smtp_port")]
    pub port: u16,

    /// Username for authentication.
    #[serde(default)]
    pub username: Option<String>,

    /// Sender address.
    pub from: String,

    /// Sender display name.
    #[serde(default = "default_from_name")]
    pub from_name: String,

    /// TLS mode.
    #[serde(default)]
    pub tls: TlsMode,

    /// Connection timeout in seconds.
    #[serde(default = "default_smtp_timeout")]
    pub timeout_secs: u64,

    /// Credential name holding the SMTP password.
    #[serde(default = "default_password_env")]
    pub password_env: String,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_smtp_port(),
            username: None,
            from: String::new(),
            from_name: default_from_name(),
            tls: TlsMode::default(),
            timeout_secs: default_smtp_timeout(),
            password_env: default_password_env(),
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

// Default value functions for serde

fn default_bot_token_env() -> String {
    "FILEMAILER_TELEGRAM_TOKEN".to_owned()
}
fn default_true() -> bool {
    true
}
fn default_listen() -> String {
    "0.0.0.0:8080".to_owned()
}
fn default_max_file_bytes() -> u64 {
    524_288_000
}
fn default_smtp_port() -> u16 {
    587
}
fn default_from_name() -> String {
    "filemailer".to_owned()
}
fn default_smtp_timeout() -> u64 {
    30
}
fn default_password_env() -> String {
    "FILEMAILER_SMTP_PASSWORD".to_owned()
}

/// Starter config written by `filemailer init`.
pub const DEFAULT_CONFIG_TOML: &str = r#"[telegram]
bot_token_env = "FILEMAILER_TELEGRAM_TOKEN"
# Chat id of the administrators' chat. Change requests are decided there.
admin_chat_id = 0

[http]
enabled = true
listen = "0.0.0.0:8080"

[delivery]
# 0 disables the ceiling.
max_file_bytes = 524288000

[smtp]
host = "smtp.example.com"
port = 587
username = "filemailer@example.com"
from = "filemailer@example.com"
tls = "starttls"
password_env = "FILEMAILER_SMTP_PASSWORD"
"#;

/// Filesystem layout under `~/.filemailer/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    /// Root directory.
    pub root: PathBuf,
    /// `config.toml`.
    pub config_file: PathBuf,
    /// `.env` with secrets.
    pub env_file: PathBuf,
    /// Process log directory.
    pub logs_dir: PathBuf,
    /// Default scratch directory.
    pub scratch_dir: PathBuf,
    /// Default job log file.
    pub job_log: PathBuf,
    /// Default database file.
    pub database: PathBuf,
}

impl RuntimePaths {
    /// Layout rooted at an arbitrary directory.
    pub fn under(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            config_file: root.join("config.toml"),
            env_file: root.join(".env"),
            logs_dir: root.join("logs"),
            scratch_dir: root.join("scratch"),
            job_log: root.join("logs").join("send.log"),
            database: root.join("filemailer.db"),
        }
    }
}

impl Config {
    /// Database path, falling back to the runtime default.
    pub fn database_path(&self, paths: &RuntimePaths) -> PathBuf {
        self.database
            .path
            .clone()
            .unwrap_or_else(|| paths.database.clone())
    }

    /// Scratch directory, falling back to the runtime default.
    pub fn scratch_dir(&self, paths: &RuntimePaths) -> PathBuf {
        self.delivery
            .scratch_dir
            .clone()
            .unwrap_or_else(|| paths.scratch_dir.clone())
    }

    /// Job log path, falling back to the runtime default.
    pub fn job_log_path(&self, paths: &RuntimePaths) -> PathBuf {
        self.delivery
            .job_log
            .clone()
            .unwrap_or_else(|| paths.job_log.clone())
    }
}

/// Load the config from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config at {}: {e}", path.display()))?;
    let config: Config = toml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config at {}: {e}", path.display()))?;
    Ok(config)
}

/// Resolve the default config directory (`~/.filemailer/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(".filemailer"))
}

/// Resolve the runtime layout under [`config_dir`].
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn runtime_paths() -> anyhow::Result<RuntimePaths> {
    Ok(RuntimePaths::under(&config_dir()?))
}
