//! Application configuration.
//!
//! Configuration is loaded from a TOML file at:
//! 1. `--config PATH` on the command line
//! 2. `$MAILSTASH_CONFIG` (environment variable)
//! 3. `~/.config/mailstash/config.toml` (Linux/macOS)
//!    `%APPDATA%\mailstash\config.toml` (Windows)
//! 4. Built-in defaults
//!
//! Secrets can additionally be supplied through `MAILSTASH_IMAP_PASSWORD`,
//! `MAILSTASH_PDF_PASSWORD` and `MAILSTASH_DROPBOX_TOKEN`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StashError};

/// A credential that never shows up in `Debug` output or logs.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(\"***\")")
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    /// Mailbox server and credentials.
    pub imap: ImapConfig,
    /// Which messages to pick up.
    pub filter: FilterConfig,
    /// Where attachments are written before post-processing.
    pub staging: StagingConfig,
    pub decrypt: DecryptConfig,
    pub archive: ArchiveConfig,
    pub schedule: ScheduleConfig,
}

/// General behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
    /// Override cache directory for logs.
    pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    /// Connect over implicit TLS (port 993). Plain TCP otherwise.
    pub tls: bool,
    pub username: String,
    pub password: Option<Secret>,
    pub mailbox: String,
    /// Applies to connecting and logging in.
    pub connect_timeout_secs: u64,
    /// Flag matched messages `\Seen` once they have been found.
    pub mark_seen: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Sender address matched with `FROM`.
    pub sender: String,
    /// Restrict the search to `UNSEEN` messages.
    pub unseen_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagingConfig {
    pub dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecryptConfig {
    /// Decryption program, invoked qpdf-style.
    pub program: PathBuf,
    pub password: Option<Secret>,
    /// Extension of the date-named decrypted file.
    pub extension: String,
    /// Exit codes treated as success (qpdf exits 3 on warnings).
    pub success_codes: Vec<i32>,
    /// Treat every exit, whatever its status, as success.
    pub accept_any_exit: bool,
}

/// Archive backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveBackend {
    Dropbox,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub backend: ArchiveBackend,
    /// Remote directory that yearly folders are created under.
    pub remote_prefix: String,
    pub dropbox_token: Option<Secret>,
    pub dropbox_endpoint: String,
    /// Root directory for the `local` backend.
    pub local_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Seconds between two poll cycles.
    pub interval_secs: u64,
}

// ── Default implementations ─────────────────────────────────────

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            cache_dir: None,
        }
    }
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            host: "imap-mail.outlook.com".to_string(),
            port: 993,
            tls: true,
            username: String::new(),
            password: None,
            mailbox: "INBOX".to_string(),
            connect_timeout_secs: 60,
            mark_seen: true,
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            sender: String::new(),
            unseen_only: true,
        }
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./pdf"),
        }
    }
}

impl Default for DecryptConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("qpdf"),
            password: None,
            extension: "pdf".to_string(),
            success_codes: vec![0, 3],
            accept_any_exit: false,
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            backend: ArchiveBackend::Dropbox,
            remote_prefix: "/statement_ppc".to_string(),
            dropbox_token: None,
            dropbox_endpoint: "https://content.dropboxapi.com/2/files/upload".to_string(),
            local_dir: None,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30 * 60,
        }
    }
}

impl ImapConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl ScheduleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

impl Config {
    /// Replace secrets with values from the environment when present.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let secret = |name: &str| lookup(name).filter(|v| !v.is_empty()).map(Secret::new);
        if let Some(v) = secret("MAILSTASH_IMAP_PASSWORD") {
            self.imap.password = Some(v);
        }
        if let Some(v) = secret("MAILSTASH_PDF_PASSWORD") {
            self.decrypt.password = Some(v);
        }
        if let Some(v) = secret("MAILSTASH_DROPBOX_TOKEN") {
            self.archive.dropbox_token = Some(v);
        }
    }

    /// Check everything a poll cycle needs before connecting.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.imap.host.trim().is_empty() {
            missing.push("imap.host");
        }
        if self.imap.username.trim().is_empty() {
            missing.push("imap.username");
        }
        if self.imap.password.as_ref().is_none_or(Secret::is_empty) {
            missing.push("imap.password");
        }
        if self.filter.sender.trim().is_empty() {
            missing.push("filter.sender");
        }
        if self.decrypt.password.is_none() {
            missing.push("decrypt.password");
        }
        match self.archive.backend {
            ArchiveBackend::Dropbox
                if self.archive.dropbox_token.as_ref().is_none_or(Secret::is_empty) =>
            {
                missing.push("archive.dropbox_token");
            }
            ArchiveBackend::Local if self.archive.local_dir.is_none() => {
                missing.push("archive.local_dir");
            }
            _ => {}
        }
        if !missing.is_empty() {
            return Err(StashError::Config(format!(
                "missing required settings: {}",
                missing.join(", ")
            )));
        }
        if !self.decrypt.accept_any_exit && self.decrypt.success_codes.is_empty() {
            return Err(StashError::Config(
                "decrypt.success_codes is empty and accept_any_exit is false".to_string(),
            ));
        }
        Ok(())
    }
}

// ── Load ────────────────────────────────────────────────────────

/// Load configuration, searching standard locations.
///
/// Returns the default configuration if no file is found or on parse error.
/// Environment overrides are applied in every case.
pub fn load_config() -> Config {
    let mut config = Config::default();
    if let Some(path) = config_file_path() {
        if path.exists() {
            match load_config_from(&path) {
                Ok(cfg) => {
                    tracing::info!(path = %path.display(), "Loaded config");
                    config = cfg;
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to load config, using defaults"
                    );
                }
            }
        }
    }
    config.apply_env_overrides();
    config
}

/// Load configuration from an explicit file. Errors are returned, not
/// replaced by defaults.
pub fn load_config_from(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path).map_err(|e| StashError::io(path, e))?;
    let mut config: Config = toml::from_str(&contents)
        .map_err(|e| StashError::Config(format!("{}: {e}", path.display())))?;
    config.apply_env_overrides();
    Ok(config)
}

/// Determine the config file path (checking env var first, then standard dirs).
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var("MAILSTASH_CONFIG") {
        return Some(PathBuf::from(env_path));
    }
    dirs::config_dir().map(|d| d.join("mailstash").join("config.toml"))
}

/// Return the cache directory for logs.
pub fn cache_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.general.cache_dir {
        return dir.clone();
    }
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mailstash")
}

/// Return the log file path.
pub fn log_file_path(config: &Config) -> PathBuf {
    cache_dir(config).join("mailstash.log")
}
