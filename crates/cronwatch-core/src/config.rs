//! CronWatch configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CronWatchError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CronWatchConfig {
    #[serde(default)]
    pub mailbox: MailboxConfig,
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

impl CronWatchConfig {
    /// Load config from the default path (~/.cronwatch/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default().with_env_overrides())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CronWatchError::Config(format!("Failed to read config: {e}")))?;
        tracing::debug!("Loaded config from {}", path.display());
        Self::from_toml(&content)
    }

    /// Parse config text and apply environment overrides.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| CronWatchError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config.with_env_overrides())
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| CronWatchError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the CronWatch home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cronwatch")
    }

    /// Secrets may come from the environment instead of the config file.
    fn with_env_overrides(mut self) -> Self {
        if let Ok(password) = std::env::var("CRONWATCH_MAIL_PASSWORD") {
            self.mailbox.password = password;
        }
        if let Some(smtp) = self.smtp.as_mut() {
            if let Ok(password) = std::env::var("CRONWATCH_SMTP_PASSWORD") {
                smtp.password = Some(password);
            }
        }
        if let Some(tg) = self.notify.telegram.as_mut() {
            if let Ok(token) = std::env::var("CRONWATCH_TELEGRAM_TOKEN") {
                tg.bot_token = token;
            }
        }
        self
    }

    /// Problems that make the config unusable for `serve`.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.mailbox.host.is_empty() {
            problems.push("mailbox.host is empty".to_string());
        }
        if self.mailbox.user.is_empty() {
            problems.push("mailbox.user is empty".to_string());
        }
        if self.monitor.sweep_interval_secs == 0 {
            problems.push("monitor.sweep_interval_secs must be > 0".to_string());
        }
        if let Some(smtp) = &self.smtp {
            if smtp.recipients.is_empty() {
                problems.push("smtp.recipients is empty".to_string());
            }
        }
        problems
    }
}

/// IMAP mailbox the confirmations arrive in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxConfig {
    #[serde(default = "default_imap_host")]
    pub host: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_mailbox")]
    pub mailbox: String,
    #[serde(default = "default_fetch_limit")]
    pub max_fetch: usize,
}

fn default_imap_host() -> String { "imap.example.com".into() }
fn default_imap_port() -> u16 { 993 }
fn default_mailbox() -> String { "INBOX".into() }
fn default_fetch_limit() -> usize { 200 }

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            host: default_imap_host(),
            port: default_imap_port(),
            user: String::new(),
            password: String::new(),
            mailbox: default_mailbox(),
            max_fetch: default_fetch_limit(),
        }
    }
}

/// Outbound SMTP used to mail alerts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default = "bool_true")]
    pub tls: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub from: String,
    #[serde(default)]
    pub recipients: Vec<String>,
}

fn default_smtp_port() -> u16 { 587 }
fn bool_true() -> bool { true }

/// Scheduling and checking behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Interval of the reconciliation sweep over all active jobs.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Minimum mailbox lookback; the job's own period is used when larger.
    #[serde(default = "default_lookback_floor")]
    pub lookback_floor_minutes: u32,
    /// Messages received this long before a cycle's expected run still count for it.
    #[serde(default = "default_clock_skew")]
    pub clock_skew_minutes: u32,
    /// How long shutdown waits for in-flight checks.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
    /// Tolerance assigned to jobs created without one.
    #[serde(default = "default_tolerance")]
    pub default_tolerance_minutes: u32,
    /// List passing cycles in execution history. Passes are always stored;
    /// they end a job's failure streak.
    #[serde(default = "bool_true")]
    pub record_success: bool,
}

fn default_sweep_interval() -> u64 { 3600 }
fn default_lookback_floor() -> u32 { 60 }
fn default_clock_skew() -> u32 { 5 }
fn default_drain_timeout() -> u64 { 30 }
fn default_tolerance() -> u32 { 10 }

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            lookback_floor_minutes: default_lookback_floor(),
            clock_skew_minutes: default_clock_skew(),
            drain_timeout_secs: default_drain_timeout(),
            default_tolerance_minutes: default_tolerance(),
            record_success: true,
        }
    }
}

/// HTTP management API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 { 3000 }
fn default_host() -> String { "127.0.0.1".into() }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

/// SQLite database location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.cronwatch/cronwatch.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

impl DatabaseConfig {
    /// Path with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

/// Additional alert channels besides SMTP.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotifyConfig {
    #[serde(default)]
    pub webhooks: Vec<WebhookConfig>,
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,
    #[serde(default)]
    pub discord: Option<DiscordConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Name recorded in notification history (e.g. "zabbix").
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    pub chat_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    pub webhook_url: String,
}
