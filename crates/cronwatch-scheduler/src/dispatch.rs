//! Notification dispatch — HTTP alert channels.
//! Supports: Telegram Bot API, Discord Webhook, generic HTTP Webhook.
//! SMTP lives in `cronwatch_mail::smtp`.

use async_trait::async_trait;
use cronwatch_core::config::CronWatchConfig;
use cronwatch_core::error::{CronWatchError, Result};
use cronwatch_core::traits::Notifier;
use cronwatch_core::types::{Alert, Severity};
use cronwatch_mail::EmailNotifier;

/// Notification target configuration.
#[derive(Debug, Clone)]
pub enum NotifyTarget {
    /// Telegram Bot API — send via `sendMessage`.
    Telegram { bot_token: String, chat_id: String },
    /// Discord Webhook URL.
    Discord { webhook_url: String },
    /// Generic HTTP webhook — POST with JSON body.
    Webhook {
        url: String,
        headers: Vec<(String, String)>,
    },
}

/// An HTTP-based alert channel.
pub struct HttpNotifier {
    name: String,
    target: NotifyTarget,
    client: reqwest::Client,
}

impl HttpNotifier {
    pub fn new(name: &str, target: NotifyTarget) -> Self {
        Self {
            name: name.to_string(),
            target,
            client: reqwest::Client::new(),
        }
    }

    async fn post(&self, url: &str, payload: serde_json::Value, headers: &[(String, String)]) -> Result<()> {
        let mut req = self
            .client
            .post(url)
            .json(&payload)
            .timeout(std::time::Duration::from_secs(10));
        for (key, value) in headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| CronWatchError::Notifier(format!("{} send failed: {e}", self.name)))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(CronWatchError::Notifier(format!("{} error {status}: {body}", self.name)))
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        match &self.target {
            NotifyTarget::Telegram { bot_token, chat_id } => {
                let url = format!("https://api.telegram.org/bot{bot_token}/sendMessage");
                self.post(&url, telegram_payload(chat_id, alert), &[]).await
            }
            NotifyTarget::Discord { webhook_url } => {
                self.post(webhook_url, discord_payload(alert), &[]).await
            }
            NotifyTarget::Webhook { url, headers } => {
                self.post(url, webhook_payload(alert), headers).await
            }
        }
    }

    fn channel_name(&self) -> &str {
        &self.name
    }
}

fn severity_emoji(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "🚨",
        Severity::Error => "❗",
        Severity::Warning => "⚠️",
        Severity::Info => "ℹ️",
    }
}

pub fn telegram_payload(chat_id: &str, alert: &Alert) -> serde_json::Value {
    let text = format!(
        "{} *{}*\n\n{}\n\n_Deadline: {}_",
        severity_emoji(alert.severity),
        escape_markdown(&alert.title()),
        escape_markdown(&alert.message),
        alert.deadline.format("%Y-%m-%d %H:%M UTC")
    );
    serde_json::json!({
        "chat_id": chat_id,
        "text": text,
        "parse_mode": "Markdown"
    })
}

pub fn discord_payload(alert: &Alert) -> serde_json::Value {
    let color = match alert.severity {
        Severity::Critical => 0xFF0000, // Red
        Severity::Error => 0xFF8800,    // Orange
        Severity::Warning => 0xFFCC00,  // Yellow
        Severity::Info => 0x00AAFF,     // Blue
    };
    serde_json::json!({
        "embeds": [{
            "title": alert.title(),
            "description": alert.message,
            "color": color,
            "footer": {
                "text": format!("Job {} • deadline {}", alert.job_id, alert.deadline.format("%Y-%m-%d %H:%M UTC"))
            }
        }]
    })
}

pub fn webhook_payload(alert: &Alert) -> serde_json::Value {
    serde_json::json!({
        "alert_id": alert.id,
        "job_id": alert.job_id,
        "job_name": alert.job_name,
        "severity": alert.severity.as_str(),
        "title": alert.title(),
        "message": alert.message,
        "deadline": alert.deadline.to_rfc3339(),
        "detected_at": alert.detected_at.to_rfc3339(),
    })
}

/// Escape Telegram MarkdownV1 special characters.
fn escape_markdown(s: &str) -> String {
    s.replace('_', "\\_")
        .replace('*', "\\*")
        .replace('[', "\\[")
        .replace('`', "\\`")
}

/// Build every configured alert channel.
/// SMTP first, then webhooks, Telegram and Discord.
pub fn notifiers_from_config(config: &CronWatchConfig) -> Result<Vec<Box<dyn Notifier>>> {
    let mut notifiers: Vec<Box<dyn Notifier>> = Vec::new();

    if let Some(smtp) = &config.smtp {
        notifiers.push(Box::new(EmailNotifier::from_config(smtp)?));
    }

    for webhook in &config.notify.webhooks {
        notifiers.push(Box::new(HttpNotifier::new(
            &webhook.name,
            NotifyTarget::Webhook {
                url: webhook.url.clone(),
                headers: webhook.headers.clone(),
            },
        )));
    }

    if let Some(tg) = &config.notify.telegram {
        if tg.bot_token.is_empty() {
            tracing::warn!("⚠️ Telegram configured without a bot token; skipped");
        } else {
            notifiers.push(Box::new(HttpNotifier::new(
                "telegram",
                NotifyTarget::Telegram {
                    bot_token: tg.bot_token.clone(),
                    chat_id: tg.chat_id.clone(),
                },
            )));
        }
    }

    if let Some(discord) = &config.notify.discord {
        notifiers.push(Box::new(HttpNotifier::new(
            "discord",
            NotifyTarget::Discord {
                webhook_url: discord.webhook_url.clone(),
            },
        )));
    }

    Ok(notifiers)
}
