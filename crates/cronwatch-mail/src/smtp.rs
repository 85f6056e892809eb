//! SMTP alert delivery via async lettre.

use async_trait::async_trait;
use cronwatch_core::config::SmtpConfig;
use cronwatch_core::error::{CronWatchError, Result};
use cronwatch_core::traits::Notifier;
use cronwatch_core::types::Alert;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

/// Mails each alert to the configured recipients.
pub struct EmailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl EmailNotifier {
    pub fn from_config(config: &SmtpConfig) -> Result<Self> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e| CronWatchError::Config(format!("Invalid smtp.from: {e}")))?;

        let to = config
            .recipients
            .iter()
            .map(|addr| {
                addr.parse::<Mailbox>()
                    .map_err(|e| CronWatchError::Config(format!("Invalid recipient '{addr}': {e}")))
            })
            .collect::<Result<Vec<_>>>()?;
        if to.is_empty() {
            return Err(CronWatchError::Config("smtp.recipients is empty".into()));
        }

        // 465 is implicit TLS; otherwise STARTTLS unless TLS is disabled.
        let builder = if config.port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| CronWatchError::Config(format!("SMTP relay: {e}")))?
        } else if config.tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| CronWatchError::Config(format!("SMTP relay: {e}")))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };
        let mut builder = builder.port(config.port);

        if let (Some(user), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            from,
            to,
        })
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn notify(&self, alert: &Alert) -> Result<()> {
        let mut builder = Message::builder().from(self.from.clone());
        for recipient in &self.to {
            builder = builder.to(recipient.clone());
        }

        let email = builder
            .subject(alert.title())
            .header(ContentType::TEXT_PLAIN)
            .body(alert_body(alert))
            .map_err(|e| CronWatchError::Notifier(format!("Build email: {e}")))?;

        self.transport
            .send(email)
            .await
            .map_err(|e| CronWatchError::Notifier(format!("SMTP send: {e}")))?;

        tracing::info!("📤 Alert mailed to {} recipient(s): {}", self.to.len(), alert.title());
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "email"
    }
}

/// Plain-text alert body.
pub fn alert_body(alert: &Alert) -> String {
    let mut body = format!(
        "Job:       {}\nJob ID:    {}\nSeverity:  {}\nDeadline:  {}\nDetected:  {}\n\n{}\n",
        alert.job_name,
        alert.job_id,
        alert.severity,
        alert.deadline.format("%Y-%m-%d %H:%M UTC"),
        alert.detected_at.format("%Y-%m-%d %H:%M:%S UTC"),
        alert.message,
    );
    if let Some(id) = alert.id {
        body.push_str(&format!("\nAlert #{id}\n"));
    }
    body
}
