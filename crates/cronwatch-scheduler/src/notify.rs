//! Notification router — fans an alert out to every configured channel.
//! A failing channel never blocks the others.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use cronwatch_core::traits::Notifier;
use cronwatch_core::types::Alert;
use serde::Serialize;

/// Outcomes kept in memory for the info endpoint.
const HISTORY_LIMIT: usize = 100;

/// Result of delivering one alert through one channel.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DispatchOutcome {
    pub channel: String,
    pub alert_id: Option<i64>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub sent_at: DateTime<Utc>,
}

pub struct NotifyRouter {
    channels: Vec<Box<dyn Notifier>>,
    /// In-memory ring buffer of recent outcomes.
    history: Mutex<VecDeque<DispatchOutcome>>,
}

impl NotifyRouter {
    pub fn new(channels: Vec<Box<dyn Notifier>>) -> Self {
        Self {
            channels,
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Router with no channels (alerts are only persisted).
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.channels.iter().map(|c| c.channel_name()).collect()
    }

    /// Deliver `alert` through every channel, in registration order.
    pub async fn dispatch(&self, alert: &Alert) -> Vec<DispatchOutcome> {
        if self.channels.is_empty() {
            tracing::debug!("No notification channels configured");
            return Vec::new();
        }

        let mut outcomes = Vec::with_capacity(self.channels.len());
        for channel in &self.channels {
            let start = std::time::Instant::now();
            let result = channel.notify(alert).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            let error = match result {
                Ok(()) => {
                    tracing::info!("✅ {} notified: {}", channel.channel_name(), alert.title());
                    None
                }
                Err(e) => {
                    tracing::warn!("❌ {} notification failed: {e}", channel.channel_name());
                    Some(e.to_string())
                }
            };

            outcomes.push(DispatchOutcome {
                channel: channel.channel_name().to_string(),
                alert_id: alert.id,
                success: error.is_none(),
                error,
                duration_ms,
                sent_at: Utc::now(),
            });
        }

        self.record(&outcomes);
        outcomes
    }

    fn record(&self, outcomes: &[DispatchOutcome]) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        for outcome in outcomes {
            history.push_back(outcome.clone());
            if history.len() > HISTORY_LIMIT {
                history.pop_front();
            }
        }
    }

    /// Recent outcomes, oldest first.
    pub fn history(&self) -> Vec<DispatchOutcome> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.iter().cloned().collect()
    }
}

impl Default for NotifyRouter {
    fn default() -> Self {
        Self::empty()
    }
}
