//! Collaborator traits — the I/O boundaries the monitor talks through.
//!
//! Every method is a potentially failing remote operation; the monitor
//! contains their errors within a single job's check cycle.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{
    Alert, AlertStats, AlertStatus, CandidateMessage, ExecutionRecord, MonitoredJob,
    NotificationRecord,
};

/// Source of candidate confirmation messages.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Messages whose subject matches `subject_pattern` received since `since`.
    ///
    /// `subject_pattern` is a literal substring, or a regular expression
    /// delimited by leading and trailing `/`.
    async fn find_messages(
        &self,
        subject_pattern: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<CandidateMessage>>;

    /// Human-readable name (e.g. "imap").
    fn name(&self) -> &str;
}

/// Outbound alert channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver an alert through this channel.
    async fn notify(&self, alert: &Alert) -> Result<()>;

    /// Channel name used in logs and notification history.
    fn channel_name(&self) -> &str;
}

/// Durable storage for jobs, executions, alerts and notification history.
#[async_trait]
pub trait JobStore: Send + Sync {
    // ── Jobs ──
    async fn get_job(&self, id: &str) -> Result<Option<MonitoredJob>>;
    async fn list_jobs(&self) -> Result<Vec<MonitoredJob>>;
    async fn list_active_jobs(&self) -> Result<Vec<MonitoredJob>>;
    /// Insert or replace a job together with its pattern set.
    async fn save_job(&self, job: &MonitoredJob) -> Result<()>;
    /// Returns `false` when the job did not exist.
    async fn delete_job(&self, id: &str) -> Result<bool>;
    /// Returns the updated job, or `None` when it did not exist.
    async fn set_job_active(&self, id: &str, active: bool) -> Result<Option<MonitoredJob>>;

    // ── Executions ──
    async fn record_execution(&self, record: &ExecutionRecord) -> Result<i64>;
    async fn recent_executions(&self, job_id: &str, limit: usize) -> Result<Vec<ExecutionRecord>>;
    /// Failed executions recorded since the job's last success.
    async fn consecutive_failures(&self, job_id: &str) -> Result<u32>;

    // ── Alerts ──
    async fn create_alert(&self, alert: &Alert) -> Result<i64>;
    async fn get_alert(&self, id: i64) -> Result<Option<Alert>>;
    /// An unresolved alert for the same job and deadline, if one exists.
    async fn find_unresolved_alert(&self, job_id: &str, deadline: DateTime<Utc>) -> Result<Option<Alert>>;
    async fn update_alert_status(
        &self,
        id: i64,
        status: AlertStatus,
        notes: Option<&str>,
        resolved_by: Option<&str>,
    ) -> Result<Option<Alert>>;
    /// Open and acknowledged alerts, newest first.
    async fn active_alerts(&self, limit: usize, offset: usize) -> Result<Vec<Alert>>;
    async fn alert_stats(&self, days: u32) -> Result<AlertStats>;

    // ── Notification history ──
    async fn record_notification(&self, record: &NotificationRecord) -> Result<i64>;
    async fn notification_history(&self, alert_id: i64) -> Result<Vec<NotificationRecord>>;
}
