//! Error types for CronWatch.

/// Every failure a CronWatch component can report.
///
/// Collaborator failures (`MailboxUnavailable`, `Persistence`, `Notifier`) are
/// contained within a single job's check cycle by the monitor.
#[derive(Debug, thiserror::Error)]
pub enum CronWatchError {
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Pattern '{pattern}' skipped: {reason}")]
    ExtractionPattern { pattern: String, reason: String },

    #[error("Mailbox unavailable: {0}")]
    MailboxUnavailable(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Notifier error: {0}")]
    Notifier(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Check already running for job {0}")]
    Busy(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CronWatchError {
    /// Short machine-readable kind, used in API error envelopes and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidSchedule(_) => "invalid_schedule",
            Self::ExtractionPattern { .. } => "extraction_pattern",
            Self::MailboxUnavailable(_) => "mailbox_unavailable",
            Self::Persistence(_) => "persistence",
            Self::Notifier(_) => "notifier",
            Self::Config(_) => "config",
            Self::NotFound(_) => "not_found",
            Self::Busy(_) => "busy",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }
}

pub type Result<T> = std::result::Result<T, CronWatchError>;
