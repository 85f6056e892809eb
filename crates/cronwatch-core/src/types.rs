//! Core data model — monitored jobs, mail patterns, evidence and alerts.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CronWatchError;

/// A remote cron job whose confirmation email we watch for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitoredJob {
    /// Stable job ID.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// 5-field cron expression describing when the job is expected to run.
    pub schedule: String,
    /// Subject criterion: a literal substring, or a `/regex/`.
    pub subject_pattern: String,
    /// Grace period added to the expected run before absence is alertable.
    #[serde(default = "default_tolerance")]
    pub tolerance_minutes: u32,
    #[serde(default = "bool_true")]
    pub active: bool,
    /// Extraction patterns, in declaration order.
    #[serde(default)]
    pub patterns: Vec<MailPattern>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_tolerance() -> u32 {
    10
}
fn bool_true() -> bool {
    true
}

impl MonitoredJob {
    /// Create a new active job with a fresh UUID.
    pub fn new(name: &str, schedule: &str, subject_pattern: &str, tolerance_minutes: u32) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: String::new(),
            schedule: schedule.to_string(),
            subject_pattern: subject_pattern.to_string(),
            tolerance_minutes,
            active: true,
            patterns: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder-style pattern registration.
    pub fn with_pattern(mut self, pattern: MailPattern) -> Self {
        self.patterns.push(pattern);
        self
    }

    /// Tolerance as a chrono duration.
    pub fn tolerance(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.tolerance_minutes))
    }
}

/// How a pattern's value is interpreted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Regex,
    Keyword,
    JsonPath,
}

/// Which part of the message a pattern reads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TargetField {
    Subject,
    Body,
    From,
    To,
    Headers,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::Regex => "regex",
            PatternKind::Keyword => "keyword",
            PatternKind::JsonPath => "json_path",
        }
    }
}

impl FromStr for PatternKind {
    type Err = CronWatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "regex" => Ok(PatternKind::Regex),
            "keyword" => Ok(PatternKind::Keyword),
            "json_path" => Ok(PatternKind::JsonPath),
            other => Err(CronWatchError::Config(format!("unknown pattern kind '{other}'"))),
        }
    }
}

impl TargetField {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetField::Subject => "subject",
            TargetField::Body => "body",
            TargetField::From => "from",
            TargetField::To => "to",
            TargetField::Headers => "headers",
        }
    }
}

impl FromStr for TargetField {
    type Err = CronWatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subject" => Ok(TargetField::Subject),
            "body" => Ok(TargetField::Body),
            "from" => Ok(TargetField::From),
            "to" => Ok(TargetField::To),
            "headers" => Ok(TargetField::Headers),
            other => Err(CronWatchError::Config(format!("unknown target field '{other}'"))),
        }
    }
}

/// A declarative extraction rule belonging to one job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MailPattern {
    #[serde(default)]
    pub id: Option<i64>,
    /// Display name (used in logs).
    pub name: String,
    pub kind: PatternKind,
    pub target: TargetField,
    /// Regex source, keyword, or dot-separated JSON path.
    pub value: String,
    /// Key the extracted value is stored under.
    pub extraction_name: String,
    /// Evaluation order, highest first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub required: bool,
}

impl MailPattern {
    pub fn new(kind: PatternKind, target: TargetField, value: &str, extraction_name: &str) -> Self {
        Self {
            id: None,
            name: extraction_name.to_string(),
            kind,
            target,
            value: value.to_string(),
            extraction_name: extraction_name.to_string(),
            priority: 0,
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// A fetched, MIME-parsed message as the core sees it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CandidateMessage {
    pub message_id: String,
    pub subject: String,
    /// Plain text body, or text rendered from HTML when no plain part exists.
    pub body: String,
    /// Raw HTML body, if the message had one.
    #[serde(default)]
    pub html_body: Option<String>,
    pub from: String,
    pub to: String,
    /// Lower-cased header name → value (repeated headers joined with ", ").
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub received_at: DateTime<Utc>,
}

/// Completeness verdict for a job's evidence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Completeness {
    Complete,
    Partial,
    None,
}

/// Output of evidence extraction for one job against its candidate message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvidenceResult {
    /// extraction name → extracted value.
    pub fields: BTreeMap<String, serde_json::Value>,
    pub completeness: Completeness,
    pub message_id: Option<String>,
    pub received_at: Option<DateTime<Utc>>,
    /// Names of patterns skipped because they failed to compile or evaluate.
    #[serde(default)]
    pub skipped: Vec<String>,
}

impl EvidenceResult {
    /// The verdict for an empty candidate pool.
    pub fn none() -> Self {
        Self {
            fields: BTreeMap::new(),
            completeness: Completeness::None,
            message_id: None,
            received_at: None,
            skipped: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completeness == Completeness::Complete
    }
}

/// Alert severity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    /// Escalation by the number of failed cycles immediately preceding this one.
    pub fn for_consecutive_failures(prior: u32) -> Self {
        match prior {
            0 => Severity::Warning,
            1 | 2 => Severity::Error,
            _ => Severity::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = CronWatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            "critical" => Ok(Severity::Critical),
            other => Err(CronWatchError::Config(format!("unknown severity '{other}'"))),
        }
    }
}

/// Alert lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Open,
    Acknowledged,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Open => "open",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Resolved => "resolved",
        }
    }

    /// Open and acknowledged alerts are still unresolved.
    pub fn is_unresolved(&self) -> bool {
        !matches!(self, AlertStatus::Resolved)
    }
}

impl FromStr for AlertStatus {
    type Err = CronWatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(AlertStatus::Open),
            "acknowledged" => Ok(AlertStatus::Acknowledged),
            "resolved" => Ok(AlertStatus::Resolved),
            other => Err(CronWatchError::Config(format!("unknown alert status '{other}'"))),
        }
    }
}

/// A missing, late or incomplete confirmation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    /// Assigned by the store; `None` until persisted.
    #[serde(default)]
    pub id: Option<i64>,
    pub job_id: String,
    pub job_name: String,
    /// The armed deadline this alert is about.
    pub deadline: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
    pub severity: Severity,
    pub message: String,
    pub status: AlertStatus,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub resolved_by: Option<String>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    /// Build the initial open record for a failed cycle.
    pub fn open(job: &MonitoredJob, deadline: DateTime<Utc>, severity: Severity, message: String) -> Self {
        Self {
            id: None,
            job_id: job.id.clone(),
            job_name: job.name.clone(),
            deadline,
            detected_at: Utc::now(),
            severity,
            message,
            status: AlertStatus::Open,
            notes: None,
            resolved_by: None,
            resolved_at: None,
        }
    }

    /// Subject line used by mail-style notifiers.
    pub fn title(&self) -> String {
        format!(
            "[{}] Cron job alert: {}",
            self.severity.as_str().to_uppercase(),
            self.job_name
        )
    }
}

/// Outcome recorded for one check cycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Partial,
    Late,
    Missing,
    Failure,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Partial => "partial",
            ExecutionStatus::Late => "late",
            ExecutionStatus::Missing => "missing",
            ExecutionStatus::Failure => "failure",
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, ExecutionStatus::Success)
    }
}

impl FromStr for ExecutionStatus {
    type Err = CronWatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ExecutionStatus::Success),
            "partial" => Ok(ExecutionStatus::Partial),
            "late" => Ok(ExecutionStatus::Late),
            "missing" => Ok(ExecutionStatus::Missing),
            "failure" => Ok(ExecutionStatus::Failure),
            other => Err(CronWatchError::Config(format!("unknown execution status '{other}'"))),
        }
    }
}

/// Durable record of one check cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRecord {
    #[serde(default)]
    pub id: Option<i64>,
    pub job_id: String,
    pub checked_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
    /// Job run duration reported in the confirmation, in seconds.
    #[serde(default)]
    pub duration_secs: Option<u64>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// One delivery attempt of an alert through one channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationRecord {
    pub alert_id: i64,
    pub channel: String,
    pub sent_at: DateTime<Utc>,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Aggregate alert counters over a recent window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AlertStats {
    pub total: u64,
    pub open: u64,
    pub acknowledged: u64,
    pub resolved: u64,
    pub by_severity: BTreeMap<String, u64>,
    /// Mean seconds from detection to resolution, over resolved alerts.
    pub avg_resolution_secs: Option<f64>,
}
