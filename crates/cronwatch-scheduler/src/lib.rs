//! # CronWatch Scheduler
//!
//! Decides, per monitored job and per cycle, whether the confirmation email
//! arrived in time and with the expected content.
//!
//! - [`cron`]: 5-field cron evaluation (UTC)
//! - [`deadline`]: expected run + tolerance
//! - [`registry`]: one deadline timer per job, plus the periodic sweep
//! - [`decision`]: pass / pending / fail from evidence and deadline
//! - [`monitor`]: the check cycle tying mailbox, store and notifiers together
//! - [`notify`] / [`dispatch`]: alert fan-out over email, webhooks, Telegram, Discord
//! - [`persistence`]: SQLite-backed [`JobStore`](cronwatch_core::JobStore)

pub mod cron;
pub mod deadline;
pub mod decision;
pub mod dispatch;
pub mod monitor;
pub mod notify;
pub mod persistence;
pub mod registry;

pub use cron::{CronError, CronExpression, next_run_from_cron};
pub use deadline::ArmedCheck;
pub use decision::{FailureKind, Verdict};
pub use monitor::{CheckOutcome, CheckReport, JobMonitor, MonitorSettings};
pub use notify::NotifyRouter;
pub use persistence::SchedulerDb;
pub use registry::TimerRegistry;
