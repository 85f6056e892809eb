//! Deadlines: when a job's confirmation must have arrived.
//!
//! `Deadline = next expected run + tolerance`. The pair is captured when a
//! timer is armed so a later tolerance edit never moves an armed deadline.

use chrono::{DateTime, Duration, Utc};
use cronwatch_core::types::MonitoredJob;
use serde::{Deserialize, Serialize};

use crate::cron::{CronError, CronExpression};

/// The cycle a timer is armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArmedCheck {
    pub expected_run: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

impl ArmedCheck {
    fn new(expected_run: DateTime<Utc>, tolerance: Duration) -> Self {
        Self {
            expected_run,
            deadline: expected_run + tolerance,
        }
    }
}

/// Mailbox range to search for one cycle's confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvidenceWindow {
    /// Lower bound passed to the mailbox query.
    pub query_since: DateTime<Utc>,
    /// Messages received before this belong to an earlier cycle.
    pub cycle_start: DateTime<Utc>,
}

/// Next cycle whose run is strictly after `reference`.
pub fn deadline(job: &MonitoredJob, reference: DateTime<Utc>) -> Result<ArmedCheck, CronError> {
    let expr = CronExpression::parse(&job.schedule)?;
    Ok(ArmedCheck::new(expr.next_after(reference)?, job.tolerance()))
}

/// Most recent cycle whose deadline has already passed at `now`.
pub fn last_due(job: &MonitoredJob, now: DateTime<Utc>) -> Result<Option<ArmedCheck>, CronError> {
    let expr = CronExpression::parse(&job.schedule)?;
    let tolerance = job.tolerance();
    Ok(expr
        .previous_at_or_before(now - tolerance)?
        .map(|run| ArmedCheck::new(run, tolerance)))
}

/// Most recent cycle whose run is at or before `now`, due or not.
pub fn latest_run(job: &MonitoredJob, now: DateTime<Utc>) -> Result<Option<ArmedCheck>, CronError> {
    let expr = CronExpression::parse(&job.schedule)?;
    Ok(expr
        .previous_at_or_before(now)?
        .map(|run| ArmedCheck::new(run, job.tolerance())))
}

/// Lookback of at least one period (or `floor`, if larger) before `now`,
/// always reaching back to the cycle's own start.
pub fn evidence_window(
    job: &MonitoredJob,
    armed: &ArmedCheck,
    now: DateTime<Utc>,
    floor: Duration,
    clock_skew: Duration,
) -> Result<EvidenceWindow, CronError> {
    let expr = CronExpression::parse(&job.schedule)?;
    let period = expr.period_after(armed.expected_run)?;
    let cycle_start = armed.expected_run - clock_skew;
    let lookback = period.max(floor);
    Ok(EvidenceWindow {
        query_since: (now - lookback).min(cycle_start),
        cycle_start,
    })
}
