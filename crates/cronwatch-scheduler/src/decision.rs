//! Alert decision for one check cycle.
//!
//! | evidence                    | before deadline | at/after deadline |
//! |-----------------------------|-----------------|-------------------|
//! | complete, received in time  | pass            | pass              |
//! | complete, received late     | n/a             | fail (late)       |
//! | partial                     | pending         | fail (incomplete) |
//! | none                        | pending         | fail (missing)    |

use chrono::{DateTime, Utc};
use cronwatch_core::types::{Completeness, EvidenceResult, ExecutionStatus, MonitoredJob};
use serde::Serialize;

use crate::deadline::ArmedCheck;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No candidate message.
    Missing,
    /// Newest candidate lacks required keys.
    Incomplete,
    /// Complete confirmation received after the deadline.
    Late,
}

impl FailureKind {
    pub fn execution_status(&self) -> ExecutionStatus {
        match self {
            FailureKind::Missing => ExecutionStatus::Missing,
            FailureKind::Incomplete => ExecutionStatus::Partial,
            FailureKind::Late => ExecutionStatus::Late,
        }
    }

    /// Human-readable alert message.
    pub fn describe(&self, job: &MonitoredJob, armed: &ArmedCheck, evidence: &EvidenceResult) -> String {
        let expected = armed.expected_run.format("%Y-%m-%d %H:%M UTC");
        let deadline = armed.deadline.format("%Y-%m-%d %H:%M UTC");
        match self {
            FailureKind::Missing => format!(
                "No confirmation matching '{}' for the run expected at {expected} (deadline {deadline}).",
                job.subject_pattern
            ),
            FailureKind::Incomplete => {
                let missing: Vec<&str> = job
                    .patterns
                    .iter()
                    .filter(|p| p.required && !evidence.fields.contains_key(&p.extraction_name))
                    .map(|p| p.extraction_name.as_str())
                    .collect();
                format!(
                    "Confirmation for the run expected at {expected} is missing required data: {}.",
                    missing.join(", ")
                )
            }
            FailureKind::Late => {
                let received = evidence
                    .received_at
                    .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
                    .unwrap_or_else(|| "unknown".into());
                format!(
                    "Confirmation for the run expected at {expected} arrived at {received}, after the deadline {deadline}."
                )
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "verdict", content = "reason")]
pub enum Verdict {
    Pass,
    /// Deadline not reached and evidence not yet complete.
    Pending,
    Fail(FailureKind),
}

pub fn decide(evidence: &EvidenceResult, armed: &ArmedCheck, now: DateTime<Utc>) -> Verdict {
    if evidence.completeness == Completeness::Complete {
        let in_time = evidence.received_at.is_none_or(|r| r <= armed.deadline);
        return if in_time {
            Verdict::Pass
        } else {
            Verdict::Fail(FailureKind::Late)
        };
    }
    if now < armed.deadline {
        return Verdict::Pending;
    }
    match evidence.completeness {
        Completeness::Partial => Verdict::Fail(FailureKind::Incomplete),
        _ => Verdict::Fail(FailureKind::Missing),
    }
}
