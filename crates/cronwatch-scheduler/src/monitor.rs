//! Job monitor — runs one check cycle per due deadline.
//!
//! A cycle re-reads the job, queries the mailbox for the cycle's window,
//! extracts evidence from the newest candidate, decides, alerts on failure
//! and re-arms the job's timer. A collaborator error ends only the current
//! cycle; the timer is re-armed regardless.
//!
//! Checks for one job never overlap. A due check arriving while the job's
//! check is running is queued, and only the newest queued one is kept.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use cronwatch_core::config::MonitorConfig;
use cronwatch_core::error::{CronWatchError, Result};
use cronwatch_core::traits::{JobStore, Mailbox};
use cronwatch_core::types::{
    Alert, CandidateMessage, EvidenceResult, ExecutionRecord, ExecutionStatus, MonitoredJob,
    NotificationRecord, PatternKind, Severity,
};
use cronwatch_mail::extract;
use serde::Serialize;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::cron::{CronError, CronExpression};
use crate::deadline::{self, ArmedCheck};
use crate::decision::{self, FailureKind, Verdict};
use crate::notify::NotifyRouter;
use crate::registry::{CheckTrigger, JobFire, TimerRegistry};

/// Runtime knobs, derived from `[monitor]` config.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub sweep_interval: StdDuration,
    pub lookback_floor: Duration,
    pub clock_skew: Duration,
    pub drain_timeout: StdDuration,
}

impl From<&MonitorConfig> for MonitorSettings {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            sweep_interval: StdDuration::from_secs(config.sweep_interval_secs.max(1)),
            lookback_floor: Duration::minutes(i64::from(config.lookback_floor_minutes)),
            clock_skew: Duration::minutes(i64::from(config.clock_skew_minutes)),
            drain_timeout: StdDuration::from_secs(config.drain_timeout_secs),
        }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self::from(&MonitorConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckOutcome {
    Passed,
    Pending,
    Failed {
        reason: FailureKind,
        alert_id: Option<i64>,
        /// An unresolved alert for this cycle already existed.
        duplicate: bool,
    },
    Skipped {
        reason: String,
    },
}

/// Everything one check cycle decided.
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub job_id: String,
    pub job_name: String,
    pub trigger: CheckTrigger,
    pub armed: ArmedCheck,
    pub checked_at: DateTime<Utc>,
    pub candidates: usize,
    pub evidence: Option<EvidenceResult>,
    pub outcome: CheckOutcome,
    /// Cycle the job was re-armed for.
    pub next: Option<ArmedCheck>,
}

impl CheckReport {
    fn skipped(job: &MonitoredJob, trigger: CheckTrigger, armed: ArmedCheck, reason: &str) -> Self {
        Self {
            job_id: job.id.clone(),
            job_name: job.name.clone(),
            trigger,
            armed,
            checked_at: Utc::now(),
            candidates: 0,
            evidence: None,
            outcome: CheckOutcome::Skipped {
                reason: reason.to_string(),
            },
            next: None,
        }
    }
}

/// A job whose schedule cannot be armed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Unschedulable {
    pub job_id: String,
    pub job_name: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StartReport {
    pub scheduled: usize,
    pub unschedulable: Vec<Unschedulable>,
}

/// The task feeding timer fires into `submit`. Stopping it hands the
/// receiver back so the monitor can be started again.
struct Dispatcher {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<mpsc::UnboundedReceiver<JobFire>>,
}

/// Presence in the running map means a check is in progress.
#[derive(Default)]
struct CheckSlot {
    queued: Option<JobFire>,
}

pub struct JobMonitor {
    store: Arc<dyn JobStore>,
    mailbox: Arc<dyn Mailbox>,
    router: Arc<NotifyRouter>,
    registry: TimerRegistry,
    settings: MonitorSettings,
    fires: Mutex<Option<mpsc::UnboundedReceiver<JobFire>>>,
    dispatcher: Mutex<Option<Dispatcher>>,
    /// Held by job edits and by the re-arm that ends a check.
    edits: tokio::sync::Mutex<()>,
    running: Mutex<HashMap<String, CheckSlot>>,
    /// Latest decided deadline per job.
    settled: Mutex<HashMap<String, DateTime<Utc>>>,
    unschedulable: Mutex<HashMap<String, Unschedulable>>,
    in_flight: AtomicUsize,
    drained: Notify,
    stopping: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn invalid_schedule(job: &MonitoredJob, e: &CronError) -> CronWatchError {
    CronWatchError::InvalidSchedule(format!("'{}' ({}): {e}", job.schedule, job.name))
}

impl JobMonitor {
    pub fn new(
        store: Arc<dyn JobStore>,
        mailbox: Arc<dyn Mailbox>,
        router: Arc<NotifyRouter>,
        settings: MonitorSettings,
    ) -> Arc<Self> {
        let (registry, fires) = TimerRegistry::new();
        Arc::new(Self {
            store,
            mailbox,
            router,
            registry,
            settings,
            fires: Mutex::new(Some(fires)),
            dispatcher: Mutex::new(None),
            edits: tokio::sync::Mutex::new(()),
            running: Mutex::new(HashMap::new()),
            settled: Mutex::new(HashMap::new()),
            unschedulable: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            stopping: AtomicBool::new(false),
        })
    }

    pub fn registry(&self) -> &TimerRegistry {
        &self.registry
    }

    pub fn router(&self) -> &Arc<NotifyRouter> {
        &self.router
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn mailbox_name(&self) -> &str {
        self.mailbox.name()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Jobs currently reported as unschedulable, by name.
    pub fn unschedulable(&self) -> Vec<Unschedulable> {
        let mut jobs: Vec<Unschedulable> = lock(&self.unschedulable).values().cloned().collect();
        jobs.sort_by(|a, b| a.job_name.cmp(&b.job_name));
        jobs
    }

    /// Arm every active job, start consuming timer fires and start the sweep.
    pub async fn start(self: &Arc<Self>) -> Result<StartReport> {
        self.stopping.store(false, Ordering::SeqCst);

        let fires = lock(&self.fires).take();
        if let Some(mut fires) = fires {
            // fires queued before a shutdown belong to cancelled timers
            while fires.try_recv().is_ok() {}
            let (stop, mut stopped) = oneshot::channel();
            let monitor = Arc::downgrade(self);
            let handle = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = &mut stopped => break,
                        fire = fires.recv() => {
                            let Some(fire) = fire else { break };
                            let Some(monitor) = monitor.upgrade() else { break };
                            monitor.submit(fire);
                        }
                    }
                }
                fires
            });
            *lock(&self.dispatcher) = Some(Dispatcher { stop, handle });
        }

        let now = Utc::now();
        let jobs = self.store.list_active_jobs().await?;
        let mut report = StartReport::default();
        for job in &jobs {
            if let Ok(Some(_)) = self.arm_next(job, now) {
                report.scheduled += 1;
            }
        }
        report.unschedulable = self.unschedulable();

        let monitor = Arc::downgrade(self);
        self.registry.start_sweep(self.settings.sweep_interval, move || {
            let monitor = monitor.clone();
            async move {
                if let Some(monitor) = monitor.upgrade() {
                    monitor.sweep().await;
                }
            }
        });

        tracing::info!(
            "🚀 Monitoring {} job(s), {} unschedulable",
            report.scheduled,
            report.unschedulable.len()
        );
        Ok(report)
    }

    /// Cancel timers and the sweep, then wait (bounded) for in-flight checks.
    /// Returns `false` when the drain timed out.
    pub async fn shutdown(&self) -> bool {
        self.stopping.store(true, Ordering::SeqCst);
        self.registry.stop_all();
        let dispatcher = lock(&self.dispatcher).take();
        if let Some(Dispatcher { stop, handle }) = dispatcher {
            stop.send(()).ok();
            match handle.await {
                Ok(fires) => *lock(&self.fires) = Some(fires),
                Err(e) => tracing::warn!("⚠️ Fire dispatcher ended abnormally: {e}"),
            }
        }

        let wait = async {
            loop {
                let notified = self.drained.notified();
                if self.in_flight() == 0 {
                    break;
                }
                notified.await;
            }
        };
        let drained = tokio::time::timeout(self.settings.drain_timeout, wait).await.is_ok();
        if drained {
            tracing::info!("👋 Monitor stopped");
        } else {
            tracing::warn!("⏱️ Shutdown timed out with {} check(s) in flight", self.in_flight());
        }
        drained
    }

    // ─── Job management ──────────────────────────────────────

    /// Validate, persist and (re-)arm a job.
    pub async fn upsert_job(&self, mut job: MonitoredJob) -> Result<Option<ArmedCheck>> {
        CronExpression::parse(&job.schedule).map_err(|e| invalid_schedule(&job, &e))?;
        deadline::deadline(&job, Utc::now()).map_err(|e| invalid_schedule(&job, &e))?;
        for pattern in job.patterns.iter().filter(|p| p.kind == PatternKind::Regex) {
            extract::compile_regex(&pattern.value).map_err(|e| CronWatchError::ExtractionPattern {
                pattern: pattern.name.clone(),
                reason: e.to_string(),
            })?;
        }

        let _edit = self.edits.lock().await;
        job.updated_at = Utc::now();
        self.store.save_job(&job).await?;
        tracing::info!("📝 Saved job '{}' ({})", job.name, job.schedule);
        self.arm_next(&job, Utc::now())
    }

    /// Delete a job and cancel its timer. Returns whether it existed.
    pub async fn remove_job(&self, job_id: &str) -> Result<bool> {
        let _edit = self.edits.lock().await;
        let removed = self.store.delete_job(job_id).await?;
        self.forget(job_id);
        if removed {
            tracing::info!("🗑️ Removed job {job_id}");
        }
        Ok(removed)
    }

    /// Activate or deactivate a job. Returns the updated job, if it exists.
    pub async fn set_active(&self, job_id: &str, active: bool) -> Result<Option<MonitoredJob>> {
        let _edit = self.edits.lock().await;
        let Some(job) = self.store.set_job_active(job_id, active).await? else {
            return Ok(None);
        };
        if active {
            // an invalid schedule is reported through `unschedulable()`
            self.arm_next(&job, Utc::now()).ok();
        } else {
            self.registry.unschedule(job_id);
            tracing::info!("⏸️ Paused job '{}'", job.name);
        }
        Ok(Some(job))
    }

    // ─── Check scheduling ──────────────────────────────────────

    /// Queue a due check, coalescing with one already running for the job.
    pub fn submit(self: &Arc<Self>, fire: JobFire) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        let job_id = fire.job.id.clone();
        {
            let mut running = lock(&self.running);
            if let Some(slot) = running.get_mut(&job_id) {
                if slot.queued.replace(fire).is_some() {
                    tracing::debug!("Coalesced queued check for {job_id}");
                }
                return;
            }
            running.insert(job_id, CheckSlot::default());
        }
        self.spawn_worker(fire);
    }

    /// Check a job now, for its most recent run. Fails with `Busy` while
    /// another check for the job is running.
    pub async fn check_now(self: &Arc<Self>, job_id: &str) -> Result<CheckReport> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| CronWatchError::NotFound(format!("job {job_id}")))?;
        let now = Utc::now();
        let armed = match deadline::latest_run(&job, now) {
            Ok(Some(armed)) => armed,
            Ok(None) => deadline::deadline(&job, now).map_err(|e| invalid_schedule(&job, &e))?,
            Err(e) => return Err(invalid_schedule(&job, &e)),
        };

        {
            let mut running = lock(&self.running);
            if running.contains_key(job_id) {
                return Err(CronWatchError::Busy(job_id.to_string()));
            }
            running.insert(job_id.to_string(), CheckSlot::default());
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        let fire = JobFire {
            job: Arc::new(job),
            armed,
            trigger: CheckTrigger::Manual,
        };
        // Run detached so a dropped caller cannot leave the slot held.
        let monitor = Arc::clone(self);
        let id = job_id.to_string();
        let handle = tokio::spawn(async move {
            let result = monitor.run_check(fire).await;
            if let Some(next) = monitor.finish(&id) {
                monitor.spawn_worker(next);
            }
            monitor.leave();
            result
        });
        handle
            .await
            .map_err(|e| CronWatchError::Io(std::io::Error::other(format!("check task: {e}"))))?
    }

    /// Re-check every active job's last due cycle that has not been decided,
    /// arm jobs that lost their timer and drop timers of inactive jobs.
    pub async fn sweep(self: &Arc<Self>) {
        let jobs = match self.store.list_active_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!("⚠️ Sweep skipped: {e}");
                return;
            }
        };
        let now = Utc::now();

        let active: HashSet<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
        for timer in self.registry.snapshot() {
            if !active.contains(timer.job_id.as_str()) {
                self.registry.unschedule(&timer.job_id);
                tracing::debug!("Dropped timer of inactive job '{}'", timer.job_name);
            }
        }

        let mut rechecks = 0;
        for job in &jobs {
            match deadline::last_due(job, now) {
                Ok(Some(armed)) if !self.is_settled(&job.id, armed.deadline) => {
                    self.submit(JobFire {
                        job: Arc::new(job.clone()),
                        armed,
                        trigger: CheckTrigger::Sweep,
                    });
                    rechecks += 1;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    self.mark_unschedulable(job, &e);
                    continue;
                }
            }
            if self.registry.pending(&job.id).is_none() {
                self.arm_next(job, now).ok();
            }
        }
        tracing::info!("🔄 Sweep: {} active job(s), {rechecks} re-check(s)", jobs.len());
    }

    fn spawn_worker(self: &Arc<Self>, fire: JobFire) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let job_id = fire.job.id.clone();
            let mut next = Some(fire);
            while let Some(fire) = next {
                if let Err(e) = monitor.run_check(fire).await {
                    tracing::warn!("⚠️ Check for {job_id} ended early: {e}");
                }
                next = monitor.finish(&job_id);
            }
            monitor.leave();
        });
    }

    /// Release the job's slot, or hand back its queued check.
    fn finish(&self, job_id: &str) -> Option<JobFire> {
        let mut running = lock(&self.running);
        let queued = running.get_mut(job_id).and_then(|slot| slot.queued.take());
        if queued.is_none() {
            running.remove(job_id);
        }
        queued
    }

    fn leave(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    // ─── The check cycle ──────────────────────────────────────

    async fn run_check(&self, fire: JobFire) -> Result<CheckReport> {
        let JobFire {
            job: snapshot,
            armed,
            trigger,
        } = fire;
        let mut now = Utc::now();
        if trigger == CheckTrigger::Timer {
            // wall clock may trail the timer by a hair
            now = now.max(armed.deadline);
        }

        let job = match self.store.get_job(&snapshot.id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::info!("🗑️ '{}' no longer exists; check skipped", snapshot.name);
                self.forget(&snapshot.id);
                return Ok(CheckReport::skipped(&snapshot, trigger, armed, "job deleted"));
            }
            Err(e) => {
                tracing::warn!("⚠️ Could not reload '{}', using armed snapshot: {e}", snapshot.name);
                (*snapshot).clone()
            }
        };
        if !job.active {
            self.registry.unschedule(&job.id);
            return Ok(CheckReport::skipped(&job, trigger, armed, "job inactive"));
        }
        if trigger == CheckTrigger::Sweep && self.is_settled(&job.id, armed.deadline) {
            return Ok(CheckReport::skipped(&job, trigger, armed, "cycle already decided"));
        }
        if let Ok(upcoming) = deadline::deadline(&job, now)
            && upcoming.deadline != armed.deadline
        {
            tracing::debug!(
                "🔍 '{}' checking cycle due {} (next due {})",
                job.name,
                armed.deadline,
                upcoming.deadline
            );
        }

        let window = deadline::evidence_window(
            &job,
            &armed,
            now,
            self.settings.lookback_floor,
            self.settings.clock_skew,
        )
        .map_err(|e| {
            self.mark_unschedulable(&job, &e);
            invalid_schedule(&job, &e)
        })?;

        let messages = match self.mailbox.find_messages(&job.subject_pattern, window.query_since).await {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!("📭 Mailbox unavailable for '{}'; cycle abandoned: {e}", job.name);
                self.rearm(&job, now).await;
                return Err(e);
            }
        };

        let pool: Vec<CandidateMessage> = messages
            .into_iter()
            .filter(|m| m.received_at >= window.cycle_start)
            .collect();
        let candidate = extract::select_candidate(&pool);
        let evidence = match candidate {
            Some(message) => extract::extract(message, &job.patterns),
            None => EvidenceResult::none(),
        };
        let duration_secs = candidate.and_then(|m| extract::execution_duration_secs(&m.body));

        let outcome = match decision::decide(&evidence, &armed, now) {
            Verdict::Pass => {
                tracing::info!("✅ '{}' confirmed for {}", job.name, armed.expected_run);
                self.settle(&job.id, armed.deadline);
                self.record(&job, ExecutionStatus::Success, &evidence, duration_secs, None)
                    .await;
                CheckOutcome::Passed
            }
            Verdict::Pending => {
                tracing::debug!("⏳ '{}' pending until {}", job.name, armed.deadline);
                CheckOutcome::Pending
            }
            Verdict::Fail(reason) => {
                let message = reason.describe(&job, &armed, &evidence);
                let (alert_id, duplicate) = self.raise_alert(&job, &armed, &message).await;
                if !duplicate {
                    self.record(&job, reason.execution_status(), &evidence, duration_secs, Some(message))
                        .await;
                }
                self.settle(&job.id, armed.deadline);
                CheckOutcome::Failed {
                    reason,
                    alert_id,
                    duplicate,
                }
            }
        };

        let next = self.rearm(&job, now).await;
        Ok(CheckReport {
            job_id: job.id.clone(),
            job_name: job.name.clone(),
            trigger,
            armed,
            checked_at: now,
            candidates: pool.len(),
            evidence: Some(evidence),
            outcome,
            next,
        })
    }

    /// Persist and fan out an alert, unless this cycle already has an unresolved one.
    /// Returns the alert id and whether it was a duplicate.
    async fn raise_alert(&self, job: &MonitoredJob, armed: &ArmedCheck, message: &str) -> (Option<i64>, bool) {
        match self.store.find_unresolved_alert(&job.id, armed.deadline).await {
            Ok(Some(existing)) => {
                tracing::info!("🔕 '{}' already has an open alert for {}", job.name, armed.deadline);
                return (existing.id, true);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("⚠️ Alert lookup failed for '{}': {e}", job.name),
        }

        let prior = self.store.consecutive_failures(&job.id).await.unwrap_or_else(|e| {
            tracing::warn!("⚠️ Failure count unavailable for '{}': {e}", job.name);
            0
        });
        let severity = Severity::for_consecutive_failures(prior);
        let mut alert = Alert::open(job, armed.deadline, severity, message.to_string());
        match self.store.create_alert(&alert).await {
            Ok(id) => alert.id = Some(id),
            Err(e) => tracing::warn!("⚠️ Alert for '{}' not persisted: {e}", job.name),
        }
        tracing::warn!("🚨 [{severity}] {}: {message}", job.name);

        let outcomes = self.router.dispatch(&alert).await;
        if let Some(alert_id) = alert.id {
            for outcome in outcomes {
                let record = NotificationRecord {
                    alert_id,
                    channel: outcome.channel,
                    sent_at: outcome.sent_at,
                    success: outcome.success,
                    error: outcome.error,
                };
                if let Err(e) = self.store.record_notification(&record).await {
                    tracing::warn!("⚠️ Notification history not recorded: {e}");
                }
            }
        }
        (alert.id, false)
    }

    async fn record(
        &self,
        job: &MonitoredJob,
        status: ExecutionStatus,
        evidence: &EvidenceResult,
        duration_secs: Option<u64>,
        notes: Option<String>,
    ) {
        let record = ExecutionRecord {
            id: None,
            job_id: job.id.clone(),
            checked_at: Utc::now(),
            status,
            fields: evidence.fields.clone(),
            duration_secs,
            message_id: evidence.message_id.clone(),
            notes,
        };
        if let Err(e) = self.store.record_execution(&record).await {
            tracing::warn!("⚠️ Execution for '{}' not recorded: {e}", job.name);
        }
    }

    // ─── Arming ──────────────────────────────────────

    /// Arm the job's next cycle once a check ends. A job edited while the
    /// check ran keeps the timer its edit armed.
    async fn rearm(&self, checked: &MonitoredJob, now: DateTime<Utc>) -> Option<ArmedCheck> {
        let _edit = self.edits.lock().await;
        match self.store.get_job(&checked.id).await {
            Ok(Some(current)) => {
                if current != *checked
                    && let Some(armed) = self.registry.pending(&current.id)
                {
                    tracing::debug!("'{}' was edited during its check; keeping its new timer", current.name);
                    return Some(armed);
                }
                self.arm_next(&current, now).ok().flatten()
            }
            Ok(None) => {
                self.forget(&checked.id);
                None
            }
            Err(e) => {
                tracing::warn!("⚠️ Could not reload '{}' for re-arming: {e}", checked.name);
                self.arm_next(checked, now).ok().flatten()
            }
        }
    }

    /// Arm the first cycle whose deadline is still ahead of `now` and not yet decided.
    fn arm_next(&self, job: &MonitoredJob, now: DateTime<Utc>) -> Result<Option<ArmedCheck>> {
        if !job.active || self.stopping.load(Ordering::SeqCst) {
            self.registry.unschedule(&job.id);
            return Ok(None);
        }

        let settled = lock(&self.settled).get(&job.id).copied();
        let mut reference = now - job.tolerance();
        let armed = loop {
            match deadline::deadline(job, reference) {
                Ok(armed) if settled.is_some_and(|s| armed.deadline <= s) => {
                    reference = armed.expected_run;
                }
                Ok(armed) => break armed,
                Err(e) => {
                    self.mark_unschedulable(job, &e);
                    return Err(invalid_schedule(job, &e));
                }
            }
        };

        self.registry.arm(Arc::new(job.clone()), armed);
        lock(&self.unschedulable).remove(&job.id);
        tracing::debug!("⏰ '{}' armed for {} (deadline {})", job.name, armed.expected_run, armed.deadline);
        Ok(Some(armed))
    }

    fn mark_unschedulable(&self, job: &MonitoredJob, e: &CronError) {
        tracing::warn!("⚠️ Job '{}' is unschedulable: {e}", job.name);
        self.registry.unschedule(&job.id);
        lock(&self.unschedulable).insert(
            job.id.clone(),
            Unschedulable {
                job_id: job.id.clone(),
                job_name: job.name.clone(),
                error: e.to_string(),
            },
        );
    }

    fn forget(&self, job_id: &str) {
        self.registry.unschedule(job_id);
        lock(&self.settled).remove(job_id);
        lock(&self.unschedulable).remove(job_id);
    }

    fn is_settled(&self, job_id: &str, deadline: DateTime<Utc>) -> bool {
        lock(&self.settled).get(job_id).is_some_and(|s| *s >= deadline)
    }

    fn settle(&self, job_id: &str, deadline: DateTime<Utc>) {
        let mut settled = lock(&self.settled);
        let entry = settled.entry(job_id.to_string()).or_insert(deadline);
        if *entry < deadline {
            *entry = deadline;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cronwatch_core::traits::Notifier;
    use cronwatch_core::types::{AlertStatus, MailPattern, TargetField};
    use tokio::sync::Semaphore;

    use crate::persistence::SchedulerDb;

    #[derive(Default)]
    struct FakeMailbox {
        messages: Mutex<Vec<CandidateMessage>>,
        fail: AtomicBool,
        calls: AtomicUsize,
        gate: Option<Arc<Semaphore>>,
    }

    impl FakeMailbox {
        fn deliver(&self, message: CandidateMessage) {
            lock(&self.messages).push(message);
        }
    }

    #[async_trait]
    impl Mailbox for FakeMailbox {
        async fn find_messages(&self, _subject: &str, since: DateTime<Utc>) -> Result<Vec<CandidateMessage>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                let _permit = gate.acquire().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(CronWatchError::MailboxUnavailable("connection reset".into()));
            }
            let messages = lock(&self.messages);
            Ok(messages.iter().filter(|m| m.received_at >= since).cloned().collect())
        }

        fn name(&self) -> &str {
            "fake"
        }
    }

    struct CountingNotifier {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn notify(&self, _alert: &Alert) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn channel_name(&self) -> &str {
            "counting"
        }
    }

    struct Harness {
        db: Arc<SchedulerDb>,
        mailbox: Arc<FakeMailbox>,
        notified: Arc<AtomicUsize>,
        monitor: Arc<JobMonitor>,
    }

    fn harness_with(mailbox: FakeMailbox) -> Harness {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let mailbox = Arc::new(mailbox);
        let notified = Arc::new(AtomicUsize::new(0));
        let router = NotifyRouter::new(vec![Box::new(CountingNotifier { calls: notified.clone() })]);
        let monitor = JobMonitor::new(db.clone(), mailbox.clone(), Arc::new(router), MonitorSettings::default());
        Harness { db, mailbox, notified, monitor }
    }

    fn harness() -> Harness {
        harness_with(FakeMailbox::default())
    }

    fn job() -> MonitoredJob {
        MonitoredJob::new("Nightly export", "*/5 * * * *", "Export finished", 10).with_pattern(
            MailPattern::new(PatternKind::Regex, TargetField::Body, r"/processed (\d+) items/", "count")
                .required(),
        )
    }

    fn confirmation(body: &str, received_at: DateTime<Utc>) -> CandidateMessage {
        CandidateMessage {
            message_id: format!("<{}@host>", received_at.timestamp()),
            subject: "Export finished".into(),
            body: body.into(),
            received_at,
            ..Default::default()
        }
    }

    fn due_fire(job: &MonitoredJob) -> JobFire {
        JobFire {
            job: Arc::new(job.clone()),
            armed: deadline::last_due(job, Utc::now()).unwrap().unwrap(),
            trigger: CheckTrigger::Timer,
        }
    }

    async fn wait_for_alert(db: &SchedulerDb) -> bool {
        for _ in 0..400 {
            if !db.active_alerts(10, 0).await.unwrap().is_empty() {
                return true;
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
        false
    }

    async fn wait_idle(monitor: &JobMonitor) {
        for _ in 0..400 {
            if monitor.in_flight() == 0 && lock(&monitor.running).is_empty() {
                return;
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
        panic!("checks did not finish");
    }

    #[tokio::test]
    async fn test_missing_confirmation_raises_exactly_one_alert() {
        let h = harness();
        let job = job();
        h.monitor.upsert_job(job.clone()).await.unwrap();
        let fire = due_fire(&job);

        let report = h.monitor.run_check(fire.clone()).await.unwrap();
        assert!(matches!(
            report.outcome,
            CheckOutcome::Failed { reason: FailureKind::Missing, duplicate: false, alert_id: Some(_) }
        ));
        assert_eq!(report.candidates, 0);

        // the same cycle checked again does not alert twice
        let report = h.monitor.run_check(fire).await.unwrap();
        assert!(matches!(report.outcome, CheckOutcome::Failed { duplicate: true, .. }));

        let alerts = h.db.active_alerts(10, 0).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Warning);
        assert_eq!(h.notified.load(Ordering::SeqCst), 1);
        assert_eq!(h.db.consecutive_failures(&job.id).await.unwrap(), 1);

        let history = h.db.notification_history(alerts[0].id.unwrap()).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].success);
    }

    #[tokio::test]
    async fn test_severity_escalates_with_consecutive_failures() {
        let h = harness();
        let job = job();
        h.monitor.upsert_job(job.clone()).await.unwrap();

        let latest = deadline::last_due(&job, Utc::now()).unwrap().unwrap();
        let earlier = deadline::last_due(&job, latest.deadline - Duration::minutes(1)).unwrap().unwrap();
        for armed in [earlier, latest] {
            let fire = JobFire { job: Arc::new(job.clone()), armed, trigger: CheckTrigger::Timer };
            h.monitor.run_check(fire).await.unwrap();
        }

        let mut severities: Vec<Severity> =
            h.db.active_alerts(10, 0).await.unwrap().into_iter().map(|a| a.severity).collect();
        severities.sort();
        assert_eq!(severities, vec![Severity::Warning, Severity::Error]);
    }

    #[tokio::test]
    async fn test_complete_confirmation_passes() {
        let h = harness();
        let job = job();
        h.monitor.upsert_job(job.clone()).await.unwrap();
        let fire = due_fire(&job);
        h.mailbox.deliver(confirmation("processed 42 items", fire.armed.expected_run + Duration::minutes(1)));

        let report = h.monitor.run_check(fire.clone()).await.unwrap();
        assert_eq!(report.outcome, CheckOutcome::Passed);
        let evidence = report.evidence.unwrap();
        assert_eq!(evidence.fields["count"], serde_json::json!("42"));
        assert!(report.next.is_some_and(|next| next.deadline > fire.armed.deadline));

        assert!(h.db.active_alerts(10, 0).await.unwrap().is_empty());
        let executions = h.db.recent_executions(&job.id, 5).await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::Success);
        assert_eq!(h.notified.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_partial_and_late_confirmations_fail() {
        let h = harness();
        let job = job();
        h.monitor.upsert_job(job.clone()).await.unwrap();
        let fire = due_fire(&job);

        h.mailbox.deliver(confirmation("export done", fire.armed.expected_run + Duration::minutes(1)));
        let report = h.monitor.run_check(fire.clone()).await.unwrap();
        assert!(matches!(report.outcome, CheckOutcome::Failed { reason: FailureKind::Incomplete, .. }));

        h.db.update_alert_status(1, AlertStatus::Resolved, None, None).await.unwrap();
        h.mailbox.deliver(confirmation("processed 9 items", fire.armed.deadline + Duration::seconds(30)));
        let report = h.monitor.run_check(fire).await.unwrap();
        assert!(matches!(
            report.outcome,
            CheckOutcome::Failed { reason: FailureKind::Late, duplicate: false, .. }
        ));
    }

    #[tokio::test]
    async fn test_previous_cycle_message_does_not_count() {
        let h = harness();
        let job = job();
        h.monitor.upsert_job(job.clone()).await.unwrap();
        let fire = due_fire(&job);
        h.mailbox.deliver(confirmation("processed 1 items", fire.armed.expected_run - Duration::minutes(8)));

        let report = h.monitor.run_check(fire).await.unwrap();
        assert!(matches!(report.outcome, CheckOutcome::Failed { reason: FailureKind::Missing, .. }));
    }

    #[tokio::test]
    async fn test_mailbox_failure_abandons_cycle_but_rearms() {
        let h = harness();
        let job = job();
        h.monitor.upsert_job(job.clone()).await.unwrap();
        h.mailbox.fail.store(true, Ordering::SeqCst);
        h.monitor.registry().unschedule(&job.id);

        let err = h.monitor.run_check(due_fire(&job)).await.unwrap_err();
        assert_eq!(err.kind(), "mailbox_unavailable");
        assert!(h.monitor.registry().pending(&job.id).is_some());
        assert!(h.db.active_alerts(10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deleted_or_inactive_job_is_skipped() {
        let h = harness();
        let job = job();
        h.monitor.upsert_job(job.clone()).await.unwrap();
        let fire = due_fire(&job);

        h.monitor.set_active(&job.id, false).await.unwrap().unwrap();
        assert!(h.monitor.registry().pending(&job.id).is_none());
        let report = h.monitor.run_check(fire.clone()).await.unwrap();
        assert!(matches!(report.outcome, CheckOutcome::Skipped { .. }));

        assert!(h.monitor.remove_job(&job.id).await.unwrap());
        let report = h.monitor.run_check(fire).await.unwrap();
        assert_eq!(report.outcome, CheckOutcome::Skipped { reason: "job deleted".into() });
        assert_eq!(h.mailbox.calls.load(Ordering::SeqCst), 0);
        assert!(h.monitor.registry().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_rejects_bad_schedule_and_regex() {
        let h = harness();
        let bad = MonitoredJob::new("bad", "61 * * * *", "x", 10);
        let err = h.monitor.upsert_job(bad.clone()).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_schedule");
        assert!(h.db.get_job(&bad.id).await.unwrap().is_none());

        let never = MonitoredJob::new("never", "0 0 30 2 *", "x", 10);
        assert!(h.monitor.upsert_job(never).await.is_err());

        let bad_regex = MonitoredJob::new("regex", "0 * * * *", "x", 10)
            .with_pattern(MailPattern::new(PatternKind::Regex, TargetField::Body, "(open", "broken"));
        let err = h.monitor.upsert_job(bad_regex).await.unwrap_err();
        assert_eq!(err.kind(), "extraction_pattern");
    }

    #[tokio::test]
    async fn test_running_check_coalesces_queued_fires() {
        let gate = Arc::new(Semaphore::new(0));
        let h = harness_with(FakeMailbox { gate: Some(gate.clone()), ..Default::default() });
        let job = job();
        h.monitor.upsert_job(job.clone()).await.unwrap();

        h.monitor.submit(due_fire(&job));
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert_eq!(h.mailbox.calls.load(Ordering::SeqCst), 1);

        // two more while the first is blocked: only the newest is kept
        h.monitor.submit(due_fire(&job));
        h.monitor.submit(due_fire(&job));
        gate.add_permits(10);
        wait_idle(&h.monitor).await;

        assert_eq!(h.mailbox.calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.db.active_alerts(10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_check_now() {
        let h = harness();
        let job = job();
        h.monitor.upsert_job(job.clone()).await.unwrap();
        h.mailbox.deliver(confirmation("processed 3 items", Utc::now()));

        let report = h.monitor.check_now(&job.id).await.unwrap();
        assert_eq!(report.trigger, CheckTrigger::Manual);
        assert_eq!(report.outcome, CheckOutcome::Passed);
        assert!(lock(&h.monitor.running).is_empty());

        lock(&h.monitor.running).insert(job.id.clone(), CheckSlot::default());
        let err = h.monitor.check_now(&job.id).await.unwrap_err();
        assert_eq!(err.kind(), "busy");

        let err = h.monitor.check_now("nope").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_sweep_rechecks_last_due_cycle_once() {
        let h = harness();
        let job = job();
        h.monitor.upsert_job(job.clone()).await.unwrap();
        let paused = MonitoredJob::new("paused", "0 * * * *", "x", 10);
        h.monitor.upsert_job(paused.clone()).await.unwrap();
        h.db.set_job_active(&paused.id, false).await.unwrap();

        h.monitor.sweep().await;
        wait_idle(&h.monitor).await;
        assert_eq!(h.db.active_alerts(10, 0).await.unwrap().len(), 1);
        assert!(h.monitor.registry().pending(&paused.id).is_none());
        assert!(h.monitor.registry().pending(&job.id).is_some());

        let calls = h.mailbox.calls.load(Ordering::SeqCst);
        h.monitor.sweep().await;
        wait_idle(&h.monitor).await;
        assert_eq!(h.mailbox.calls.load(Ordering::SeqCst), calls);
        assert_eq!(h.db.active_alerts(10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_timer_fire_runs_check_and_shutdown_drains() {
        let h = harness();
        let job = job();
        h.db.save_job(&job).await.unwrap();

        let report = h.monitor.start().await.unwrap();
        assert_eq!(report.scheduled, 1);
        assert!(h.monitor.registry().sweep_running());

        let due = deadline::last_due(&job, Utc::now()).unwrap().unwrap();
        h.monitor.registry().arm(Arc::new(job.clone()), due);

        assert!(wait_for_alert(&h.db).await, "timer fire should produce an alert");

        wait_idle(&h.monitor).await;
        assert!(h.monitor.shutdown().await);
        assert!(h.monitor.registry().is_empty());
        assert!(!h.monitor.registry().sweep_running());
    }

    #[tokio::test]
    async fn test_unschedulable_jobs_reported_at_start() {
        let h = harness();
        let broken = MonitoredJob::new("broken", "not a cron", "x", 10);
        h.db.save_job(&broken).await.unwrap();

        let report = h.monitor.start().await.unwrap();
        assert_eq!(report.scheduled, 0);
        assert_eq!(report.unschedulable.len(), 1);
        assert_eq!(report.unschedulable[0].job_name, "broken");
        h.monitor.shutdown().await;
    }

    #[tokio::test]
    async fn test_monitor_restarts_after_shutdown() {
        let h = harness();
        let job = job();
        h.db.save_job(&job).await.unwrap();

        h.monitor.start().await.unwrap();
        assert!(h.monitor.shutdown().await);
        let report = h.monitor.start().await.unwrap();
        assert_eq!(report.scheduled, 1);

        let due = deadline::last_due(&job, Utc::now()).unwrap().unwrap();
        h.monitor.registry().arm(Arc::new(job.clone()), due);
        assert!(wait_for_alert(&h.db).await, "timer fire after a restart should produce an alert");

        wait_idle(&h.monitor).await;
        assert!(h.monitor.shutdown().await);
    }

    #[tokio::test]
    async fn test_edit_during_check_keeps_new_schedule() {
        let gate = Arc::new(Semaphore::new(0));
        let h = harness_with(FakeMailbox { gate: Some(gate.clone()), ..Default::default() });
        let job = job();
        h.monitor.upsert_job(job.clone()).await.unwrap();

        h.monitor.submit(due_fire(&job));
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert_eq!(h.mailbox.calls.load(Ordering::SeqCst), 1);

        let mut edited = job.clone();
        edited.schedule = "0 3 * * *".into();
        edited.tolerance_minutes = 60;
        let armed = h.monitor.upsert_job(edited).await.unwrap().unwrap();

        gate.add_permits(10);
        wait_idle(&h.monitor).await;
        assert_eq!(h.monitor.registry().pending(&job.id), Some(armed));
    }

    #[tokio::test]
    async fn test_shutdown_lets_dispatched_check_finish() {
        let gate = Arc::new(Semaphore::new(0));
        let h = harness_with(FakeMailbox { gate: Some(gate.clone()), ..Default::default() });
        let job = job();
        h.monitor.upsert_job(job.clone()).await.unwrap();

        h.monitor.submit(due_fire(&job));
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert_eq!(h.monitor.in_flight(), 1);

        let monitor = h.monitor.clone();
        let stopping = tokio::spawn(async move { monitor.shutdown().await });
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert!(!stopping.is_finished());
        assert!(h.monitor.registry().is_empty());

        gate.add_permits(10);
        assert!(stopping.await.unwrap());
        assert_eq!(h.monitor.in_flight(), 0);
        assert_eq!(h.db.active_alerts(10, 0).await.unwrap().len(), 1);
        // a check finishing during shutdown does not re-arm
        assert!(h.monitor.registry().is_empty());
    }

    #[tokio::test]
    async fn test_pass_ends_failure_streak() {
        let h = harness();
        let job = MonitoredJob::new("Hourly export", "0 * * * *", "Export finished", 10).with_pattern(
            MailPattern::new(PatternKind::Regex, TargetField::Body, r"/processed (\d+) items/", "count")
                .required(),
        );
        h.monitor.upsert_job(job.clone()).await.unwrap();

        let third = deadline::last_due(&job, Utc::now()).unwrap().unwrap();
        let second = deadline::last_due(&job, third.deadline - Duration::minutes(1)).unwrap().unwrap();
        let first = deadline::last_due(&job, second.deadline - Duration::minutes(1)).unwrap().unwrap();
        let fire = |armed| JobFire { job: Arc::new(job.clone()), armed, trigger: CheckTrigger::Timer };

        h.monitor.run_check(fire(first)).await.unwrap();
        h.mailbox.deliver(confirmation("processed 8 items", second.expected_run + Duration::minutes(1)));
        let report = h.monitor.run_check(fire(second)).await.unwrap();
        assert_eq!(report.outcome, CheckOutcome::Passed);
        let report = h.monitor.run_check(fire(third)).await.unwrap();
        assert!(matches!(report.outcome, CheckOutcome::Failed { reason: FailureKind::Missing, .. }));

        let severities: Vec<Severity> =
            h.db.active_alerts(10, 0).await.unwrap().into_iter().map(|a| a.severity).collect();
        assert_eq!(severities, vec![Severity::Warning, Severity::Warning]);
        assert_eq!(h.db.consecutive_failures(&job.id).await.unwrap(), 1);
    }
}
