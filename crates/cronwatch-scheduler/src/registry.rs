//! Timer registry — at most one pending deadline timer per job.
//!
//! A timer sleeps until its deadline, then removes itself from the registry
//! and hands a [`JobFire`] to the monitor over a channel. The check itself
//! never runs on the timer task, so cancelling a timer cannot interrupt a
//! check in progress.
//!
//! Replacing or cancelling a timer aborts its task; a generation number
//! guards the window where an aborted task has already woken up.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cronwatch_core::types::MonitoredJob;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cron::CronError;
use crate::deadline::{self, ArmedCheck};

/// What started a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckTrigger {
    Timer,
    Sweep,
    Manual,
}

/// A due check, handed from the registry (or sweep, or API) to the monitor.
#[derive(Debug, Clone)]
pub struct JobFire {
    /// Job snapshot taken when the timer was armed.
    pub job: Arc<MonitoredJob>,
    pub armed: ArmedCheck,
    pub trigger: CheckTrigger,
}

/// Pending timer as reported to callers.
#[derive(Debug, Clone, Serialize)]
pub struct TimerInfo {
    pub job_id: String,
    pub job_name: String,
    pub expected_run: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

struct ScheduledTimer {
    job: Arc<MonitoredJob>,
    armed: ArmedCheck,
    generation: u64,
    handle: JoinHandle<()>,
}

struct RegistryInner {
    timers: Mutex<HashMap<String, ScheduledTimer>>,
    sweep: Mutex<Option<JoinHandle<()>>>,
    next_generation: AtomicU64,
    fires: mpsc::UnboundedSender<JobFire>,
}

impl RegistryInner {
    fn timers(&self) -> MutexGuard<'_, HashMap<String, ScheduledTimer>> {
        // A poisoned map still holds consistent entries; keep using it.
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sweep(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.sweep.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fire(&self, job_id: &str, generation: u64) {
        let mut timers = self.timers();
        if timers.get(job_id).map(|t| t.generation) != Some(generation) {
            tracing::debug!("⏰ Stale timer for {job_id} ignored");
            return;
        }
        let Some(timer) = timers.remove(job_id) else {
            return;
        };
        drop(timers);

        tracing::debug!("⏰ Deadline reached for '{}'", timer.job.name);
        let fire = JobFire {
            job: timer.job,
            armed: timer.armed,
            trigger: CheckTrigger::Timer,
        };
        if self.fires.send(fire).is_err() {
            tracing::warn!("⚠️ Monitor gone; dropping fire for {job_id}");
        }
    }
}

/// Handle to the registry. Cheap to clone.
#[derive(Clone)]
pub struct TimerRegistry {
    inner: Arc<RegistryInner>,
}

impl TimerRegistry {
    /// Create a registry and the receiving end of its fire channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<JobFire>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Self {
            inner: Arc::new(RegistryInner {
                timers: Mutex::new(HashMap::new()),
                sweep: Mutex::new(None),
                next_generation: AtomicU64::new(1),
                fires: tx,
            }),
        };
        (registry, rx)
    }

    /// Arm (or re-arm) the job's timer for its next deadline after now.
    pub fn schedule(&self, job: Arc<MonitoredJob>) -> Result<ArmedCheck, CronError> {
        let armed = deadline::deadline(&job, Utc::now())?;
        self.arm(job, armed);
        Ok(armed)
    }

    /// Arm the job's timer for an explicit cycle, replacing any pending one.
    pub fn arm(&self, job: Arc<MonitoredJob>, armed: ArmedCheck) {
        let job_id = job.id.clone();
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        // Held across spawn so an immediately-due timer waits for its entry.
        let mut timers = self.inner.timers();
        let handle = tokio::spawn(run_timer(
            Arc::downgrade(&self.inner),
            job_id.clone(),
            generation,
            armed.deadline,
        ));

        let previous = timers.insert(
            job_id,
            ScheduledTimer {
                job,
                armed,
                generation,
                handle,
            },
        );
        drop(timers);
        if let Some(previous) = previous {
            previous.handle.abort();
        }
    }

    /// Cancel the job's pending timer. Returns whether one existed.
    pub fn unschedule(&self, job_id: &str) -> bool {
        match self.inner.timers().remove(job_id) {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Start the periodic sweep, replacing a running one.
    pub fn start_sweep<F, Fut>(&self, interval: Duration, sweep_fn: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                sweep_fn().await;
            }
        });
        if let Some(previous) = self.inner.sweep().replace(handle) {
            previous.abort();
        }
        tracing::info!("🔄 Sweep every {}s", interval.as_secs());
    }

    pub fn stop_sweep(&self) {
        if let Some(handle) = self.inner.sweep().take() {
            handle.abort();
        }
    }

    pub fn sweep_running(&self) -> bool {
        self.inner.sweep().is_some()
    }

    /// Cancel every timer and the sweep.
    pub fn stop_all(&self) {
        let drained: Vec<ScheduledTimer> = self.inner.timers().drain().map(|(_, t)| t).collect();
        for timer in &drained {
            timer.handle.abort();
        }
        self.stop_sweep();
        tracing::info!("⏹️ Cancelled {} timer(s)", drained.len());
    }

    /// The cycle the job's pending timer is armed for.
    pub fn pending(&self, job_id: &str) -> Option<ArmedCheck> {
        self.inner.timers().get(job_id).map(|t| t.armed)
    }

    pub fn len(&self) -> usize {
        self.inner.timers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pending timers, soonest deadline first.
    pub fn snapshot(&self) -> Vec<TimerInfo> {
        let mut timers: Vec<TimerInfo> = self
            .inner
            .timers()
            .iter()
            .map(|(id, t)| TimerInfo {
                job_id: id.clone(),
                job_name: t.job.name.clone(),
                expected_run: t.armed.expected_run,
                deadline: t.armed.deadline,
            })
            .collect();
        timers.sort_by_key(|t| t.deadline);
        timers
    }
}

async fn run_timer(inner: Weak<RegistryInner>, job_id: String, generation: u64, fire_at: DateTime<Utc>) {
    let delay = (fire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    tokio::time::sleep(delay).await;
    if let Some(inner) = inner.upgrade() {
        inner.fire(&job_id, generation);
    }
}
