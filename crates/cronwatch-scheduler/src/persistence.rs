//! SQLite-backed persistence for monitored jobs, executions, alerts and
//! notification history. Survives restarts, supports concurrent access.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use cronwatch_core::error::{CronWatchError, Result};
use cronwatch_core::traits::JobStore;
use cronwatch_core::types::{
    Alert, AlertStats, AlertStatus, ExecutionRecord, ExecutionStatus, MailPattern, MonitoredJob,
    NotificationRecord,
};
use rusqlite::{Connection, OptionalExtension, Row, params};

/// How many executions `consecutive_failures` looks back over.
const FAILURE_SCAN_LIMIT: usize = 100;

const JOB_COLUMNS: &str =
    "id, name, description, schedule, subject_pattern, tolerance_minutes, active, created_at, updated_at";
const ALERT_COLUMNS: &str =
    "id, job_id, job_name, deadline, detected_at, severity, message, status, notes, resolved_by, resolved_at";

/// SQLite-backed job store.
pub struct SchedulerDb {
    conn: Mutex<Connection>,
}

fn db_err(context: &'static str) -> impl Fn(rusqlite::Error) -> CronWatchError {
    move |e| CronWatchError::Persistence(format!("{context}: {e}"))
}

/// Timestamps are stored as fixed-width RFC 3339 so text comparison orders them.
fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Map a text column through `FromStr`, surfacing failures as row errors.
fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = CronWatchError>,
{
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e: CronWatchError| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

impl SchedulerDb {
    /// Open or create the database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err("DB open"))?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")
            .map_err(db_err("WAL"))?;
        Self::init(conn)
    }

    /// In-memory database, used by tests and `check-config`.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("DB open"))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(db_err("Foreign keys"))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| CronWatchError::Persistence(format!("Lock: {e}")))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            -- Jobs whose confirmation mail we watch for
            CREATE TABLE IF NOT EXISTS monitored_jobs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                schedule TEXT NOT NULL,              -- 5-field cron, UTC
                subject_pattern TEXT NOT NULL,       -- literal or /regex/
                tolerance_minutes INTEGER NOT NULL DEFAULT 10,
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Extraction patterns, ordered by position within a job
            CREATE TABLE IF NOT EXISTS mail_patterns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,                  -- 'regex', 'keyword', 'json_path'
                target_field TEXT NOT NULL,          -- 'subject', 'body', 'from', 'to', 'headers'
                value TEXT NOT NULL,
                extraction_name TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                required INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (job_id) REFERENCES monitored_jobs(id) ON DELETE CASCADE
            );

            -- One row per decided check cycle
            CREATE TABLE IF NOT EXISTS job_executions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                checked_at TEXT NOT NULL,
                status TEXT NOT NULL,                -- success, partial, late, missing, failure
                fields TEXT NOT NULL DEFAULT '{}',   -- JSON object
                duration_secs INTEGER,
                message_id TEXT,
                notes TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_executions_job ON job_executions(job_id, checked_at);

            CREATE TABLE IF NOT EXISTS alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                job_name TEXT NOT NULL,
                deadline TEXT NOT NULL,
                detected_at TEXT NOT NULL,
                severity TEXT NOT NULL,
                message TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'open', -- open, acknowledged, resolved
                notes TEXT,
                resolved_by TEXT,
                resolved_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_alerts_job_deadline ON alerts(job_id, deadline);

            CREATE TABLE IF NOT EXISTS notification_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                alert_id INTEGER NOT NULL,
                channel TEXT NOT NULL,
                sent_at TEXT NOT NULL,
                success INTEGER NOT NULL,
                error TEXT
            );
         ",
            )
            .map_err(db_err("Migration"))?;
        Ok(())
    }

    fn row_to_job(row: &Row<'_>) -> rusqlite::Result<MonitoredJob> {
        Ok(MonitoredJob {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            schedule: row.get(3)?,
            subject_pattern: row.get(4)?,
            tolerance_minutes: row.get(5)?,
            active: row.get::<_, i32>(6)? != 0,
            patterns: Vec::new(),
            created_at: parse_ts(&row.get::<_, String>(7)?),
            updated_at: parse_ts(&row.get::<_, String>(8)?),
        })
    }

    fn row_to_pattern(row: &Row<'_>) -> rusqlite::Result<MailPattern> {
        Ok(MailPattern {
            id: Some(row.get(0)?),
            name: row.get(1)?,
            kind: parse_col(row, 2)?,
            target: parse_col(row, 3)?,
            value: row.get(4)?,
            extraction_name: row.get(5)?,
            priority: row.get(6)?,
            required: row.get::<_, i32>(7)? != 0,
        })
    }

    fn row_to_alert(row: &Row<'_>) -> rusqlite::Result<Alert> {
        Ok(Alert {
            id: Some(row.get(0)?),
            job_id: row.get(1)?,
            job_name: row.get(2)?,
            deadline: parse_ts(&row.get::<_, String>(3)?),
            detected_at: parse_ts(&row.get::<_, String>(4)?),
            severity: parse_col(row, 5)?,
            message: row.get(6)?,
            status: parse_col(row, 7)?,
            notes: row.get(8)?,
            resolved_by: row.get(9)?,
            resolved_at: row.get::<_, Option<String>>(10)?.map(|s| parse_ts(&s)),
        })
    }

    fn row_to_execution(row: &Row<'_>) -> rusqlite::Result<ExecutionRecord> {
        let fields: String = row.get(4)?;
        Ok(ExecutionRecord {
            id: Some(row.get(0)?),
            job_id: row.get(1)?,
            checked_at: parse_ts(&row.get::<_, String>(2)?),
            status: parse_col(row, 3)?,
            fields: serde_json::from_str(&fields).unwrap_or_default(),
            duration_secs: row.get::<_, Option<i64>>(5)?.map(|d| d.max(0) as u64),
            message_id: row.get(6)?,
            notes: row.get(7)?,
        })
    }

    fn load_patterns(conn: &Connection, job_id: &str) -> Result<Vec<MailPattern>> {
        let mut stmt = conn
            .prepare(
                "SELECT id, name, kind, target_field, value, extraction_name, priority, required
                 FROM mail_patterns WHERE job_id = ?1 ORDER BY position",
            )
            .map_err(db_err("Load patterns"))?;
        let patterns = stmt
            .query_map([job_id], Self::row_to_pattern)
            .map_err(db_err("Load patterns"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Load patterns"))?;
        Ok(patterns)
    }

    fn load_jobs(&self, active_only: bool) -> Result<Vec<MonitoredJob>> {
        let conn = self.conn()?;
        let sql = if active_only {
            format!("SELECT {JOB_COLUMNS} FROM monitored_jobs WHERE active = 1 ORDER BY created_at")
        } else {
            format!("SELECT {JOB_COLUMNS} FROM monitored_jobs ORDER BY created_at")
        };
        let mut stmt = conn.prepare(&sql).map_err(db_err("Load jobs"))?;
        let mut jobs = stmt
            .query_map([], Self::row_to_job)
            .map_err(db_err("Load jobs"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Load jobs"))?;
        for job in &mut jobs {
            job.patterns = Self::load_patterns(&conn, &job.id)?;
        }
        Ok(jobs)
    }

    fn load_alert(conn: &Connection, id: i64) -> Result<Option<Alert>> {
        conn.query_row(
            &format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE id = ?1"),
            [id],
            Self::row_to_alert,
        )
        .optional()
        .map_err(db_err("Get alert"))
    }
}

#[async_trait]
impl JobStore for SchedulerDb {
    // ─── Jobs ──────────────────────────────────────

    async fn get_job(&self, id: &str) -> Result<Option<MonitoredJob>> {
        let conn = self.conn()?;
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM monitored_jobs WHERE id = ?1"),
                [id],
                Self::row_to_job,
            )
            .optional()
            .map_err(db_err("Get job"))?;
        match job {
            Some(mut job) => {
                job.patterns = Self::load_patterns(&conn, &job.id)?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn list_jobs(&self) -> Result<Vec<MonitoredJob>> {
        self.load_jobs(false)
    }

    async fn list_active_jobs(&self) -> Result<Vec<MonitoredJob>> {
        self.load_jobs(true)
    }

    async fn save_job(&self, job: &MonitoredJob) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(db_err("Save job"))?;
        tx.execute(
            "INSERT INTO monitored_jobs
             (id, name, description, schedule, subject_pattern, tolerance_minutes, active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name, description = excluded.description,
                schedule = excluded.schedule, subject_pattern = excluded.subject_pattern,
                tolerance_minutes = excluded.tolerance_minutes, active = excluded.active,
                updated_at = excluded.updated_at",
            params![
                job.id,
                job.name,
                job.description,
                job.schedule,
                job.subject_pattern,
                job.tolerance_minutes,
                job.active as i32,
                ts(job.created_at),
                ts(job.updated_at),
            ],
        )
        .map_err(db_err("Save job"))?;

        tx.execute("DELETE FROM mail_patterns WHERE job_id = ?1", [&job.id])
            .map_err(db_err("Save patterns"))?;
        for (position, pattern) in job.patterns.iter().enumerate() {
            tx.execute(
                "INSERT INTO mail_patterns
                 (job_id, position, name, kind, target_field, value, extraction_name, priority, required)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    job.id,
                    position as i64,
                    pattern.name,
                    pattern.kind.as_str(),
                    pattern.target.as_str(),
                    pattern.value,
                    pattern.extraction_name,
                    pattern.priority,
                    pattern.required as i32,
                ],
            )
            .map_err(db_err("Save patterns"))?;
        }
        tx.commit().map_err(db_err("Save job"))?;
        Ok(())
    }

    async fn delete_job(&self, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM mail_patterns WHERE job_id = ?1", [id])
            .map_err(db_err("Delete job"))?;
        let removed = conn
            .execute("DELETE FROM monitored_jobs WHERE id = ?1", [id])
            .map_err(db_err("Delete job"))?;
        Ok(removed > 0)
    }

    async fn set_job_active(&self, id: &str, active: bool) -> Result<Option<MonitoredJob>> {
        let changed = {
            let conn = self.conn()?;
            conn.execute(
                "UPDATE monitored_jobs SET active = ?1, updated_at = ?2 WHERE id = ?3",
                params![active as i32, ts(Utc::now()), id],
            )
            .map_err(db_err("Set active"))?
        };
        if changed == 0 {
            return Ok(None);
        }
        self.get_job(id).await
    }

    // ─── Executions ──────────────────────────────────────

    async fn record_execution(&self, record: &ExecutionRecord) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO job_executions (job_id, checked_at, status, fields, duration_secs, message_id, notes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.job_id,
                ts(record.checked_at),
                record.status.as_str(),
                serde_json::to_string(&record.fields)?,
                record.duration_secs.map(|d| d as i64),
                record.message_id,
                record.notes,
            ],
        )
        .map_err(db_err("Record execution"))?;
        Ok(conn.last_insert_rowid())
    }

    async fn recent_executions(&self, job_id: &str, limit: usize) -> Result<Vec<ExecutionRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, job_id, checked_at, status, fields, duration_secs, message_id, notes
                 FROM job_executions WHERE job_id = ?1 ORDER BY checked_at DESC, id DESC LIMIT ?2",
            )
            .map_err(db_err("Load executions"))?;
        let records = stmt
            .query_map(params![job_id, limit as i64], Self::row_to_execution)
            .map_err(db_err("Load executions"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Load executions"))?;
        Ok(records)
    }

    async fn consecutive_failures(&self, job_id: &str) -> Result<u32> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT status FROM job_executions WHERE job_id = ?1
                 ORDER BY checked_at DESC, id DESC LIMIT ?2",
            )
            .map_err(db_err("Failure count"))?;
        let statuses = stmt
            .query_map(params![job_id, FAILURE_SCAN_LIMIT as i64], |row| row.get::<_, String>(0))
            .map_err(db_err("Failure count"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Failure count"))?;
        let failures = statuses
            .iter()
            .take_while(|s| s.parse::<ExecutionStatus>().is_ok_and(|status| status.is_failure()))
            .count();
        Ok(failures as u32)
    }

    // ─── Alerts ──────────────────────────────────────

    async fn create_alert(&self, alert: &Alert) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO alerts (job_id, job_name, deadline, detected_at, severity, message, status, notes, resolved_by, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                alert.job_id,
                alert.job_name,
                ts(alert.deadline),
                ts(alert.detected_at),
                alert.severity.as_str(),
                alert.message,
                alert.status.as_str(),
                alert.notes,
                alert.resolved_by,
                alert.resolved_at.map(ts),
            ],
        )
        .map_err(db_err("Create alert"))?;
        Ok(conn.last_insert_rowid())
    }

    async fn get_alert(&self, id: i64) -> Result<Option<Alert>> {
        let conn = self.conn()?;
        Self::load_alert(&conn, id)
    }

    async fn find_unresolved_alert(&self, job_id: &str, deadline: DateTime<Utc>) -> Result<Option<Alert>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!(
                "SELECT {ALERT_COLUMNS} FROM alerts
                 WHERE job_id = ?1 AND deadline = ?2 AND status != 'resolved'
                 ORDER BY id DESC LIMIT 1"
            ),
            params![job_id, ts(deadline)],
            Self::row_to_alert,
        )
        .optional()
        .map_err(db_err("Find alert"))
    }

    async fn update_alert_status(
        &self,
        id: i64,
        status: AlertStatus,
        notes: Option<&str>,
        resolved_by: Option<&str>,
    ) -> Result<Option<Alert>> {
        let conn = self.conn()?;
        let resolved_at = (status == AlertStatus::Resolved).then(|| ts(Utc::now()));
        let changed = conn
            .execute(
                "UPDATE alerts SET status = ?1,
                    notes = COALESCE(?2, notes),
                    resolved_by = CASE WHEN ?1 = 'resolved' THEN COALESCE(?3, resolved_by) ELSE NULL END,
                    resolved_at = ?4
                 WHERE id = ?5",
                params![status.as_str(), notes, resolved_by, resolved_at, id],
            )
            .map_err(db_err("Update alert"))?;
        if changed == 0 {
            return Ok(None);
        }
        Self::load_alert(&conn, id)
    }

    async fn active_alerts(&self, limit: usize, offset: usize) -> Result<Vec<Alert>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ALERT_COLUMNS} FROM alerts WHERE status != 'resolved'
                 ORDER BY detected_at DESC, id DESC LIMIT ?1 OFFSET ?2"
            ))
            .map_err(db_err("Active alerts"))?;
        let alerts = stmt
            .query_map(params![limit as i64, offset as i64], Self::row_to_alert)
            .map_err(db_err("Active alerts"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Active alerts"))?;
        Ok(alerts)
    }

    async fn alert_stats(&self, days: u32) -> Result<AlertStats> {
        let since = ts(Utc::now() - Duration::days(i64::from(days)));
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {ALERT_COLUMNS} FROM alerts WHERE detected_at >= ?1"))
            .map_err(db_err("Alert stats"))?;
        let alerts = stmt
            .query_map([since], Self::row_to_alert)
            .map_err(db_err("Alert stats"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Alert stats"))?;

        let mut stats = AlertStats {
            total: alerts.len() as u64,
            by_severity: BTreeMap::new(),
            ..Default::default()
        };
        let mut resolution_secs = Vec::new();
        for alert in &alerts {
            match alert.status {
                AlertStatus::Open => stats.open += 1,
                AlertStatus::Acknowledged => stats.acknowledged += 1,
                AlertStatus::Resolved => stats.resolved += 1,
            }
            *stats.by_severity.entry(alert.severity.as_str().to_string()).or_insert(0) += 1;
            if let Some(resolved_at) = alert.resolved_at {
                resolution_secs.push((resolved_at - alert.detected_at).num_seconds() as f64);
            }
        }
        if !resolution_secs.is_empty() {
            stats.avg_resolution_secs =
                Some(resolution_secs.iter().sum::<f64>() / resolution_secs.len() as f64);
        }
        Ok(stats)
    }

    // ─── Notification history ──────────────────────────────────────

    async fn record_notification(&self, record: &NotificationRecord) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO notification_history (alert_id, channel, sent_at, success, error)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.alert_id,
                record.channel,
                ts(record.sent_at),
                record.success as i32,
                record.error,
            ],
        )
        .map_err(db_err("Record notification"))?;
        Ok(conn.last_insert_rowid())
    }

    async fn notification_history(&self, alert_id: i64) -> Result<Vec<NotificationRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT alert_id, channel, sent_at, success, error FROM notification_history
                 WHERE alert_id = ?1 ORDER BY sent_at, id",
            )
            .map_err(db_err("Notification history"))?;
        let records = stmt
            .query_map([alert_id], |row| {
                Ok(NotificationRecord {
                    alert_id: row.get(0)?,
                    channel: row.get(1)?,
                    sent_at: parse_ts(&row.get::<_, String>(2)?),
                    success: row.get::<_, i32>(3)? != 0,
                    error: row.get(4)?,
                })
            })
            .map_err(db_err("Notification history"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Notification history"))?;
        Ok(records)
    }
}
