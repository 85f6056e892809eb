//! API route handlers for the gateway.
//!
//! Every handler answers with a JSON envelope: `{"ok": true, ...}` on success,
//! `{"ok": false, "error": ..., "kind": ...}` with a matching status otherwise.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chrono::Utc;
use cronwatch_core::error::CronWatchError;
use cronwatch_core::types::{Alert, AlertStatus, ExecutionStatus, MailPattern, MonitoredJob, Severity};
use cronwatch_scheduler::CronExpression;
use serde::Deserialize;
use serde_json::{Value, json};

use super::server::AppState;

pub type ApiResponse = (StatusCode, Json<Value>);

const DEFAULT_LIMIT: usize = 20;
const MAX_LIMIT: usize = 500;
const MAX_PREVIEW: usize = 50;

fn reply(body: Value) -> ApiResponse {
    (StatusCode::OK, Json(body))
}

fn fail(err: CronWatchError) -> ApiResponse {
    let status = match &err {
        CronWatchError::NotFound(_) => StatusCode::NOT_FOUND,
        CronWatchError::InvalidSchedule(_)
        | CronWatchError::ExtractionPattern { .. }
        | CronWatchError::Config(_)
        | CronWatchError::Json(_) => StatusCode::BAD_REQUEST,
        CronWatchError::Busy(_) => StatusCode::CONFLICT,
        CronWatchError::MailboxUnavailable(_) | CronWatchError::Notifier(_) => StatusCode::BAD_GATEWAY,
        CronWatchError::Persistence(_) | CronWatchError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!("❌ API error: {err}");
    }
    (
        status,
        Json(json!({"ok": false, "error": err.to_string(), "kind": err.kind()})),
    )
}

fn bad_request(message: &str) -> ApiResponse {
    fail(CronWatchError::Config(message.to_string()))
}

fn not_found(what: String) -> ApiResponse {
    fail(CronWatchError::NotFound(what))
}

/// Job fields accepted on create and update.
#[derive(Debug, Deserialize)]
pub struct JobRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub schedule: String,
    pub subject_pattern: String,
    pub tolerance_minutes: Option<u32>,
    pub active: Option<bool>,
    #[serde(default)]
    pub patterns: Vec<MailPattern>,
}

impl JobRequest {
    fn parse(body: Value) -> Result<Self, ApiResponse> {
        let req: Self = serde_json::from_value(body).map_err(|e| fail(e.into()))?;
        if req.name.trim().is_empty() {
            return Err(bad_request("'name' is required"));
        }
        if req.subject_pattern.trim().is_empty() {
            return Err(bad_request("'subject_pattern' is required"));
        }
        Ok(req)
    }

    /// Overwrite `job` with the request; omitted optional fields are kept.
    fn apply(self, job: &mut MonitoredJob) {
        job.name = self.name;
        job.description = self.description;
        job.schedule = self.schedule;
        job.subject_pattern = self.subject_pattern;
        job.patterns = self.patterns;
        if let Some(tolerance) = self.tolerance_minutes {
            job.tolerance_minutes = tolerance;
        }
        if let Some(active) = self.active {
            job.active = active;
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl PageQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct NextQuery {
    pub expression: Option<String>,
    pub count: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StatsQuery {
    pub days: Option<u32>,
}

fn job_json(state: &AppState, job: &MonitoredJob) -> Value {
    json!({
        "job": job,
        "armed": state.monitor.registry().pending(&job.id),
    })
}

// ─── Health & info ──────────────────────────────────────

/// Health check endpoint.
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "cronwatch",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// System information endpoint.
pub async fn system_info(State(state): State<Arc<AppState>>) -> Json<Value> {
    let monitor = &state.monitor;
    let registry = monitor.registry();
    Json(json!({
        "name": "cronwatch",
        "version": env!("CARGO_PKG_VERSION"),
        "platform": format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "mailbox": monitor.mailbox_name(),
        "channels": monitor.router().channel_names(),
        "timers": registry.len(),
        "upcoming": registry.snapshot().into_iter().take(10).collect::<Vec<_>>(),
        "sweep_running": registry.sweep_running(),
        "checks_in_flight": monitor.in_flight(),
        "unschedulable": monitor.unschedulable(),
        "recent_notifications": monitor.router().history().len(),
        "gateway": {
            "host": state.gateway_config.host,
            "port": state.gateway_config.port,
        }
    }))
}

// ─── Jobs ──────────────────────────────────────

/// List every job with its armed cycle.
pub async fn list_jobs(State(state): State<Arc<AppState>>) -> ApiResponse {
    match state.store.list_jobs().await {
        Ok(jobs) => {
            let items: Vec<Value> = jobs.iter().map(|j| job_json(&state, j)).collect();
            reply(json!({"ok": true, "jobs": items, "count": items.len()}))
        }
        Err(e) => fail(e),
    }
}

pub async fn get_job(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResponse {
    match state.store.get_job(&id).await {
        Ok(Some(job)) => {
            let mut body = job_json(&state, &job);
            body["ok"] = json!(true);
            reply(body)
        }
        Ok(None) => not_found(format!("job {id}")),
        Err(e) => fail(e),
    }
}

/// Create a job. Tolerance defaults to `[monitor] default_tolerance_minutes`.
pub async fn create_job(State(state): State<Arc<AppState>>, Json(body): Json<Value>) -> ApiResponse {
    let req = match JobRequest::parse(body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let mut job = MonitoredJob::new(
        &req.name,
        &req.schedule,
        &req.subject_pattern,
        state.monitor_config.default_tolerance_minutes,
    );
    req.apply(&mut job);

    match state.monitor.upsert_job(job.clone()).await {
        Ok(armed) => (
            StatusCode::CREATED,
            Json(json!({"ok": true, "job": job, "armed": armed})),
        ),
        Err(e) => fail(e),
    }
}

pub async fn update_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResponse {
    let req = match JobRequest::parse(body) {
        Ok(req) => req,
        Err(resp) => return resp,
    };
    let mut job = match state.store.get_job(&id).await {
        Ok(Some(job)) => job,
        Ok(None) => return not_found(format!("job {id}")),
        Err(e) => return fail(e),
    };
    req.apply(&mut job);

    match state.monitor.upsert_job(job.clone()).await {
        Ok(armed) => reply(json!({"ok": true, "job": job, "armed": armed})),
        Err(e) => fail(e),
    }
}

pub async fn delete_job(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResponse {
    match state.monitor.remove_job(&id).await {
        Ok(true) => reply(json!({"ok": true, "deleted": id})),
        Ok(false) => not_found(format!("job {id}")),
        Err(e) => fail(e),
    }
}

/// `{ "active": bool }`
pub async fn set_job_active(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResponse {
    let Some(active) = body["active"].as_bool() else {
        return bad_request("'active' must be a boolean");
    };
    match state.monitor.set_active(&id, active).await {
        Ok(Some(job)) => {
            let mut body = job_json(&state, &job);
            body["ok"] = json!(true);
            reply(body)
        }
        Ok(None) => not_found(format!("job {id}")),
        Err(e) => fail(e),
    }
}

/// Run a check for the job's most recent cycle and return the report.
pub async fn check_job(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResponse {
    match state.monitor.check_now(&id).await {
        Ok(report) => reply(json!({"ok": true, "report": report})),
        Err(e) => fail(e),
    }
}

pub async fn job_executions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(page): Query<PageQuery>,
) -> ApiResponse {
    match state.store.get_job(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found(format!("job {id}")),
        Err(e) => return fail(e),
    }
    match state.store.recent_executions(&id, page.limit()).await {
        Ok(mut executions) => {
            // passes stay stored for the failure streak; the setting only hides them
            if !state.monitor_config.record_success {
                executions.retain(|e| e.status != ExecutionStatus::Success);
            }
            reply(json!({"ok": true, "executions": executions, "count": executions.len()}))
        }
        Err(e) => fail(e),
    }
}

/// Preview upcoming fire times of an expression.
pub async fn schedule_next(Query(query): Query<NextQuery>) -> ApiResponse {
    let Some(expression) = query.expression.filter(|e| !e.trim().is_empty()) else {
        return bad_request("'expression' is required");
    };
    let count = query.count.unwrap_or(5).clamp(1, MAX_PREVIEW);

    let runs = CronExpression::parse(&expression).and_then(|expr| expr.next_runs(Utc::now(), count));
    match runs {
        Ok(runs) => reply(json!({"ok": true, "expression": expression, "runs": runs})),
        Err(e) => fail(CronWatchError::InvalidSchedule(format!("'{expression}': {e}"))),
    }
}

// ─── Alerts ──────────────────────────────────────

/// Open and acknowledged alerts, newest first.
pub async fn list_alerts(State(state): State<Arc<AppState>>, Query(page): Query<PageQuery>) -> ApiResponse {
    match state.store.active_alerts(page.limit(), page.offset.unwrap_or(0)).await {
        Ok(alerts) => reply(json!({"ok": true, "alerts": alerts, "count": alerts.len()})),
        Err(e) => fail(e),
    }
}

pub async fn alert_stats(State(state): State<Arc<AppState>>, Query(query): Query<StatsQuery>) -> ApiResponse {
    let days = query.days.unwrap_or(7).max(1);
    match state.store.alert_stats(days).await {
        Ok(stats) => reply(json!({"ok": true, "days": days, "stats": stats})),
        Err(e) => fail(e),
    }
}

/// `{ "status": "acknowledged" | "resolved" | "open", "notes"?, "resolved_by"? }`
pub async fn update_alert_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<Value>,
) -> ApiResponse {
    let status = match body["status"].as_str().map(str::parse::<AlertStatus>) {
        Some(Ok(status)) => status,
        Some(Err(e)) => return fail(e),
        None => return bad_request("'status' is required"),
    };
    let notes = body["notes"].as_str();
    let resolved_by = body["resolved_by"].as_str();

    match state.store.update_alert_status(id, status, notes, resolved_by).await {
        Ok(Some(alert)) => {
            tracing::info!("📝 Alert {id} marked {}", status.as_str());
            reply(json!({"ok": true, "alert": alert}))
        }
        Ok(None) => not_found(format!("alert {id}")),
        Err(e) => fail(e),
    }
}

pub async fn alert_notifications(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResponse {
    match state.store.get_alert(id).await {
        Ok(Some(_)) => {}
        Ok(None) => return not_found(format!("alert {id}")),
        Err(e) => return fail(e),
    }
    match state.store.notification_history(id).await {
        Ok(history) => reply(json!({"ok": true, "notifications": history})),
        Err(e) => fail(e),
    }
}

/// Send an ad-hoc alert through every channel. Not persisted.
/// `{ "message", "job_name"?, "job_id"?, "severity"? }`
pub async fn send_alert(State(state): State<Arc<AppState>>, Json(body): Json<Value>) -> ApiResponse {
    let Some(message) = body["message"].as_str().filter(|m| !m.trim().is_empty()) else {
        return bad_request("'message' is required");
    };
    let severity = match body["severity"].as_str().map(str::parse::<Severity>) {
        Some(Ok(severity)) => severity,
        Some(Err(e)) => return fail(e),
        None => Severity::Warning,
    };
    let router = state.monitor.router();
    if router.channel_names().is_empty() {
        return bad_request("no notification channels configured");
    }

    let now = Utc::now();
    let alert = Alert {
        id: None,
        job_id: body["job_id"].as_str().unwrap_or("manual").to_string(),
        job_name: body["job_name"].as_str().unwrap_or("manual").to_string(),
        deadline: now,
        detected_at: now,
        severity,
        message: message.to_string(),
        status: AlertStatus::Open,
        notes: None,
        resolved_by: None,
        resolved_at: None,
    };
    let outcomes = router.dispatch(&alert).await;
    let delivered = outcomes.iter().filter(|o| o.success).count();
    reply(json!({
        "ok": delivered > 0,
        "delivered": delivered,
        "outcomes": outcomes,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cronwatch_core::config::{GatewayConfig, MonitorConfig};
    use cronwatch_core::error::Result;
    use cronwatch_core::traits::{Mailbox, Notifier};
    use cronwatch_core::types::{CandidateMessage, ExecutionRecord};
    use cronwatch_scheduler::{JobMonitor, MonitorSettings, NotifyRouter, SchedulerDb};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EmptyMailbox;

    #[async_trait]
    impl Mailbox for EmptyMailbox {
        async fn find_messages(&self, _subject: &str, _since: chrono::DateTime<Utc>) -> Result<Vec<CandidateMessage>> {
            Ok(Vec::new())
        }

        fn name(&self) -> &str {
            "empty"
        }
    }

    struct CountingNotifier(Arc<AtomicUsize>);

    #[async_trait]
    impl Notifier for CountingNotifier {
        async fn notify(&self, _alert: &Alert) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn channel_name(&self) -> &str {
            "counting"
        }
    }

    fn test_state_with(router: NotifyRouter) -> State<Arc<AppState>> {
        test_state_configured(router, MonitorConfig::default())
    }

    fn test_state_configured(router: NotifyRouter, monitor_config: MonitorConfig) -> State<Arc<AppState>> {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let monitor = JobMonitor::new(db, Arc::new(EmptyMailbox), Arc::new(router), MonitorSettings::default());
        State(Arc::new(AppState::new(GatewayConfig::default(), monitor_config, monitor)))
    }

    fn test_state() -> State<Arc<AppState>> {
        test_state_with(NotifyRouter::empty())
    }

    fn job_body() -> Value {
        json!({
            "name": "db_backup",
            "schedule": "0 2 * * *",
            "subject_pattern": "Backup complete",
            "patterns": [{
                "name": "size",
                "kind": "regex",
                "target": "body",
                "value": "/size: (\\d+)/",
                "extraction_name": "size",
                "required": true
            }]
        })
    }

    async fn create(state: &State<Arc<AppState>>) -> String {
        let (status, Json(json)) = create_job(state.clone(), Json(job_body())).await;
        assert_eq!(status, StatusCode::CREATED);
        json["job"]["id"].as_str().unwrap().to_string()
    }

    // ---- Health & Info ----

    #[tokio::test]
    async fn test_health_check() {
        let json = health_check().await.0;
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_system_info() {
        let state = test_state();
        create(&state).await;
        let json = system_info(state).await.0;
        assert_eq!(json["name"], "cronwatch");
        assert_eq!(json["mailbox"], "empty");
        assert_eq!(json["timers"], 1);
        assert!(json["uptime_secs"].is_number());
    }

    // ---- Jobs ----

    #[tokio::test]
    async fn test_create_job_applies_defaults_and_arms() {
        let state = test_state();
        let (status, Json(json)) = create_job(state.clone(), Json(job_body())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(json["ok"].as_bool().unwrap());
        assert_eq!(json["job"]["tolerance_minutes"], 10);
        assert_eq!(json["job"]["patterns"][0]["priority"], 0);
        assert!(json["armed"]["deadline"].is_string());

        let (status, Json(json)) = list_jobs(state).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["count"], 1);
        assert!(json["jobs"][0]["armed"].is_object());
    }

    #[tokio::test]
    async fn test_create_job_rejects_bad_input() {
        let state = test_state();
        let mut body = job_body();
        body["schedule"] = json!("0 25 * * *");
        let (status, Json(json)) = create_job(state.clone(), Json(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["kind"], "invalid_schedule");

        let (status, Json(json)) = create_job(state.clone(), Json(json!({"name": "x"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["ok"], false);

        let mut body = job_body();
        body["name"] = json!("  ");
        let (status, _) = create_job(state, Json(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_update_and_delete_job() {
        let state = test_state();
        let id = create(&state).await;

        let mut body = job_body();
        body["schedule"] = json!("30 3 * * *");
        body["tolerance_minutes"] = json!(45);
        let (status, Json(json)) = update_job(state.clone(), Path(id.clone()), Json(body.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["job"]["schedule"], "30 3 * * *");
        assert_eq!(json["job"]["tolerance_minutes"], 45);

        let (status, _) = update_job(state.clone(), Path("missing".into()), Json(body)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = delete_job(state.clone(), Path(id.clone())).await;
        assert_eq!(status, StatusCode::OK);
        let (status, Json(json)) = get_job(state.clone(), Path(id.clone())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["kind"], "not_found");
        let (status, _) = delete_job(state, Path(id)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_set_job_active() {
        let state = test_state();
        let id = create(&state).await;

        let (status, Json(json)) = set_job_active(state.clone(), Path(id.clone()), Json(json!({"active": false}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["job"]["active"], false);
        assert!(json["armed"].is_null());

        let (status, Json(json)) = set_job_active(state.clone(), Path(id.clone()), Json(json!({"active": true}))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["armed"].is_object());

        let (status, _) = set_job_active(state, Path(id), Json(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_check_job_and_executions() {
        let state = test_state();
        let mut body = job_body();
        body["schedule"] = json!("* * * * *");
        body["tolerance_minutes"] = json!(0);
        let (_, Json(json)) = create_job(state.clone(), Json(body)).await;
        let id = json["job"]["id"].as_str().unwrap().to_string();

        let (status, Json(json)) = check_job(state.clone(), Path(id.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["report"]["trigger"], "manual");
        assert_eq!(json["report"]["outcome"]["outcome"], "failed");
        assert_eq!(json["report"]["outcome"]["reason"], "missing");

        let (status, Json(json)) = job_executions(state.clone(), Path(id), Query(PageQuery::default())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["count"], 1);
        assert_eq!(json["executions"][0]["status"], "missing");

        let (status, _) = check_job(state, Path("missing".into())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_executions_hide_passes_when_not_recording_success() {
        let config = MonitorConfig { record_success: false, ..MonitorConfig::default() };
        let state = test_state_configured(NotifyRouter::empty(), config);
        let id = create(&state).await;
        for (minutes, status) in [(0, ExecutionStatus::Missing), (5, ExecutionStatus::Success)] {
            let record = ExecutionRecord {
                id: None,
                job_id: id.clone(),
                checked_at: Utc::now() + chrono::Duration::minutes(minutes),
                status,
                fields: Default::default(),
                duration_secs: None,
                message_id: None,
                notes: None,
            };
            state.store.record_execution(&record).await.unwrap();
        }

        let (status, Json(json)) = job_executions(state.clone(), Path(id.clone()), Query(PageQuery::default())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["count"], 1);
        assert_eq!(json["executions"][0]["status"], "missing");
        // the pass is still stored and ends the failure streak
        assert_eq!(state.store.consecutive_failures(&id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_schedule_next() {
        let query = NextQuery { expression: Some("0 */6 * * *".into()), count: Some(3) };
        let (status, Json(json)) = schedule_next(Query(query)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["runs"].as_array().unwrap().len(), 3);

        let query = NextQuery { expression: Some("0 0 31 2 *".into()), count: None };
        let (status, Json(json)) = schedule_next(Query(query)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["kind"], "invalid_schedule");

        let (status, _) = schedule_next(Query(NextQuery::default())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    // ---- Alerts ----

    #[tokio::test]
    async fn test_alert_lifecycle_over_api() {
        let state = test_state();
        let job = MonitoredJob::new("etl", "0 * * * *", "ETL", 10);
        state.store.save_job(&job).await.unwrap();
        let alert = Alert::open(&job, Utc::now(), Severity::Error, "missing".into());
        let alert_id = state.store.create_alert(&alert).await.unwrap();

        let (_, Json(json)) = list_alerts(state.clone(), Query(PageQuery::default())).await;
        assert_eq!(json["count"], 1);

        let (status, Json(json)) = update_alert_status(
            state.clone(),
            Path(alert_id),
            Json(json!({"status": "resolved", "notes": "rerun by hand", "resolved_by": "ops"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["alert"]["status"], "resolved");
        assert_eq!(json["alert"]["resolved_by"], "ops");

        let (_, Json(json)) = list_alerts(state.clone(), Query(PageQuery::default())).await;
        assert_eq!(json["count"], 0);

        let (_, Json(json)) = alert_stats(state.clone(), Query(StatsQuery::default())).await;
        assert_eq!(json["stats"]["resolved"], 1);

        let (status, _) = update_alert_status(state.clone(), Path(alert_id), Json(json!({"status": "closed"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = update_alert_status(state.clone(), Path(999), Json(json!({"status": "open"}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, Json(json)) = alert_notifications(state.clone(), Path(alert_id)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json["notifications"].as_array().unwrap().is_empty());
        let (status, _) = alert_notifications(state, Path(999)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_send_alert() {
        let calls = Arc::new(AtomicUsize::new(0));
        let state = test_state_with(NotifyRouter::new(vec![Box::new(CountingNotifier(calls.clone()))]));

        let (status, Json(json)) =
            send_alert(state.clone(), Json(json!({"message": "disk full", "severity": "critical"}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["delivered"], 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let (status, _) = send_alert(state.clone(), Json(json!({"message": "x", "severity": "loud"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = send_alert(state, Json(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send_alert(test_state(), Json(json!({"message": "x"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    // ---- Router ----

    #[tokio::test]
    async fn test_router_dispatch() {
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let State(state) = test_state();
        let app = crate::server::build_router_from_arc(state);

        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = app
            .oneshot(Request::builder().uri("/api/v1/jobs/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["kind"], "not_found");
    }
}
