//! HTTP server implementation using Axum.

use std::future::Future;
use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post, put},
};
use cronwatch_core::config::{GatewayConfig, MonitorConfig};
use cronwatch_core::traits::JobStore;
use cronwatch_scheduler::JobMonitor;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state for the gateway server.
pub struct AppState {
    pub gateway_config: GatewayConfig,
    /// Defaults applied to jobs created through the API.
    pub monitor_config: MonitorConfig,
    pub start_time: std::time::Instant,
    pub monitor: Arc<JobMonitor>,
    pub store: Arc<dyn JobStore>,
}

impl AppState {
    pub fn new(
        gateway_config: GatewayConfig,
        monitor_config: MonitorConfig,
        monitor: Arc<JobMonitor>,
    ) -> Self {
        Self {
            gateway_config,
            monitor_config,
            start_time: std::time::Instant::now(),
            store: monitor.store().clone(),
            monitor,
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    build_router_from_arc(Arc::new(state))
}

pub fn build_router_from_arc(shared: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(super::routes::health_check))
        .route("/api/v1/info", get(super::routes::system_info))
        // Jobs
        .route(
            "/api/v1/jobs",
            get(super::routes::list_jobs).post(super::routes::create_job),
        )
        .route(
            "/api/v1/jobs/{id}",
            get(super::routes::get_job)
                .put(super::routes::update_job)
                .delete(super::routes::delete_job),
        )
        .route("/api/v1/jobs/{id}/active", post(super::routes::set_job_active))
        .route("/api/v1/jobs/{id}/check", post(super::routes::check_job))
        .route("/api/v1/jobs/{id}/executions", get(super::routes::job_executions))
        .route("/api/v1/schedule/next", get(super::routes::schedule_next))
        // Alerts
        .route(
            "/api/v1/alerts",
            get(super::routes::list_alerts).post(super::routes::send_alert),
        )
        .route("/api/v1/alerts/stats", get(super::routes::alert_stats))
        .route("/api/v1/alerts/{id}/status", put(super::routes::update_alert_status))
        .route(
            "/api/v1/alerts/{id}/notifications",
            get(super::routes::alert_notifications),
        )
        .layer({
            let cors = CorsLayer::new()
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::PUT,
                    axum::http::Method::DELETE,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers(Any)
                .max_age(std::time::Duration::from_secs(3600));

            // e.g. CRONWATCH_CORS_ORIGINS=https://ops.example.com,https://admin.example.com
            if let Ok(origins_str) = std::env::var("CRONWATCH_CORS_ORIGINS") {
                let origins: Vec<_> = origins_str
                    .split(',')
                    .filter_map(|s| s.trim().parse::<axum::http::HeaderValue>().ok())
                    .collect();
                cors.allow_origin(origins)
            } else {
                cors.allow_origin(Any)
            }
        })
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Serve the API until `shutdown` resolves.
pub async fn serve<F>(state: Arc<AppState>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", state.gateway_config.host, state.gateway_config.port);
    let app = build_router_from_arc(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🌐 API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
