//! # CronWatch Gateway
//!
//! Axum-based management API: job CRUD, manual checks, schedule preview,
//! alert listing and status updates.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, serve};
