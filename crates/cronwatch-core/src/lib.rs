//! # CronWatch Core
//!
//! Shared building blocks for the CronWatch workspace:
//! - the monitored-job / evidence / alert data model
//! - the error taxonomy every crate reports through
//! - TOML configuration with defaults for every field
//! - collaborator traits (`Mailbox`, `JobStore`, `Notifier`) the monitor talks to

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::CronWatchConfig;
pub use error::{CronWatchError, Result};
pub use traits::{JobStore, Mailbox, Notifier};
