//! # CronWatch
//!
//! Watches the mailbox for the confirmation emails remote cron jobs send,
//! and alerts when one is missing, late or incomplete.
//!
//! Usage:
//!   cronwatch                              # Run monitor + API (same as `serve`)
//!   cronwatch --config ./cronwatch.toml serve
//!   cronwatch next "0 2 * * 1-5" -n 10     # Preview fire times
//!   cronwatch check-config                 # Validate config and stored jobs

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cronwatch_core::config::CronWatchConfig;
use cronwatch_core::traits::JobStore;
use cronwatch_gateway::AppState;
use cronwatch_mail::ImapMailbox;
use cronwatch_scheduler::dispatch::notifiers_from_config;
use cronwatch_scheduler::{CronExpression, JobMonitor, MonitorSettings, NotifyRouter, SchedulerDb};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "cronwatch",
    version,
    about = "⏰ CronWatch — liveness monitor for cron jobs that report by email"
)]
struct Cli {
    /// Config file (default: ~/.cronwatch/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the monitor and the management API until Ctrl-C
    Serve,
    /// Print upcoming fire times of a cron expression (UTC)
    Next {
        expression: String,
        #[arg(short = 'n', long, default_value = "5")]
        count: usize,
    },
    /// Validate the config and every stored job's schedule
    CheckConfig,
}

fn load_config(path: Option<&str>) -> Result<CronWatchConfig> {
    match path {
        Some(p) => {
            let path = PathBuf::from(shellexpand::tilde(p).to_string());
            CronWatchConfig::load_from(&path).with_context(|| format!("loading {}", path.display()))
        }
        None => Ok(CronWatchConfig::load()?),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "cronwatch=debug,cronwatch_scheduler=debug,cronwatch_mail=debug,tower_http=debug"
    } else {
        "cronwatch=info,cronwatch_scheduler=info,cronwatch_mail=info,cronwatch_gateway=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(load_config(cli.config.as_deref())?).await,
        Command::Next { expression, count } => {
            let expr = CronExpression::parse(&expression)?;
            for run in expr.next_runs(chrono::Utc::now(), count.max(1))? {
                println!("{}", run.format("%Y-%m-%d %H:%M %a UTC"));
            }
            Ok(())
        }
        Command::CheckConfig => check_config(load_config(cli.config.as_deref())?).await,
    }
}

async fn serve(config: CronWatchConfig) -> Result<()> {
    for problem in config.validate() {
        tracing::warn!("⚠️ Config: {problem}");
    }

    let db_path = config.database.resolved_path();
    let db = Arc::new(SchedulerDb::open(&db_path).with_context(|| format!("opening {}", db_path.display()))?);
    tracing::info!("💾 Database: {}", db_path.display());

    let mailbox = Arc::new(ImapMailbox::new(config.mailbox.clone()));
    let router = Arc::new(NotifyRouter::new(notifiers_from_config(&config)?));
    tracing::info!("📣 Notification channels: {:?}", router.channel_names());

    let monitor = JobMonitor::new(db, mailbox, router, MonitorSettings::from(&config.monitor));
    let report = monitor.start().await?;
    for job in &report.unschedulable {
        tracing::warn!("⚠️ Not monitoring '{}': {}", job.job_name, job.error);
    }

    let state = Arc::new(AppState::new(config.gateway.clone(), config.monitor.clone(), monitor.clone()));
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("❌ Signal handler failed: {e}");
        }
        tracing::info!("🛑 Shutting down...");
    };
    let served = cronwatch_gateway::serve(state, shutdown).await;

    if !monitor.shutdown().await {
        tracing::warn!("⚠️ Some checks were still running at exit");
    }
    served
}

async fn check_config(config: CronWatchConfig) -> Result<()> {
    let mut problems = config.validate();

    let db_path = config.database.resolved_path();
    if db_path.exists() {
        let db = SchedulerDb::open(&db_path)?;
        for job in db.list_jobs().await? {
            if let Err(e) = CronExpression::parse(&job.schedule).and_then(|expr| expr.next_after(chrono::Utc::now())) {
                problems.push(format!("job '{}' ({}): schedule '{}': {e}", job.name, job.id, job.schedule));
            }
        }
    } else {
        println!("No database at {} yet; skipping job checks", db_path.display());
    }

    if problems.is_empty() {
        println!("✅ Config OK");
        Ok(())
    } else {
        for problem in &problems {
            println!("❌ {problem}");
        }
        anyhow::bail!("{} problem(s) found", problems.len())
    }
}
