//! tabage - age-bucket tab sorting
//!
//! Usage:
//!   tabage run --state DIR --snapshot host.json [--install] [--sort]  → one sorting session
//!   tabage classify --created 2024-06-01T09:00:00+02:00 [--state DIR]  → bucket for a creation time
//!   tabage dump-config                                                 → print the default config

use anyhow::Context;
use chrono::{DateTime, FixedOffset, Local, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tabage::session::{self, SessionOptions};
use tabage::snapshot;
use tabage_engine::{calendar_days_between, classify, EngineConfig};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "tabage",
    about = "Sort browser tabs into containers by how long ago they were opened",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to engine config file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Also write JSON logs to a daily rolling file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Activate the engine over a host snapshot, replay events, and save the result
    Run {
        /// Directory for persisted engine state
        #[arg(long)]
        state: PathBuf,
        /// Host snapshot (JSON), rewritten after the session
        #[arg(long)]
        snapshot: PathBuf,
        /// Activate as a first install
        #[arg(long, default_value_t = false)]
        install: bool,
        /// Run a sort pass before shutting down
        #[arg(long, default_value_t = false)]
        sort: bool,
        /// JSON array of host events to replay after activation
        #[arg(long)]
        events: Option<PathBuf>,
        /// Pretend the local time is this (RFC 3339)
        #[arg(long)]
        now: Option<String>,
    },
    /// Show which bucket a creation time falls in
    Classify {
        /// Creation time (RFC 3339)
        #[arg(long)]
        created: String,
        /// Evaluation time (RFC 3339, default: now)
        #[arg(long)]
        now: Option<String>,
        /// Use the buckets saved in this state directory instead of the config defaults
        #[arg(long)]
        state: Option<PathBuf>,
    },
    /// Print the effective config as TOML
    DumpConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_tracing(cli.log_dir.as_deref());

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path),
        None => EngineConfig::default(),
    };

    match cli.command {
        Commands::Run {
            state,
            snapshot: snapshot_path,
            install,
            sort,
            events,
            now,
        } => {
            let events = match events {
                Some(path) => snapshot::load_events(&path).await?,
                None => Vec::new(),
            };
            let now = now
                .as_deref()
                .map(parse_time)
                .transpose()?
                .map(|t| t.with_timezone(&Local));
            let summary = session::run(SessionOptions {
                state_dir: state,
                snapshot: snapshot_path,
                config,
                install,
                events,
                sort,
                now,
            })
            .await?;

            println!("{} entries tracked", summary.entries);
            for (title, members) in &summary.containers {
                let title = if title.is_empty() { "(untitled)" } else { title };
                println!("  {title:<16} {members}");
            }
            if let Some(delay) = summary.next_pass_in {
                println!("next pass in {}m", delay.as_secs() / 60);
            }
        }

        Commands::Classify {
            created,
            now,
            state,
        } => {
            let buckets = session::buckets(state.as_deref(), &config).await?;
            let created = parse_time(&created)?;
            let now = match now {
                Some(now) => parse_time(&now)?,
                None => {
                    let local = Local::now();
                    local.with_timezone(local.offset())
                }
            };
            let created = created.with_timezone(&Utc);
            let age = calendar_days_between(created, &now);
            match classify(created, &now, &buckets) {
                Some(bucket) => println!("{age} days → {}", bucket.name),
                None => println!("{age} days → (no bucket)"),
            }
        }

        Commands::DumpConfig => {
            print!("{}", config.to_toml());
        }
    }

    Ok(())
}

fn parse_time(s: &str) -> anyhow::Result<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(s).with_context(|| format!("invalid RFC 3339 time: {s}"))
}

fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "tabage.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tabage=info,tabage_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    guard
}
