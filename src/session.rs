//! One sorting session: activate the engine over a snapshot, feed it events,
//! flush, and write the host state back.

use crate::snapshot;
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tabage_core::{BucketDefinition, Clock, HostEvent, Request, SystemClock};
use tabage_engine::{
    EngineConfig, FileStore, IdentityStore, ManualClock, MemoryHost, Orchestrator, Settings,
};
use tokio::sync::mpsc;
use tracing::info;

pub struct SessionOptions {
    /// Directory holding the engine's persisted state.
    pub state_dir: PathBuf,
    pub snapshot: PathBuf,
    pub config: EngineConfig,
    /// Activate as a first install instead of a restart.
    pub install: bool,
    /// Events replayed after activation.
    pub events: Vec<HostEvent>,
    /// Run a sort pass before shutting down.
    pub sort: bool,
    /// Fixed clock; the system clock when absent.
    pub now: Option<DateTime<Local>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub entries: usize,
    /// (title, member count) per container, in container order.
    pub containers: Vec<(String, usize)>,
    pub next_pass_in: Option<Duration>,
}

/// Bucket definitions saved under `state_dir`, or the config defaults.
pub async fn buckets(
    state_dir: Option<&Path>,
    config: &EngineConfig,
) -> anyhow::Result<Vec<BucketDefinition>> {
    match state_dir {
        Some(dir) => {
            let settings = Settings::load(&FileStore::in_dir(dir), config).await?;
            Ok(settings.buckets)
        }
        None => Ok(config.buckets.clone()),
    }
}

pub async fn run(opts: SessionOptions) -> anyhow::Result<SessionSummary> {
    let host = Arc::new(MemoryHost::from_snapshot(snapshot::load(&opts.snapshot).await?));
    let storage = Arc::new(FileStore::in_dir(&opts.state_dir));
    let clock: Arc<dyn Clock> = match opts.now {
        Some(now) => Arc::new(ManualClock::new(now)),
        None => Arc::new(SystemClock),
    };
    let alarm_name = opts.config.schedule.alarm_name.clone();
    let store = IdentityStore::new(storage.clone(), opts.config.debounce());
    let mut orchestrator = Orchestrator::new(host.host(storage, clock), store, opts.config);

    let mut events = Vec::with_capacity(opts.events.len() + 3);
    events.push(if opts.install {
        HostEvent::Installed
    } else {
        HostEvent::Started
    });
    events.extend(opts.events);
    if opts.sort {
        events.push(HostEvent::Message {
            request: Request::SortNow,
        });
    }
    events.push(HostEvent::Suspending);

    let (tx, rx) = mpsc::channel(events.len());
    for event in events {
        tx.send(event).await?;
    }
    drop(tx);
    orchestrator.run(rx).await;

    snapshot::save(&opts.snapshot, &host.snapshot()).await?;
    info!(snapshot = %opts.snapshot.display(), "Snapshot written");

    let containers = host
        .containers()
        .into_iter()
        .map(|c| {
            let members = host.members_of(c.id).len();
            (c.title.unwrap_or_default(), members)
        })
        .collect();
    Ok(SessionSummary {
        entries: orchestrator.store().len(),
        containers,
        next_pass_in: host.pending_alarm(&alarm_name),
    })
}
