//! Host snapshots on disk: the resources and containers of a host, as JSON.

use anyhow::Context;
use std::path::Path;
use tabage_core::HostEvent;
use tabage_engine::HostSnapshot;
use tokio::fs;

pub async fn load(path: &Path) -> anyhow::Result<HostSnapshot> {
    let data = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading snapshot {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing snapshot {}", path.display()))
}

pub async fn save(path: &Path, snapshot: &HostSnapshot) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(snapshot)?;
    fs::write(path, json)
        .await
        .with_context(|| format!("writing snapshot {}", path.display()))?;
    Ok(())
}

/// A JSON array of host events to replay after activation.
pub async fn load_events(path: &Path) -> anyhow::Result<Vec<HostEvent>> {
    let data = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading events {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing events {}", path.display()))
}
