//! Bucket reconciliation
//!
//! Diffs where each tracked resource should be (its age bucket's container)
//! against where it is, and asks the host for the smallest set of moves.
//! Resources already inside the right container are left alone, so a second
//! pass over unchanged state issues no container mutations at all.
//!
//! A failure to place one resource or one bucket is logged and counted; it
//! never aborts the rest of the pass.

use crate::classify::classify;
use crate::resolver::LiveIndex;
use crate::store::IdentityStore;
use chrono::{DateTime, TimeZone};
use serde::Serialize;
use std::collections::HashMap;
use tabage_core::{
    BucketDefinition, Container, ContainerId, ContainerUpdate, Error, Host, ResourceFilter,
    ResourceRef, Result,
};
use tracing::{debug, info, warn};

/// Where one resolved resource is and which bucket it belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Placement {
    pub resource: ResourceRef,
    pub current: Option<ContainerId>,
    pub bucket: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ContainerAction {
    /// Move members into the existing container for `title`.
    Move {
        container: ContainerId,
        title: String,
        members: Vec<ResourceRef>,
    },
    /// No container carries `title` yet.
    Create {
        title: String,
        members: Vec<ResourceRef>,
    },
}

impl ContainerAction {
    pub fn title(&self) -> &str {
        match self {
            Self::Move { title, .. } | Self::Create { title, .. } => title,
        }
    }

    pub fn members(&self) -> &[ResourceRef] {
        match self {
            Self::Move { members, .. } | Self::Create { members, .. } => members,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub actions: Vec<ContainerAction>,
    pub moved: usize,
    pub created: Vec<String>,
    /// Entries with no live resource this pass.
    pub unresolved: usize,
    /// Resolved resources that fit no bucket (or are pinned).
    pub unbucketed: usize,
    pub failures: Vec<String>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.actions.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub kept: usize,
    pub repaired: usize,
    pub removed: usize,
}

/// Title → container id. The first container carrying a title wins.
fn containers_by_title(containers: &[Container]) -> HashMap<&str, ContainerId> {
    let mut by_title = HashMap::new();
    for c in containers {
        if let Some(title) = c.title.as_deref().filter(|t| !t.is_empty()) {
            by_title.entry(title).or_insert(c.id);
        }
    }
    by_title
}

/// Group pending placements into one action per bucket, in definition order.
pub fn plan(
    placements: &[Placement],
    containers: &[Container],
    definitions: &[BucketDefinition],
) -> Vec<ContainerAction> {
    let by_title = containers_by_title(containers);
    let mut desired: Vec<(&str, Vec<ResourceRef>)> =
        definitions.iter().map(|d| (d.name.as_str(), Vec::new())).collect();

    for placement in placements {
        let target = by_title.get(placement.bucket.as_str()).copied();
        if target.is_some() && target == placement.current {
            continue;
        }
        if let Some((_, members)) = desired.iter_mut().find(|(name, _)| *name == placement.bucket) {
            members.push(placement.resource);
        }
    }

    desired
        .into_iter()
        .filter(|(_, members)| !members.is_empty())
        .map(|(title, members)| match by_title.get(title) {
            Some(container) => ContainerAction::Move {
                container: *container,
                title: title.to_string(),
                members,
            },
            None => ContainerAction::Create {
                title: title.to_string(),
                members,
            },
        })
        .collect()
}

pub struct Reconciler<'a> {
    host: &'a Host,
    collapse_new: bool,
}

impl<'a> Reconciler<'a> {
    pub fn new(host: &'a Host) -> Self {
        Self {
            host,
            collapse_new: true,
        }
    }

    /// Collapse containers opened by [`Reconciler::ensure_containers`].
    pub fn collapse_new_containers(mut self, collapse: bool) -> Self {
        self.collapse_new = collapse;
        self
    }

    /// Drop entries whose resource is gone; repair the ones found again by
    /// fingerprint.
    pub async fn sweep_orphans(&self, store: &IdentityStore) -> Result<SweepReport> {
        let live = self.host.resources.list(ResourceFilter::all()).await?;
        let entries = store.all();
        let mut index = LiveIndex::new(&live, &entries);
        let resolver = store.resolver();
        let mut report = SweepReport::default();

        for entry in &entries {
            // Re-check: a removal may have raced with the listing above.
            if store.get(entry.id).is_none() {
                continue;
            }
            match resolver.resolve(entry, &mut index) {
                Ok(resource) if resource.id == entry.transient_ref => report.kept += 1,
                Ok(_) => report.repaired += 1,
                Err(e) if e.is_not_found() => {
                    info!(entry = %entry.id, resource = %entry.transient_ref, "Removing orphan entry");
                    store.forget(entry.id);
                    report.removed += 1;
                }
                Err(e) => warn!(entry = %entry.id, "Orphan check failed: {}", e),
            }
        }
        info!(
            kept = report.kept,
            repaired = report.repaired,
            removed = report.removed,
            "Orphan sweep finished"
        );
        Ok(report)
    }

    /// One full pass: resolve, classify, plan, apply.
    pub async fn run<Tz: TimeZone>(
        &self,
        store: &IdentityStore,
        definitions: &[BucketDefinition],
        now: &DateTime<Tz>,
    ) -> Result<ReconcileReport> {
        let live = self.host.resources.list(ResourceFilter::all()).await?;
        let containers = self.host.containers.list().await?;
        let entries = store.all();
        let mut index = LiveIndex::new(&live, &entries);
        let resolver = store.resolver();
        let mut report = ReconcileReport::default();
        let mut placements = Vec::new();

        for entry in &entries {
            let resource = match resolver.resolve(entry, &mut index) {
                Ok(resource) => resource,
                Err(e) => {
                    debug!(entry = %entry.id, "Skipping entry: {}", e);
                    report.unresolved += 1;
                    continue;
                }
            };
            if resource.pinned {
                report.unbucketed += 1;
                continue;
            }
            let Some(bucket) = classify(entry.created_at, now, definitions) else {
                report.unbucketed += 1;
                continue;
            };
            placements.push(Placement {
                resource: resource.id,
                current: resource.container,
                bucket: bucket.name.clone(),
            });
        }

        let actions = plan(&placements, &containers, definitions);
        for action in &actions {
            for member in action.members() {
                debug!(resource = %member, bucket = action.title(), "Moving resource");
            }
        }
        self.apply(&actions, &mut report).await;
        report.actions = actions;

        info!(
            moved = report.moved,
            created = report.created.len(),
            unresolved = report.unresolved,
            unbucketed = report.unbucketed,
            failures = report.failures.len(),
            "Reconciliation finished"
        );
        Ok(report)
    }

    pub async fn apply(&self, actions: &[ContainerAction], report: &mut ReconcileReport) {
        for action in actions {
            let result = match action {
                ContainerAction::Move {
                    container, members, ..
                } => self.host.containers.add(*container, members).await,
                ContainerAction::Create { title, members } => {
                    self.create_bucket(title, members, report).await
                }
            };
            match result {
                Ok(()) => report.moved += action.members().len(),
                Err(e) => {
                    warn!(bucket = action.title(), "Failed to place bucket members: {}", e);
                    report.failures.push(format!("{}: {}", action.title(), e));
                }
            }
        }
    }

    /// Create the container for `title` from its first member, label it,
    /// then move the rest in. If a container with that title appeared since
    /// planning, use it instead.
    async fn create_bucket(
        &self,
        title: &str,
        members: &[ResourceRef],
        report: &mut ReconcileReport,
    ) -> Result<()> {
        if let Some(existing) = self.find_titled(title).await? {
            debug!(bucket = title, container = %existing, "Container appeared before create");
            return self.host.containers.add(existing, members).await;
        }
        let (first, rest) = members
            .split_first()
            .ok_or_else(|| Error::host_failed("containers.create", "no members"))?;
        let container = self.host.containers.create(&[*first]).await?;
        self.host
            .containers
            .update(container, ContainerUpdate::title(title))
            .await?;
        report.created.push(title.to_string());
        info!(bucket = title, container = %container, "Container created");
        if !rest.is_empty() {
            self.host.containers.add(container, rest).await?;
        }
        Ok(())
    }

    async fn find_titled(&self, title: &str) -> Result<Option<ContainerId>> {
        let containers = self.host.containers.list().await?;
        Ok(containers_by_title(&containers).get(title).copied())
    }

    /// Make sure every bucket has a container, seeding empty ones with a
    /// placeholder resource. Returns the titles created.
    pub async fn ensure_containers(&self, definitions: &[BucketDefinition]) -> Result<Vec<String>> {
        let containers = self.host.containers.list().await?;
        let existing = containers_by_title(&containers);
        let missing: Vec<&str> = definitions
            .iter()
            .map(|d| d.name.as_str())
            .filter(|name| !name.trim().is_empty() && !existing.contains_key(name))
            .collect();
        if missing.is_empty() {
            debug!("Bucket containers already exist");
            return Ok(Vec::new());
        }
        info!(missing = ?missing, "Creating missing bucket containers");

        let mut created = Vec::new();
        for title in missing {
            match self.seed_container(title).await {
                Ok(true) => created.push(title.to_string()),
                Ok(false) => {}
                Err(e) => warn!(bucket = title, "Failed to create container: {}", e),
            }
        }
        Ok(created)
    }

    async fn seed_container(&self, title: &str) -> Result<bool> {
        let containers = self.host.containers.list().await?;
        if containers_by_title(&containers).contains_key(title) {
            return Ok(false);
        }
        // Next to the existing containers, if there are any.
        let window = containers.first().map(|c| c.window);
        let placeholder = self.host.resources.open_placeholder(window).await?;
        let container = self.host.containers.create(&[placeholder.id]).await?;
        self.host
            .containers
            .update(
                container,
                ContainerUpdate::title(title).collapsed(self.collapse_new),
            )
            .await?;
        Ok(true)
    }
}
