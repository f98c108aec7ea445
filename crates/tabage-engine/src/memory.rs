//! In-memory host
//!
//! Implements every host capability over plain collections. Records each call
//! in an operation log so callers can assert on exactly what the engine asked
//! the host to do, and can inject a failure into the next call of a given
//! operation.

use chrono::{DateTime, Local};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tabage_core::{
    Clock, Container, ContainerId, ContainerService, ContainerUpdate, Error, Host, KeyValueStore,
    Resource, ResourceDirectory, ResourceFilter, ResourceRef, Result, TimerService, WindowId,
};

pub const PLACEHOLDER_LOCATOR: &str = "chrome://newtab/";

// ---------------------------------------------------------------------------
// Key-value store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    values: DashMap<String, serde_json::Value>,
    writes: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, key: &str, value: serde_json::Value) -> Self {
        self.values.insert(key.to_string(), value);
        self
    }

    /// Number of successful `set` calls.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn value(&self, key: &str) -> Option<serde_json::Value> {
        self.values.get(key).map(|v| v.clone())
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(Error::storage(format!("read of {key} rejected")));
        }
        Ok(self.value(key))
    }

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::storage(format!("write of {key} rejected")));
        }
        self.values.insert(key.to_string(), value);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// A clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Local>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Local>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Local>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Local> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Host operations log
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum HostOp {
    ListResources,
    GetResource { id: ResourceRef },
    OpenPlaceholder { id: ResourceRef },
    ListContainers,
    CreateContainer { container: ContainerId, members: Vec<ResourceRef> },
    AddMembers { container: ContainerId, members: Vec<ResourceRef> },
    UpdateContainer { container: ContainerId, title: Option<String>, collapsed: Option<bool> },
    ScheduleAlarm { name: String, delay_ms: u64 },
}

impl HostOp {
    /// Operations that change container state.
    pub fn is_container_mutation(&self) -> bool {
        matches!(
            self,
            Self::CreateContainer { .. } | Self::AddMembers { .. } | Self::UpdateContainer { .. }
        )
    }
}

/// Serializable picture of the host's resources and containers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HostSnapshot {
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub containers: Vec<Container>,
}

#[derive(Default)]
struct HostState {
    resources: BTreeMap<ResourceRef, Resource>,
    containers: BTreeMap<ContainerId, Container>,
    alarms: HashMap<String, Duration>,
    next_resource: i64,
    next_container: i64,
    ops: Vec<HostOp>,
    failures: Vec<&'static str>,
}

impl HostState {
    fn take_failure(&mut self, op: &'static str) -> Result<()> {
        match self.failures.iter().position(|f| *f == op) {
            Some(i) => {
                self.failures.remove(i);
                Err(Error::host_failed(op, "injected failure"))
            }
            None => Ok(()),
        }
    }

    fn require_resources(&self, members: &[ResourceRef]) -> Result<()> {
        match members.iter().find(|id| !self.resources.contains_key(id)) {
            Some(missing) => Err(Error::not_found("resource", missing)),
            None => Ok(()),
        }
    }

    fn allocate_resource(&mut self) -> ResourceRef {
        self.next_resource += 1;
        ResourceRef(self.next_resource)
    }

    fn allocate_container(&mut self) -> ContainerId {
        self.next_container += 1;
        ContainerId(self.next_container)
    }

    fn next_index(&self, window: WindowId) -> u32 {
        self.resources.values().filter(|r| r.window == window).count() as u32
    }

    /// Containers disappear once their last member leaves.
    fn prune_empty(&mut self) {
        let occupied: Vec<ContainerId> = self.resources.values().filter_map(|r| r.container).collect();
        self.containers.retain(|id, _| occupied.contains(id));
    }

    /// Close the index gap left behind in `window`.
    fn reindex(&mut self, window: WindowId) {
        let mut ordered: Vec<(u32, ResourceRef)> = self
            .resources
            .values()
            .filter(|r| r.window == window)
            .map(|r| (r.index, r.id))
            .collect();
        ordered.sort();
        for (position, (_, id)) in ordered.into_iter().enumerate() {
            if let Some(r) = self.resources.get_mut(&id) {
                r.index = position as u32;
            }
        }
    }

    fn move_into(&mut self, container: ContainerId, members: &[ResourceRef]) {
        for id in members {
            if let Some(r) = self.resources.get_mut(id) {
                r.container = Some(container);
            }
        }
        self.prune_empty();
    }
}

// ---------------------------------------------------------------------------
// MemoryHost
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryHost {
    state: Mutex<HostState>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: HostSnapshot) -> Self {
        let host = Self::new();
        {
            let mut state = host.lock();
            for r in snapshot.resources {
                state.next_resource = state.next_resource.max(r.id.0);
                state.resources.insert(r.id, r);
            }
            for c in snapshot.containers {
                state.next_container = state.next_container.max(c.id.0);
                state.containers.insert(c.id, c);
            }
        }
        host
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bundle this host with a store and clock.
    pub fn host(
        self: &Arc<Self>,
        storage: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
    ) -> Host {
        Host {
            resources: self.clone(),
            containers: self.clone(),
            storage,
            timers: self.clone(),
            clock,
        }
    }

    pub fn snapshot(&self) -> HostSnapshot {
        let state = self.lock();
        HostSnapshot {
            resources: state.resources.values().cloned().collect(),
            containers: state.containers.values().cloned().collect(),
        }
    }

    /// Open a resource at the end of `window`.
    pub fn open(&self, locator: &str, window: WindowId) -> Resource {
        let mut state = self.lock();
        let id = state.allocate_resource();
        let resource = Resource {
            id,
            locator: locator.to_string(),
            window,
            index: state.next_index(window),
            pinned: false,
            container: None,
        };
        state.resources.insert(id, resource.clone());
        resource
    }

    pub fn open_pinned(&self, locator: &str, window: WindowId) -> Resource {
        let mut resource = self.open(locator, window);
        resource.pinned = true;
        self.lock().resources.insert(resource.id, resource.clone());
        resource
    }

    pub fn close(&self, id: ResourceRef) -> Option<Resource> {
        let mut state = self.lock();
        let removed = state.resources.remove(&id)?;
        state.reindex(removed.window);
        state.prune_empty();
        Some(removed)
    }

    pub fn navigate(&self, id: ResourceRef, locator: &str) -> Option<Resource> {
        let mut state = self.lock();
        let r = state.resources.get_mut(&id)?;
        r.locator = locator.to_string();
        Some(r.clone())
    }

    /// Give every resource a fresh id, the way a host restart does.
    /// Returns (old, new) pairs.
    pub fn reassign_ids(&self) -> Vec<(ResourceRef, ResourceRef)> {
        let mut state = self.lock();
        let old: Vec<Resource> = std::mem::take(&mut state.resources).into_values().collect();
        let mut pairs = Vec::with_capacity(old.len());
        for mut r in old {
            let fresh = state.allocate_resource();
            pairs.push((r.id, fresh));
            r.id = fresh;
            state.resources.insert(fresh, r);
        }
        pairs
    }

    /// Insert a titled container holding `members`.
    pub fn add_container(&self, id: ContainerId, title: &str, members: &[ResourceRef]) -> Container {
        let mut state = self.lock();
        let window = members
            .first()
            .and_then(|m| state.resources.get(m))
            .map(|r| r.window)
            .unwrap_or(WindowId(1));
        let container = Container {
            id,
            title: Some(title.to_string()),
            collapsed: false,
            window,
        };
        state.next_container = state.next_container.max(id.0);
        state.containers.insert(id, container.clone());
        for m in members {
            if let Some(r) = state.resources.get_mut(m) {
                r.container = Some(id);
            }
        }
        container
    }

    pub fn resource(&self, id: ResourceRef) -> Option<Resource> {
        self.lock().resources.get(&id).cloned()
    }

    pub fn resources(&self) -> Vec<Resource> {
        self.lock().resources.values().cloned().collect()
    }

    pub fn containers(&self) -> Vec<Container> {
        self.lock().containers.values().cloned().collect()
    }

    pub fn container_titled(&self, title: &str) -> Option<Container> {
        self.lock()
            .containers
            .values()
            .find(|c| c.title.as_deref() == Some(title))
            .cloned()
    }

    pub fn members_of(&self, container: ContainerId) -> Vec<ResourceRef> {
        self.lock()
            .resources
            .values()
            .filter(|r| r.container == Some(container))
            .map(|r| r.id)
            .collect()
    }

    pub fn pending_alarm(&self, name: &str) -> Option<Duration> {
        self.lock().alarms.get(name).copied()
    }

    pub fn ops(&self) -> Vec<HostOp> {
        self.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.lock().ops.clear();
    }

    pub fn container_mutations(&self) -> Vec<HostOp> {
        self.lock()
            .ops
            .iter()
            .filter(|op| op.is_container_mutation())
            .cloned()
            .collect()
    }

    /// Fail the next call of `op` (e.g. "containers.add").
    pub fn fail_next(&self, op: &'static str) {
        self.lock().failures.push(op);
    }
}

#[async_trait::async_trait]
impl ResourceDirectory for MemoryHost {
    async fn list(&self, filter: ResourceFilter) -> Result<Vec<Resource>> {
        let mut state = self.lock();
        state.ops.push(HostOp::ListResources);
        state.take_failure("resources.list")?;
        Ok(state
            .resources
            .values()
            .filter(|r| filter.accepts(r))
            .cloned()
            .collect())
    }

    async fn get(&self, id: ResourceRef) -> Result<Resource> {
        let mut state = self.lock();
        state.ops.push(HostOp::GetResource { id });
        state.take_failure("resources.get")?;
        state
            .resources
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("resource", id))
    }

    async fn open_placeholder(&self, window: Option<WindowId>) -> Result<Resource> {
        let mut state = self.lock();
        state.take_failure("resources.open_placeholder")?;
        let window = window
            .or_else(|| state.resources.values().next().map(|r| r.window))
            .unwrap_or(WindowId(1));
        let id = state.allocate_resource();
        let resource = Resource {
            id,
            locator: PLACEHOLDER_LOCATOR.to_string(),
            window,
            index: state.next_index(window),
            pinned: false,
            container: None,
        };
        state.resources.insert(id, resource.clone());
        state.ops.push(HostOp::OpenPlaceholder { id });
        Ok(resource)
    }
}

#[async_trait::async_trait]
impl ContainerService for MemoryHost {
    async fn list(&self) -> Result<Vec<Container>> {
        let mut state = self.lock();
        state.ops.push(HostOp::ListContainers);
        state.take_failure("containers.list")?;
        Ok(state.containers.values().cloned().collect())
    }

    async fn create(&self, members: &[ResourceRef]) -> Result<ContainerId> {
        let mut state = self.lock();
        state.take_failure("containers.create")?;
        let first = members
            .first()
            .ok_or_else(|| Error::host_failed("containers.create", "no members"))?;
        state.require_resources(members)?;
        let window = state
            .resources
            .get(first)
            .map(|r| r.window)
            .unwrap_or(WindowId(1));
        let id = state.allocate_container();
        state.containers.insert(
            id,
            Container {
                id,
                title: None,
                collapsed: false,
                window,
            },
        );
        state.move_into(id, members);
        state.ops.push(HostOp::CreateContainer {
            container: id,
            members: members.to_vec(),
        });
        Ok(id)
    }

    async fn add(&self, container: ContainerId, members: &[ResourceRef]) -> Result<()> {
        let mut state = self.lock();
        state.ops.push(HostOp::AddMembers {
            container,
            members: members.to_vec(),
        });
        state.take_failure("containers.add")?;
        if !state.containers.contains_key(&container) {
            return Err(Error::not_found("container", container));
        }
        state.require_resources(members)?;
        state.move_into(container, members);
        Ok(())
    }

    async fn update(&self, container: ContainerId, update: ContainerUpdate) -> Result<()> {
        let mut state = self.lock();
        state.ops.push(HostOp::UpdateContainer {
            container,
            title: update.title.clone(),
            collapsed: update.collapsed,
        });
        state.take_failure("containers.update")?;
        let c = state
            .containers
            .get_mut(&container)
            .ok_or_else(|| Error::not_found("container", container))?;
        if let Some(title) = update.title {
            c.title = Some(title);
        }
        if let Some(collapsed) = update.collapsed {
            c.collapsed = collapsed;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl TimerService for MemoryHost {
    async fn schedule(&self, name: &str, delay: Duration) -> Result<()> {
        let mut state = self.lock();
        state.take_failure("timers.schedule")?;
        state.alarms.insert(name.to_string(), delay);
        state.ops.push(HostOp::ScheduleAlarm {
            name: name.to_string(),
            delay_ms: delay.as_millis() as u64,
        });
        Ok(())
    }
}
