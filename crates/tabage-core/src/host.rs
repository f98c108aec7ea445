//! Host capability traits
//!
//! Everything the engine needs from the environment it runs in: resource
//! enumeration, container (group) management, key-value storage, one-shot
//! timers and a clock. Inbound notifications (resource created/removed,
//! alarms, messages) arrive as [`crate::HostEvent`]s instead.

use crate::error::Result;
use crate::types::{
    Container, ContainerId, ContainerUpdate, Resource, ResourceFilter, ResourceRef, WindowId,
};
use chrono::{DateTime, Local};
use std::sync::Arc;
use std::time::Duration;

#[async_trait::async_trait]
pub trait ResourceDirectory: Send + Sync {
    /// Enumerate live resources accepted by `filter`.
    async fn list(&self, filter: ResourceFilter) -> Result<Vec<Resource>>;

    /// Fetch one resource. Absent resources fail with `Error::NotFound`.
    async fn get(&self, id: ResourceRef) -> Result<Resource>;

    /// Open a blank resource, used to seed a container for a bucket that has
    /// no members yet. `None` lets the host pick the window.
    async fn open_placeholder(&self, window: Option<WindowId>) -> Result<Resource>;
}

#[async_trait::async_trait]
pub trait ContainerService: Send + Sync {
    async fn list(&self) -> Result<Vec<Container>>;

    /// Create a new container holding `members`. At least one member is required.
    async fn create(&self, members: &[ResourceRef]) -> Result<ContainerId>;

    /// Move `members` into an existing container.
    async fn add(&self, container: ContainerId, members: &[ResourceRef]) -> Result<()>;

    async fn update(&self, container: ContainerId, update: ContainerUpdate) -> Result<()>;
}

/// Small named values with whole-value replace semantics.
#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;

    async fn set(&self, key: &str, value: serde_json::Value) -> Result<()>;
}

/// Named one-shot alarms. Scheduling a name again replaces the pending alarm.
#[async_trait::async_trait]
pub trait TimerService: Send + Sync {
    async fn schedule(&self, name: &str, delay: Duration) -> Result<()>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// The full set of host capabilities handed to the engine.
#[derive(Clone)]
pub struct Host {
    pub resources: Arc<dyn ResourceDirectory>,
    pub containers: Arc<dyn ContainerService>,
    pub storage: Arc<dyn KeyValueStore>,
    pub timers: Arc<dyn TimerService>,
    pub clock: Arc<dyn Clock>,
}
