//! Core types for Tabage

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of a tracked entry. Generated once, never reused.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(Uuid);

impl EntryId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for EntryId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

macro_rules! host_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(v: i64) -> Self {
                Self(v)
            }
        }
    };
}

host_id!(
    /// Host-assigned resource (tab) id. Only valid until the host says otherwise.
    ResourceRef
);
host_id!(
    /// Host-assigned container (tab group) id.
    ContainerId
);
host_id!(
    /// Host window id. Part of a resource's fingerprint.
    WindowId
);

/// Best-effort identity signature for a resource whose transient ref went stale.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Where the resource points (the tab URL).
    pub locator: String,
    pub window: WindowId,
    /// Position inside the window at the time it was observed.
    pub position: u32,
}

impl Fingerprint {
    pub fn new(locator: impl Into<String>, window: WindowId, position: u32) -> Self {
        Self {
            locator: locator.into(),
            window,
            position,
        }
    }

    /// Locator, window and position must all agree.
    pub fn matches_strict(&self, other: &Fingerprint) -> bool {
        self.locator == other.locator && self.window == other.window && self.position == other.position
    }

    /// Locator and window agree; position may have shifted.
    pub fn matches_place(&self, other: &Fingerprint) -> bool {
        self.locator == other.locator && self.window == other.window
    }
}

/// A tracked resource: when it was first seen and how to find it again.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedEntry {
    pub id: EntryId,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    pub transient_ref: ResourceRef,
    pub fingerprint: Fingerprint,
}

/// A live resource as enumerated by the host.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceRef,
    pub locator: String,
    pub window: WindowId,
    pub index: u32,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerId>,
}

impl Resource {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::new(self.locator.clone(), self.window, self.index)
    }
}

/// A host-owned grouping object. `title` joins against [`BucketDefinition::name`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub collapsed: bool,
    pub window: WindowId,
}

/// A named age bucket. The bucket with the highest `min_days` not above a
/// resource's age wins.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketDefinition {
    pub name: String,
    pub min_days: u32,
}

impl BucketDefinition {
    pub fn new(name: impl Into<String>, min_days: u32) -> Self {
        Self {
            name: name.into(),
            min_days,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceFilter {
    pub include_pinned: bool,
}

impl ResourceFilter {
    pub fn all() -> Self {
        Self {
            include_pinned: true,
        }
    }

    pub fn unpinned() -> Self {
        Self {
            include_pinned: false,
        }
    }

    pub fn accepts(&self, resource: &Resource) -> bool {
        self.include_pinned || !resource.pinned
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerUpdate {
    pub title: Option<String>,
    pub collapsed: Option<bool>,
}

impl ContainerUpdate {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            collapsed: None,
        }
    }

    pub fn collapsed(mut self, collapsed: bool) -> Self {
        self.collapsed = Some(collapsed);
        self
    }
}
