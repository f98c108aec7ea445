//! Inbound host events and messages
//!
//! The host delivers resource lifecycle notifications, fired alarms and
//! messages from the settings page. All of them funnel into one ordered
//! stream consumed by the orchestrator.

use crate::types::{Resource, ResourceRef};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostEvent {
    /// First activation after the engine was installed.
    Installed,
    /// Host process restarted.
    Started,
    ResourceCreated {
        resource: Resource,
    },
    ResourceRemoved {
        id: ResourceRef,
    },
    /// `complete` is set once the resource finished loading its locator.
    ResourceUpdated {
        resource: Resource,
        complete: bool,
    },
    AlarmFired {
        name: String,
    },
    Message {
        request: Request,
    },
    /// The host is about to terminate the engine.
    Suspending,
}

impl HostEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Installed => "installed",
            Self::Started => "started",
            Self::ResourceCreated { .. } => "resource_created",
            Self::ResourceRemoved { .. } => "resource_removed",
            Self::ResourceUpdated { .. } => "resource_updated",
            Self::AlarmFired { .. } => "alarm_fired",
            Self::Message { .. } => "message",
            Self::Suspending => "suspending",
        }
    }
}

/// Typed requests from the settings page.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Request {
    /// Settings were saved: reload them, reschedule, ensure containers exist.
    SettingsChanged,
    /// Run a reclamation and reconciliation pass right away.
    SortNow,
    /// Log every tracked entry with its age.
    Dump,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Uninitialized,
    Loading,
    Ready,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Loading => write!(f, "loading"),
            Self::Ready => write!(f, "ready"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationReason {
    Install,
    Startup,
}

impl std::fmt::Display for ActivationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Install => write!(f, "install"),
            Self::Startup => write!(f, "startup"),
        }
    }
}
