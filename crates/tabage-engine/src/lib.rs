//! Tabage Engine - age-bucket reconciliation
//!
//! - `store`: durable entry map (stable id → created-at, transient ref, fingerprint)
//! - `resolver`: re-associates entries with live resources when refs go stale
//! - `classify`: age in local calendar days → bucket
//! - `reconcile`: desired bucket membership vs live containers, minimal moves
//! - `orchestrator`: install/startup/alarm/message sequencing

pub mod classify;
pub mod config;
pub mod file_store;
pub mod memory;
pub mod orchestrator;
pub mod reconcile;
pub mod resolver;
pub mod schedule;
pub mod settings;
pub mod store;

pub use classify::{calendar_days_between, classify};
pub use config::EngineConfig;
pub use file_store::FileStore;
pub use memory::{HostOp, HostSnapshot, ManualClock, MemoryHost, MemoryStore};
pub use orchestrator::Orchestrator;
pub use reconcile::{plan, ContainerAction, Placement, ReconcileReport, Reconciler, SweepReport};
pub use resolver::{Resolution, Resolver};
pub use schedule::{next_occurrence, DailyTime};
pub use settings::{keys, Settings};
pub use store::{IdentityStore, LegacyRecord, LoadOutcome};

pub use tabage_core::{Error, Result};
