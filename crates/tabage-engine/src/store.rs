//! Identity store
//!
//! Owns every [`TrackedEntry`]. Entries live in memory and are written to the
//! host's key-value store by a background flusher once mutations have been
//! quiet for the debounce window, so a burst of creates/removes costs one
//! write. Entries mutated within the last window can be lost if the host dies
//! without a `Suspending` signal.

use crate::resolver::{Resolution, Resolver};
use crate::settings::keys;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tabage_core::{EntryId, Error, KeyValueStore, Resource, ResourceRef, Result, TrackedEntry};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A record from the pre-fingerprint `tabData` layout: transient id → creation time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LegacyRecord {
    pub transient_ref: ResourceRef,
    pub created_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct LegacyValue {
    created: i64,
}

#[derive(Debug, Default)]
pub struct LoadOutcome {
    pub loaded: usize,
    /// Records that still need a live resource to become entries.
    pub legacy: Vec<LegacyRecord>,
}

struct StoreInner {
    entries: DashMap<EntryId, TrackedEntry>,
    storage: Arc<dyn KeyValueStore>,
    dirty: AtomicBool,
}

impl StoreInner {
    fn snapshot(&self) -> BTreeMap<EntryId, TrackedEntry> {
        self.entries
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    async fn flush(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let snapshot = self.snapshot();
        let count = snapshot.len();
        let value = serde_json::to_value(snapshot)?;
        match self.storage.set(keys::ENTRIES, value).await {
            Ok(()) => {
                debug!(entries = count, "Entry map persisted");
                Ok(())
            }
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }
}

pub struct IdentityStore {
    inner: Arc<StoreInner>,
    signal: mpsc::UnboundedSender<()>,
    cancel: CancellationToken,
}

impl IdentityStore {
    /// Create an empty store and start its flusher. Must be called from
    /// within a Tokio runtime.
    pub fn new(storage: Arc<dyn KeyValueStore>, debounce: Duration) -> Self {
        let inner = Arc::new(StoreInner {
            entries: DashMap::new(),
            storage,
            dirty: AtomicBool::new(false),
        });
        let (signal, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        tokio::spawn(run_flusher(inner.clone(), rx, debounce, cancel.clone()));
        Self {
            inner,
            signal,
            cancel,
        }
    }

    pub fn resolver(&self) -> Resolver<'_> {
        Resolver::new(self)
    }

    /// Replace in-memory state with what storage holds.
    pub async fn load(&self) -> Result<LoadOutcome> {
        let mut outcome = LoadOutcome::default();
        match self.inner.storage.get(keys::ENTRIES).await? {
            Some(value) => {
                let stored: HashMap<EntryId, TrackedEntry> = match serde_json::from_value(value) {
                    Ok(map) => map,
                    Err(e) => {
                        warn!("Stored entry map is unreadable, starting empty: {}", e);
                        HashMap::new()
                    }
                };
                self.inner.entries.clear();
                for (id, mut entry) in stored {
                    entry.id = id;
                    self.inner.entries.insert(id, entry);
                }
                outcome.loaded = self.inner.entries.len();
            }
            None => {
                self.inner.entries.clear();
                if let Some(value) = self.inner.storage.get(keys::LEGACY_ENTRIES).await? {
                    outcome.legacy = parse_legacy(value);
                }
            }
        }
        self.inner.dirty.store(false, Ordering::SeqCst);
        info!(
            entries = outcome.loaded,
            legacy = outcome.legacy.len(),
            "Identity store loaded"
        );
        Ok(outcome)
    }

    /// Record a freshly observed resource. A resource whose fingerprint
    /// already belongs to an entry keeps that entry and its creation time.
    pub fn record(&self, resource: &Resource, now: DateTime<Utc>) -> TrackedEntry {
        let resolver = self.resolver();
        let existing = resolver.match_by_fingerprint(&resource.fingerprint());
        let keep = existing.as_ref().map(|e| e.id);
        // The host reused the id for a different resource.
        while let Some(stale) =
            self.find_oldest(|e| e.transient_ref == resource.id && Some(e.id) != keep)
        {
            debug!(entry = %stale.id, resource = %resource.id, "Dropping entry for reused ref");
            self.forget(stale.id);
        }
        if let Some(existing) = existing {
            if existing.transient_ref == resource.id {
                debug!(entry = %existing.id, resource = %resource.id, "Duplicate creation ignored");
                return existing;
            }
            let resolution = Resolution::from(resource);
            if let Ok(repaired) = resolver.repair(existing.id, resolution) {
                return repaired;
            }
        }
        self.insert(resource, now)
    }

    /// Track `resource` under a new id, without looking for an existing entry.
    pub fn insert(&self, resource: &Resource, created_at: DateTime<Utc>) -> TrackedEntry {
        let entry = TrackedEntry {
            id: EntryId::generate(),
            created_at,
            transient_ref: resource.id,
            fingerprint: resource.fingerprint(),
        };
        self.inner.entries.insert(entry.id, entry.clone());
        debug!(entry = %entry.id, resource = %resource.id, "Entry recorded");
        self.touch();
        entry
    }

    pub fn forget(&self, id: EntryId) -> Option<TrackedEntry> {
        let removed = self.inner.entries.remove(&id).map(|(_, e)| e);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    pub fn forget_by_ref(&self, transient_ref: ResourceRef) -> Option<TrackedEntry> {
        let entry = self.resolver().match_by_transient_ref(transient_ref)?;
        self.forget(entry.id)
    }

    pub fn get(&self, id: EntryId) -> Option<TrackedEntry> {
        self.inner.entries.get(&id).map(|e| e.value().clone())
    }

    /// Snapshot of all entries, oldest first.
    pub fn all(&self) -> Vec<TrackedEntry> {
        let mut entries: Vec<TrackedEntry> =
            self.inner.entries.iter().map(|e| e.value().clone()).collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        entries
    }

    /// Oldest entry accepted by `pred`, without copying the whole map.
    pub(crate) fn find_oldest<P>(&self, pred: P) -> Option<TrackedEntry>
    where
        P: Fn(&TrackedEntry) -> bool,
    {
        self.inner
            .entries
            .iter()
            .filter(|e| pred(e.value()))
            .min_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then(a.id.cmp(&b.id))
            })
            .map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Apply `f` to one entry and schedule a flush.
    pub(crate) fn update<F>(&self, id: EntryId, f: F) -> Result<TrackedEntry>
    where
        F: FnOnce(&mut TrackedEntry),
    {
        let updated = {
            let mut entry = self
                .inner
                .entries
                .get_mut(&id)
                .ok_or_else(|| Error::not_found("entry", id))?;
            f(entry.value_mut());
            entry.value().clone()
        };
        self.touch();
        Ok(updated)
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::SeqCst)
    }

    /// Write pending changes now instead of waiting for the window.
    pub async fn flush_now(&self) -> Result<()> {
        self.inner.flush().await
    }

    /// Stop the flusher and write anything pending.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        self.inner.flush().await
    }

    fn touch(&self) {
        self.inner.dirty.store(true, Ordering::SeqCst);
        // Only fails after shutdown; flush_now still covers that case.
        let _ = self.signal.send(());
    }
}

impl Drop for IdentityStore {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn parse_legacy(value: serde_json::Value) -> Vec<LegacyRecord> {
    let map: HashMap<String, LegacyValue> = match serde_json::from_value(value) {
        Ok(map) => map,
        Err(e) => {
            warn!("Ignoring unreadable legacy entries: {}", e);
            return Vec::new();
        }
    };
    let mut records: Vec<LegacyRecord> = map
        .into_iter()
        .filter_map(|(key, v)| {
            let transient_ref = ResourceRef(key.parse().ok()?);
            let created_at = DateTime::<Utc>::from_timestamp_millis(v.created)?;
            Some(LegacyRecord {
                transient_ref,
                created_at,
            })
        })
        .collect();
    records.sort_by_key(|r| r.transient_ref);
    records
}

/// Trailing-edge debounce: the first mutation opens a window, every further
/// mutation restarts it, and the map is written once the window passes quietly.
async fn run_flusher(
    inner: Arc<StoreInner>,
    mut rx: mpsc::UnboundedReceiver<()>,
    window: Duration,
    cancel: CancellationToken,
) {
    let mut retry = false;
    loop {
        if !retry {
            tokio::select! {
                _ = cancel.cancelled() => return,
                signal = rx.recv() => {
                    if signal.is_none() {
                        return;
                    }
                }
            }
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(window) => break,
                signal = rx.recv() => {
                    if signal.is_none() {
                        break;
                    }
                }
            }
        }

        retry = match inner.flush().await {
            Ok(()) => false,
            Err(e) => {
                warn!("Entry map flush failed, retrying next window: {}", e);
                true
            }
        };
    }
}
