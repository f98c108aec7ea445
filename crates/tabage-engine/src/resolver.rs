//! Fingerprint resolver
//!
//! A stored transient ref is a fast-path cache: it is trusted only while the
//! resource behind it still sits at the entry's locator and window. Otherwise
//! the entry is re-associated with the live resource whose fingerprint
//! (locator, window, position) matches exactly. Each live resource can back at
//! most one entry.

use crate::store::IdentityStore;
use std::collections::{HashMap, HashSet};
use tabage_core::{EntryId, Error, Fingerprint, Resource, ResourceRef, Result, TrackedEntry};
use tracing::debug;

/// Where a stale entry was found again.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub transient_ref: ResourceRef,
    pub locator: String,
}

impl From<&Resource> for Resolution {
    fn from(resource: &Resource) -> Self {
        Self {
            transient_ref: resource.id,
            locator: resource.locator.clone(),
        }
    }
}

/// Live resources for one pass, with the refs already spoken for.
pub struct LiveIndex<'r> {
    by_ref: HashMap<ResourceRef, &'r Resource>,
    claimed: HashSet<ResourceRef>,
}

impl<'r> LiveIndex<'r> {
    /// Refs that some entry holds directly, and whose resource still agrees
    /// with that entry, are claimed up front so a stale entry cannot take
    /// over another entry's resource by fingerprint.
    pub fn new(live: &'r [Resource], entries: &[TrackedEntry]) -> Self {
        let by_ref: HashMap<ResourceRef, &Resource> = live.iter().map(|r| (r.id, r)).collect();
        let claimed = entries
            .iter()
            .filter(|e| {
                by_ref
                    .get(&e.transient_ref)
                    .is_some_and(|r| agrees(e, r))
            })
            .map(|e| e.transient_ref)
            .collect();
        Self { by_ref, claimed }
    }

    pub fn get(&self, id: ResourceRef) -> Option<&'r Resource> {
        self.by_ref.get(&id).copied()
    }

    fn claim_by_fingerprint(&mut self, fingerprint: &Fingerprint) -> Option<&'r Resource> {
        let mut candidates: Vec<&'r Resource> = self
            .by_ref
            .values()
            .copied()
            .filter(|r| !self.claimed.contains(&r.id) && r.fingerprint().matches_strict(fingerprint))
            .collect();
        candidates.sort_by_key(|r| r.id);
        let found = candidates.into_iter().next()?;
        self.claimed.insert(found.id);
        Some(found)
    }
}

pub struct Resolver<'a> {
    store: &'a IdentityStore,
}

impl<'a> Resolver<'a> {
    pub fn new(store: &'a IdentityStore) -> Self {
        Self { store }
    }

    pub fn match_by_transient_ref(&self, transient_ref: ResourceRef) -> Option<TrackedEntry> {
        self.store.find_oldest(|e| e.transient_ref == transient_ref)
    }

    /// Strict match on locator, window and position. The oldest entry wins
    /// if several share a fingerprint.
    pub fn match_by_fingerprint(&self, candidate: &Fingerprint) -> Option<TrackedEntry> {
        self.store.find_oldest(|e| e.fingerprint.matches_strict(candidate))
    }

    /// Point an entry at its resource's current ref, and at its new locator
    /// if it navigated. `created_at` is never touched.
    pub fn repair(&self, id: EntryId, resolution: Resolution) -> Result<TrackedEntry> {
        self.store.update(id, |entry| {
            if entry.transient_ref != resolution.transient_ref {
                debug!(entry = %entry.id, from = %entry.transient_ref, to = %resolution.transient_ref, "Transient ref repaired");
                entry.transient_ref = resolution.transient_ref;
            }
            if entry.fingerprint.locator != resolution.locator {
                debug!(entry = %entry.id, "Locator updated");
                entry.fingerprint.locator = resolution.locator;
            }
        })
    }

    /// Find the live resource behind `entry`, repairing a stale ref on the way.
    pub fn resolve<'r>(&self, entry: &TrackedEntry, live: &mut LiveIndex<'r>) -> Result<&'r Resource> {
        match fast_path(entry, live) {
            Err(Error::StaleReference(stale)) => {
                let resource = live
                    .claim_by_fingerprint(&entry.fingerprint)
                    .ok_or_else(|| Error::not_found("resource", stale))?;
                self.repair(entry.id, Resolution::from(resource))?;
                Ok(resource)
            }
            other => other,
        }
    }
}

/// A ref the host reassigned to some other resource counts as stale.
fn fast_path<'r>(entry: &TrackedEntry, live: &LiveIndex<'r>) -> Result<&'r Resource> {
    live.get(entry.transient_ref)
        .filter(|r| agrees(entry, r))
        .ok_or(Error::StaleReference(entry.transient_ref))
}

fn agrees(entry: &TrackedEntry, resource: &Resource) -> bool {
    entry.fingerprint.matches_place(&resource.fingerprint())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;
    use tabage_core::WindowId;

    fn resource(id: i64, locator: &str, window: i64, index: u32) -> Resource {
        Resource {
            id: ResourceRef(id),
            locator: locator.into(),
            window: WindowId(window),
            index,
            pinned: false,
            container: None,
        }
    }

    fn store() -> IdentityStore {
        IdentityStore::new(Arc::new(MemoryStore::new()), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn stale_ref_repaired_by_exact_fingerprint() {
        let store = store();
        let created = Utc::now() - chrono::Duration::days(9);
        let entry = store.insert(&resource(5, "https://a/", 1, 2), created);

        let live = vec![resource(105, "https://a/", 1, 2)];
        let mut index = LiveIndex::new(&live, &store.all());
        let found = store.resolver().resolve(&entry, &mut index).unwrap();
        assert_eq!(found.id, ResourceRef(105));

        let repaired = store.get(entry.id).unwrap();
        assert_eq!(repaired.transient_ref, ResourceRef(105));
        assert_eq!(repaired.created_at, created);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn partial_fingerprint_is_not_enough() {
        let store = store();
        let entry = store.insert(&resource(5, "https://a/", 1, 2), Utc::now());

        // Same locator and window, different position.
        let live = vec![resource(105, "https://a/", 1, 3)];
        let mut index = LiveIndex::new(&live, &store.all());
        let err = store.resolver().resolve(&entry, &mut index).unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(store.get(entry.id).unwrap().transient_ref, ResourceRef(5));
    }

    #[tokio::test]
    async fn resource_held_by_another_entry_is_not_stolen() {
        let store = store();
        // Entry A is stale, entry B holds ref 7 directly. Both fingerprints
        // point at the same place.
        let a = store.insert(&resource(1, "https://a/", 1, 0), Utc::now());
        store.insert(&resource(7, "https://a/", 1, 0), Utc::now());

        let live = vec![resource(7, "https://a/", 1, 0)];
        let mut index = LiveIndex::new(&live, &store.all());
        assert!(store.resolver().resolve(&a, &mut index).is_err());
    }

    #[tokio::test]
    async fn reused_ref_pointing_elsewhere_is_stale() {
        let store = store();
        // Stored under ref 2, but after a restart ref 2 is a different tab.
        let entry = store.insert(&resource(2, "https://x/", 1, 0), Utc::now());

        let live = vec![resource(1, "https://x/", 1, 0), resource(2, "https://y/", 1, 1)];
        let mut index = LiveIndex::new(&live, &store.all());
        let found = store.resolver().resolve(&entry, &mut index).unwrap();
        assert_eq!(found.id, ResourceRef(1));
        assert_eq!(store.get(entry.id).unwrap().transient_ref, ResourceRef(1));
    }

    #[tokio::test]
    async fn fast_path_survives_a_position_shift() {
        let store = store();
        let entry = store.insert(&resource(3, "https://x/", 1, 0), Utc::now());

        let live = vec![resource(3, "https://x/", 1, 4)];
        let mut index = LiveIndex::new(&live, &store.all());
        let found = store.resolver().resolve(&entry, &mut index).unwrap();
        assert_eq!(found.id, ResourceRef(3));
    }

    #[tokio::test]
    async fn a_live_resource_backs_only_one_stale_entry() {
        let store = store();
        let a = store.insert(&resource(1, "https://a/", 1, 0), Utc::now());
        let b = store.insert(&resource(2, "https://a/", 1, 0), Utc::now());

        let live = vec![resource(50, "https://a/", 1, 0)];
        let mut index = LiveIndex::new(&live, &store.all());
        let resolver = store.resolver();
        assert!(resolver.resolve(&a, &mut index).is_ok());
        assert!(resolver.resolve(&b, &mut index).is_err());
    }

    #[tokio::test]
    async fn repair_updates_locator_on_navigation() {
        let store = store();
        let entry = store.insert(&resource(1, "https://a/", 1, 0), Utc::now());
        let repaired = store
            .resolver()
            .repair(
                entry.id,
                Resolution {
                    transient_ref: ResourceRef(1),
                    locator: "https://a/next".into(),
                },
            )
            .unwrap();
        assert_eq!(repaired.fingerprint.locator, "https://a/next");
        assert_eq!(repaired.fingerprint.position, 0);
        assert_eq!(repaired.created_at, entry.created_at);
    }

    #[tokio::test]
    async fn repair_of_missing_entry_is_not_found() {
        let store = store();
        let err = store
            .resolver()
            .repair(
                EntryId::generate(),
                Resolution {
                    transient_ref: ResourceRef(1),
                    locator: String::new(),
                },
            )
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
