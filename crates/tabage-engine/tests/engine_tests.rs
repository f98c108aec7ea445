//! Tests for tabage-engine: reconciliation against the in-memory host, orphan
//! sweeps, container seeding, and restarts through the file store

use chrono::{Local, Utc};
use std::sync::Arc;
use std::time::Duration;
use tabage_core::*;
use tabage_engine::{
    keys, ContainerAction, EngineConfig, FileStore, HostOp, IdentityStore, ManualClock,
    MemoryHost, MemoryStore, Orchestrator, ReconcileReport, Reconciler,
};

struct Env {
    host: Arc<MemoryHost>,
    bundle: Host,
    store: IdentityStore,
}

fn env() -> Env {
    let host = Arc::new(MemoryHost::new());
    let kv = Arc::new(MemoryStore::new());
    let bundle = host.host(kv.clone(), Arc::new(ManualClock::new(Local::now())));
    let store = IdentityStore::new(kv, Duration::from_secs(5));
    Env {
        host,
        bundle,
        store,
    }
}

fn days_ago(days: i64) -> chrono::DateTime<Utc> {
    Utc::now() - chrono::Duration::days(days)
}

fn defaults() -> Vec<BucketDefinition> {
    EngineConfig::default().buckets
}

const W: WindowId = WindowId(1);

// ===========================================================================
// Reconciliation
// ===========================================================================

#[tokio::test]
async fn existing_older_container_gets_exactly_one_move() {
    let env = env();
    let other = env.host.open("https://archive/", W);
    env.host.add_container(ContainerId(7), "Older", &[other.id]);
    let a = env.host.open("https://a/", W);
    env.store.insert(&a, days_ago(30));

    env.host.clear_ops();
    let report = Reconciler::new(&env.bundle)
        .run(&env.store, &defaults(), &Local::now())
        .await
        .unwrap();

    assert_eq!(
        env.host.container_mutations(),
        vec![HostOp::AddMembers {
            container: ContainerId(7),
            members: vec![a.id],
        }]
    );
    assert!(report.created.is_empty());
    assert_eq!(report.moved, 1);
}

#[tokio::test]
async fn second_pass_issues_no_container_mutations() {
    let env = env();
    for (i, age) in [0, 1, 20, 20].into_iter().enumerate() {
        let r = env.host.open(&format!("https://{i}/"), W);
        env.store.insert(&r, days_ago(age));
    }
    let reconciler = Reconciler::new(&env.bundle);

    let first = reconciler.run(&env.store, &defaults(), &Local::now()).await.unwrap();
    assert_eq!(first.created, vec!["Today", "Yesterday", "Older"]);
    assert_eq!(first.moved, 4);
    let older = env.host.container_titled("Older").unwrap();
    assert_eq!(env.host.members_of(older.id).len(), 2);

    env.host.clear_ops();
    let second = reconciler.run(&env.store, &defaults(), &Local::now()).await.unwrap();
    assert!(second.is_noop());
    assert!(env.host.container_mutations().is_empty());
}

#[tokio::test]
async fn one_failing_bucket_does_not_stop_the_rest() {
    let env = env();
    let x = env.host.open("https://x/", W);
    let y = env.host.open("https://y/", W);
    env.host.add_container(ContainerId(1), "Today", &[x.id]);
    env.host.add_container(ContainerId(2), "Older", &[y.id]);
    let a = env.host.open("https://a/", W);
    let b = env.host.open("https://b/", W);
    env.store.insert(&a, days_ago(0));
    env.store.insert(&b, days_ago(30));

    env.host.fail_next("containers.add");
    let report = Reconciler::new(&env.bundle)
        .run(&env.store, &defaults(), &Local::now())
        .await
        .unwrap();

    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].starts_with("Today"));
    assert_eq!(report.moved, 1);
    assert_eq!(env.host.resource(b.id).unwrap().container, Some(ContainerId(2)));
    assert_eq!(env.host.resource(a.id).unwrap().container, None);
}

#[tokio::test]
async fn create_reuses_container_that_appeared_after_planning() {
    let env = env();
    let other = env.host.open("https://archive/", W);
    env.host.add_container(ContainerId(7), "Older", &[other.id]);
    let a = env.host.open("https://a/", W);

    env.host.clear_ops();
    let mut report = ReconcileReport::default();
    Reconciler::new(&env.bundle)
        .apply(
            &[ContainerAction::Create {
                title: "Older".into(),
                members: vec![a.id],
            }],
            &mut report,
        )
        .await;

    assert!(report.created.is_empty());
    assert!(report.failures.is_empty());
    assert_eq!(
        env.host.container_mutations(),
        vec![HostOp::AddMembers {
            container: ContainerId(7),
            members: vec![a.id],
        }]
    );
}

#[tokio::test]
async fn stale_refs_are_repaired_after_host_restart() {
    let env = env();
    let created = days_ago(9);
    let a = env.host.open("https://a/", W);
    let b = env.host.open("https://b/", W);
    let entry_a = env.store.insert(&a, created);
    env.store.insert(&b, created);

    let pairs = env.host.reassign_ids();
    let report = Reconciler::new(&env.bundle)
        .run(&env.store, &defaults(), &Local::now())
        .await
        .unwrap();

    assert_eq!(report.unresolved, 0);
    assert_eq!(env.store.len(), 2);
    let repaired = env.store.get(entry_a.id).unwrap();
    let new_a = pairs.iter().find(|(old, _)| *old == a.id).unwrap().1;
    assert_eq!(repaired.transient_ref, new_a);
    assert_eq!(repaired.created_at, created);
    let last_week = env.host.container_titled("Last Week").unwrap();
    assert_eq!(env.host.members_of(last_week.id).len(), 2);
}

#[tokio::test]
async fn pinned_and_too_young_resources_stay_unbucketed() {
    let env = env();
    let pinned = env.host.open_pinned("https://mail/", W);
    let young = env.host.open("https://a/", W);
    env.store.insert(&pinned, days_ago(30));
    env.store.insert(&young, days_ago(0));

    let report = Reconciler::new(&env.bundle)
        .run(&env.store, &[BucketDefinition::new("Stale", 3)], &Local::now())
        .await
        .unwrap();

    assert_eq!(report.unbucketed, 2);
    assert!(report.is_noop());
    assert!(env.host.container_mutations().is_empty());
}

// ===========================================================================
// Orphan sweep
// ===========================================================================

#[tokio::test]
async fn sweep_keeps_repairs_and_removes() {
    let env = env();
    let kept = env.host.open("https://kept/", W);
    let moved = env.host.open("https://moved/", W);
    let gone = env.host.open("https://gone/", W);
    env.store.insert(&kept, days_ago(1));
    let stale = Resource {
        id: ResourceRef(99),
        ..moved.clone()
    };
    let stale_entry = env.store.insert(&stale, days_ago(2));
    env.store.insert(&gone, days_ago(3));
    env.host.close(gone.id);

    let report = Reconciler::new(&env.bundle)
        .sweep_orphans(&env.store)
        .await
        .unwrap();

    assert_eq!(report.kept, 1);
    assert_eq!(report.repaired, 1);
    assert_eq!(report.removed, 1);
    assert_eq!(env.store.len(), 2);
    assert_eq!(env.store.get(stale_entry.id).unwrap().transient_ref, moved.id);
}

#[tokio::test]
async fn sweep_after_restart_with_reused_ids_keeps_ages_with_their_tabs() {
    let env = env();
    let x = env.host.open("https://x/", W);
    let y = env.host.open("https://y/", W);
    // Before the restart x was known under the id y has now, and y under an
    // id the host has not handed out again.
    let old_x = env.store.insert(&Resource { id: y.id, ..x.clone() }, days_ago(30));
    let old_y = env.store.insert(&Resource { id: ResourceRef(99), ..y.clone() }, days_ago(1));

    let report = Reconciler::new(&env.bundle)
        .sweep_orphans(&env.store)
        .await
        .unwrap();

    assert_eq!(report.kept, 0);
    assert_eq!(report.repaired, 2);
    assert_eq!(report.removed, 0);
    assert_eq!(env.store.get(old_x.id).unwrap().transient_ref, x.id);
    assert_eq!(env.store.get(old_y.id).unwrap().transient_ref, y.id);
    assert_eq!(env.store.get(old_x.id).unwrap().created_at, old_x.created_at);
}

#[tokio::test]
async fn sweep_with_listing_failure_changes_nothing() {
    let env = env();
    let a = env.host.open("https://a/", W);
    env.store.insert(&a, days_ago(1));
    env.host.fail_next("resources.list");
    assert!(Reconciler::new(&env.bundle)
        .sweep_orphans(&env.store)
        .await
        .is_err());
    assert_eq!(env.store.len(), 1);
}

// ===========================================================================
// Container seeding
// ===========================================================================

#[tokio::test]
async fn ensure_containers_creates_only_missing_buckets() {
    let env = env();
    let a = env.host.open("https://a/", W);
    env.host.add_container(ContainerId(1), "Today", &[a.id]);

    let reconciler = Reconciler::new(&env.bundle);
    let created = reconciler.ensure_containers(&defaults()).await.unwrap();
    assert_eq!(created, vec!["Yesterday", "Last Week", "Older"]);
    for title in &created {
        let container = env.host.container_titled(title).unwrap();
        assert!(container.collapsed);
        assert_eq!(env.host.members_of(container.id).len(), 1);
    }

    assert!(reconciler.ensure_containers(&defaults()).await.unwrap().is_empty());
}

#[tokio::test]
async fn seeded_containers_open_beside_existing_ones() {
    let env = env();
    env.host.open("https://first/", W);
    let other = env.host.open("https://a/", WindowId(2));
    env.host.add_container(ContainerId(1), "Today", &[other.id]);

    Reconciler::new(&env.bundle)
        .ensure_containers(&[BucketDefinition::new("Today", 0), BucketDefinition::new("Older", 7)])
        .await
        .unwrap();
    assert_eq!(env.host.container_titled("Older").unwrap().window, WindowId(2));
}

#[tokio::test]
async fn ensure_containers_can_leave_them_expanded() {
    let env = env();
    Reconciler::new(&env.bundle)
        .collapse_new_containers(false)
        .ensure_containers(&[BucketDefinition::new("Today", 0), BucketDefinition::new("", 5)])
        .await
        .unwrap();
    assert_eq!(env.host.containers().len(), 1);
    assert!(!env.host.container_titled("Today").unwrap().collapsed);
}

// ===========================================================================
// Restart through the file store
// ===========================================================================

#[tokio::test]
async fn entries_survive_restart_with_new_refs() {
    let dir = tempfile::tempdir().unwrap();
    let host = Arc::new(MemoryHost::new());
    let a = host.open("https://a/", W);
    let b = host.open("https://b/", W);
    let config = EngineConfig::default();

    let first_created = {
        let storage = Arc::new(FileStore::in_dir(dir.path()));
        let bundle = host.host(storage.clone(), Arc::new(SystemClock));
        let store = IdentityStore::new(storage, config.debounce());
        let mut orch = Orchestrator::new(bundle, store, config.clone());
        orch.handle(HostEvent::Installed).await.unwrap();
        orch.handle(HostEvent::Suspending).await.unwrap();
        let entry = orch.store().resolver().match_by_transient_ref(a.id).unwrap();
        entry.created_at
    };
    assert!(dir.path().join("state.json").exists());

    host.reassign_ids();
    let storage = Arc::new(FileStore::in_dir(dir.path()));
    let bundle = host.host(storage.clone(), Arc::new(SystemClock));
    let store = IdentityStore::new(storage.clone(), config.debounce());
    let mut orch = Orchestrator::new(bundle, store, config);
    orch.handle(HostEvent::Started).await.unwrap();

    assert_eq!(orch.store().len(), 2);
    // Persisted at millisecond precision.
    assert!(orch
        .store()
        .all()
        .iter()
        .all(|e| e.created_at.timestamp_millis() == first_created.timestamp_millis()));
    assert!(orch
        .store()
        .resolver()
        .match_by_transient_ref(b.id)
        .is_none());
    assert!(storage.get(keys::BUCKETS).await.unwrap().is_none());
}
