//! Lifecycle orchestrator
//!
//! Consumes the host's event stream in order and drives the engine through
//! `Uninitialized → Loading → Ready`. Resource creations that arrive before
//! persisted state is loaded are held back and replayed once it is, so a
//! resource already known from storage never gets a second entry.

use crate::classify::{calendar_days_between, classify, elapsed_days};
use crate::config::EngineConfig;
use crate::reconcile::{ReconcileReport, Reconciler};
use crate::resolver::Resolution;
use crate::schedule::{delay_until_next, next_occurrence};
use crate::settings::Settings;
use crate::store::{IdentityStore, LegacyRecord};
use chrono::Utc;
use futures::future::join_all;
use std::collections::VecDeque;
use tabage_core::{
    ActivationReason, Error, Host, HostEvent, LifecycleState, Request, Resource, ResourceFilter,
    ResourceRef, Result,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub struct Orchestrator {
    host: Host,
    store: IdentityStore,
    config: EngineConfig,
    settings: Settings,
    state: LifecycleState,
    /// Creations observed before `Ready`, in arrival order.
    deferred: VecDeque<Resource>,
    /// Reason of the last activation attempt, reused when retrying.
    last_reason: Option<ActivationReason>,
}

impl Orchestrator {
    pub fn new(host: Host, store: IdentityStore, config: EngineConfig) -> Self {
        let settings = Settings::defaults(&config);
        Self {
            host,
            store,
            config,
            settings,
            state: LifecycleState::Uninitialized,
            deferred: VecDeque::new(),
            last_reason: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn store(&self) -> &IdentityStore {
        &self.store
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Process events until the sender side closes, then flush.
    pub async fn run(&mut self, mut events: mpsc::Receiver<HostEvent>) {
        info!("Orchestrator started");
        while let Some(event) = events.recv().await {
            let kind = event.kind();
            if let Err(e) = self.handle(event).await {
                warn!(event = kind, "Event handling failed: {}", e);
            }
        }
        info!("Event stream closed, shutting down");
        if let Err(e) = self.store.shutdown().await {
            error!("Final entry flush failed: {}", e);
        }
        info!("Orchestrator stopped");
    }

    pub async fn handle(&mut self, event: HostEvent) -> Result<()> {
        debug!(event = event.kind(), state = %self.state, "Handling event");
        match event {
            HostEvent::Installed => self.activate(ActivationReason::Install).await,
            HostEvent::Started => self.activate(ActivationReason::Startup).await,
            HostEvent::Suspending => {
                info!("Host suspending, flushing entries");
                self.store.flush_now().await
            }
            event @ (HostEvent::ResourceCreated { .. }
            | HostEvent::ResourceRemoved { .. }
            | HostEvent::ResourceUpdated { .. })
                if self.state != LifecycleState::Ready =>
            {
                self.defer(event);
                Ok(())
            }
            HostEvent::ResourceCreated { resource } => self.on_created(resource).await,
            HostEvent::ResourceRemoved { id } => {
                if let Some(entry) = self.store.forget_by_ref(id) {
                    debug!(entry = %entry.id, resource = %id, "Entry forgotten");
                }
                Ok(())
            }
            HostEvent::ResourceUpdated { resource, complete } => {
                self.on_updated(&resource, complete);
                Ok(())
            }
            HostEvent::AlarmFired { name } => {
                self.ensure_ready().await?;
                self.on_alarm(&name).await
            }
            HostEvent::Message { request } => {
                self.ensure_ready().await?;
                self.on_message(request).await
            }
        }
    }

    // ------------------------------------------------------------------
    // Activation
    // ------------------------------------------------------------------

    pub async fn activate(&mut self, reason: ActivationReason) -> Result<()> {
        if self.state == LifecycleState::Ready {
            debug!(reason = %reason, "Already ready, activation skipped");
            return Ok(());
        }
        self.last_reason = Some(reason);
        self.state = LifecycleState::Loading;
        info!(reason = %reason, "Activating");

        if let Err(e) = self.load(reason).await {
            self.state = LifecycleState::Uninitialized;
            error!(reason = %reason, "Activation failed: {}", e);
            return Err(e);
        }

        self.state = LifecycleState::Ready;
        info!(entries = self.store.len(), "Engine ready");
        self.replay_deferred().await;
        Ok(())
    }

    /// Storage failures abort; host failures are logged and the step skipped.
    async fn load(&mut self, reason: ActivationReason) -> Result<()> {
        self.settings = Settings::load(self.host.storage.as_ref(), &self.config).await?;
        for problem in &self.settings.problems {
            warn!("Settings problem: {}", problem);
        }

        let outcome = self.store.load().await?;
        if !outcome.legacy.is_empty() {
            self.import_legacy(&outcome.legacy).await;
        }
        if reason == ActivationReason::Install && outcome.loaded == 0 {
            if let Err(e) = self.seed().await {
                warn!("Seeding open resources failed: {}", e);
            }
        }

        if let Err(e) = self.reconciler().sweep_orphans(&self.store).await {
            warn!("Orphan sweep failed: {}", e);
        }
        if let Err(e) = self.schedule_next().await {
            warn!("Scheduling daily pass failed: {}", e);
        }
        if reason == ActivationReason::Install && self.config.sorting.ensure_containers_on_install {
            if let Err(e) = self.reconciler().ensure_containers(&self.settings.buckets).await {
                warn!("Creating bucket containers failed: {}", e);
            }
        }
        if self.settings.sort_on_startup {
            if let Err(e) = self.reconcile().await {
                warn!("Startup sort failed: {}", e);
            }
        }
        Ok(())
    }

    /// Resource events seen before `Ready` only touch the deferred queue.
    fn defer(&mut self, event: HostEvent) {
        match event {
            HostEvent::ResourceCreated { resource } => {
                debug!(resource = %resource.id, state = %self.state, "Creation deferred");
                self.deferred.push_back(resource);
            }
            HostEvent::ResourceRemoved { id } => self.deferred.retain(|r| r.id != id),
            HostEvent::ResourceUpdated { resource, .. } => {
                if let Some(pending) = self.deferred.iter_mut().find(|r| r.id == resource.id) {
                    *pending = resource;
                }
            }
            _ => {}
        }
    }

    /// Retry a failed activation; never-activated engines stay not ready.
    async fn ensure_ready(&mut self) -> Result<()> {
        if self.state == LifecycleState::Ready {
            return Ok(());
        }
        match self.last_reason {
            Some(reason) => {
                info!(reason = %reason, "Retrying activation");
                self.activate(reason).await
            }
            None => Err(Error::NotReady(self.state)),
        }
    }

    /// First install: every open unpinned resource starts its clock now.
    async fn seed(&self) -> Result<()> {
        let open = self.host.resources.list(ResourceFilter::unpinned()).await?;
        let now = self.host.clock.now().with_timezone(&Utc);
        let resolver = self.store.resolver();
        let mut seeded = 0;
        for resource in &open {
            if resolver.match_by_transient_ref(resource.id).is_none() {
                self.store.insert(resource, now);
                seeded += 1;
            }
        }
        info!(seeded, "Seeded open resources");
        Ok(())
    }

    async fn import_legacy(&self, records: &[LegacyRecord]) {
        let lookups = records
            .iter()
            .map(|r| self.host.resources.get(r.transient_ref));
        let results = join_all(lookups).await;

        let mut imported = 0;
        for (record, result) in records.iter().zip(results) {
            match result {
                Ok(resource) => {
                    if self.store.resolver().match_by_transient_ref(resource.id).is_none() {
                        self.store.insert(&resource, record.created_at);
                        imported += 1;
                    }
                }
                Err(e) if e.is_not_found() => {
                    debug!(resource = %record.transient_ref, "Legacy record has no live resource");
                }
                Err(e) => warn!(resource = %record.transient_ref, "Legacy lookup failed: {}", e),
            }
        }
        info!(imported, total = records.len(), "Legacy entries imported");
    }

    /// Re-fetch each deferred resource and record the ones still alive.
    async fn replay_deferred(&mut self) {
        if self.deferred.is_empty() {
            return;
        }
        let pending: Vec<Resource> = self.deferred.drain(..).collect();
        info!(count = pending.len(), "Replaying deferred creations");
        let lookups = pending.iter().map(|r| self.host.resources.get(r.id));
        let results = join_all(lookups).await;

        for (resource, result) in pending.iter().zip(results) {
            match result {
                Ok(live) => {
                    if let Err(e) = self.on_created(live).await {
                        warn!(resource = %resource.id, "Deferred creation failed: {}", e);
                    }
                }
                Err(e) if e.is_not_found() => {
                    debug!(resource = %resource.id, "Deferred resource already gone");
                }
                Err(e) => warn!(resource = %resource.id, "Deferred lookup failed: {}", e),
            }
        }
    }

    // ------------------------------------------------------------------
    // Ready-state events
    // ------------------------------------------------------------------

    async fn on_created(&self, resource: Resource) -> Result<()> {
        let now = self.host.clock.now().with_timezone(&Utc);
        let holder = self
            .store
            .resolver()
            .match_by_fingerprint(&resource.fingerprint())
            .map(|e| e.transient_ref)
            .filter(|r| *r != resource.id);

        // An entry whose fingerprint matches but whose resource is still open
        // describes a different resource that has since moved.
        if let Some(holder) = holder {
            if self.is_live(holder).await {
                match self.store.resolver().match_by_transient_ref(resource.id) {
                    Some(same) if same.fingerprint.matches_place(&resource.fingerprint()) => {}
                    stale => {
                        if let Some(stale) = stale {
                            self.store.forget(stale.id);
                        }
                        self.store.insert(&resource, now);
                    }
                }
                return Ok(());
            }
        }
        self.store.record(&resource, now);
        Ok(())
    }

    async fn is_live(&self, id: ResourceRef) -> bool {
        match self.host.resources.get(id).await {
            Ok(_) => true,
            Err(e) if e.is_not_found() => false,
            Err(e) => {
                warn!(resource = %id, "Liveness check failed, assuming gone: {}", e);
                false
            }
        }
    }

    fn on_updated(&self, resource: &Resource, complete: bool) {
        if !complete {
            return;
        }
        let resolver = self.store.resolver();
        let Some(entry) = resolver.match_by_transient_ref(resource.id) else {
            return;
        };
        if entry.fingerprint.locator == resource.locator {
            return;
        }
        if let Err(e) = resolver.repair(entry.id, Resolution::from(resource)) {
            debug!(entry = %entry.id, "Locator repair skipped: {}", e);
        }
    }

    async fn on_alarm(&self, name: &str) -> Result<()> {
        if name != self.config.schedule.alarm_name {
            debug!(alarm = name, "Ignoring unknown alarm");
            return Ok(());
        }
        info!(alarm = name, "Daily pass");
        let pass = self.sort_pass().await;
        self.schedule_next().await?;
        pass.map(|_| ())
    }

    async fn on_message(&mut self, request: Request) -> Result<()> {
        match request {
            Request::SettingsChanged => {
                self.settings = Settings::load(self.host.storage.as_ref(), &self.config).await?;
                for problem in &self.settings.problems {
                    warn!("Settings problem: {}", problem);
                }
                info!(
                    buckets = self.settings.buckets.len(),
                    schedule = %self.settings.schedule,
                    "Settings reloaded"
                );
                self.schedule_next().await?;
                self.reconciler()
                    .ensure_containers(&self.settings.buckets)
                    .await?;
                Ok(())
            }
            Request::SortNow => self.sort_pass().await.map(|_| ()),
            Request::Dump => {
                self.dump();
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Passes
    // ------------------------------------------------------------------

    fn reconciler(&self) -> Reconciler<'_> {
        Reconciler::new(&self.host).collapse_new_containers(self.config.sorting.collapse_new_containers)
    }

    async fn reconcile(&self) -> Result<ReconcileReport> {
        let now = self.host.clock.now();
        self.reconciler()
            .run(&self.store, &self.settings.buckets, &now)
            .await
    }

    /// Orphan sweep followed by reconciliation.
    pub async fn sort_pass(&self) -> Result<ReconcileReport> {
        if self.state != LifecycleState::Ready {
            return Err(Error::NotReady(self.state));
        }
        self.reconciler().sweep_orphans(&self.store).await?;
        self.reconcile().await
    }

    async fn schedule_next(&self) -> Result<()> {
        let now = self.host.clock.now();
        let at = self.settings.schedule;
        let delay = delay_until_next(&now, at);
        self.host
            .timers
            .schedule(&self.config.schedule.alarm_name, delay)
            .await?;
        info!(next = %next_occurrence(&now, at).format("%Y-%m-%d %H:%M"), "Daily pass scheduled");
        Ok(())
    }

    fn dump(&self) {
        let now = self.host.clock.now();
        let entries = self.store.all();
        info!(count = entries.len(), "Tracked entries");
        for entry in entries {
            let bucket = classify(entry.created_at, &now, &self.settings.buckets)
                .map(|b| b.name.as_str())
                .unwrap_or("-");
            info!(
                entry = %entry.id,
                resource = %entry.transient_ref,
                locator = %entry.fingerprint.locator,
                age_days = calendar_days_between(entry.created_at, &now),
                elapsed_days = elapsed_days(entry.created_at, &now),
                bucket,
                "Entry"
            );
        }
    }
}
