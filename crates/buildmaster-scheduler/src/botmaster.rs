//! The master: owns builders, workers, slots and locks, and turns admitted
//! build requests into running builds.
//!
//! Admission itself is driven by the [`BuildRequestDistributor`]; the
//! [`BotMaster`] is its [`BuildStarter`]. Everything that changes slot or
//! lock state happens under one short-lived guard that is never held across
//! an await, so a check and the action based on it cannot interleave with
//! another task.

use async_trait::async_trait;
use buildmaster_config::{MasterConfig, PrioritizerKind};
use buildmaster_core::{
    BuildId, BuildRequest, BuildRequestId, BuildResult, Error, LockAccessSpec, MasterId,
};
use buildmaster_db::Database;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::builder::Builder;
use crate::distributor::{
    AttemptOutcome, BuildRequestDistributor, BuildStarter, DefaultPrioritizer, Prioritizer,
    UnsortedPrioritizer,
};
use crate::events::BuildRequestEvent;
use crate::lock::{LockRegistry, ResolvedAccess};
use crate::worker::{LatentController, Worker, WorkerConnection};
use crate::worker_slot::{SlotId, SlotState, SlotTable, WorkerSlot};
use crate::{SchedulerError, SchedulerResult};

/// Executes a dispatched build. Implemented by the build layer.
#[async_trait]
pub trait BuildRunner: Send + Sync {
    async fn run_build(&self, build: &BuildContext) -> SchedulerResult<BuildResult>;
}

/// What a running build knows about itself.
pub struct BuildContext {
    pub build_id: BuildId,
    pub builder_name: String,
    pub worker_name: String,
    pub requests: Vec<BuildRequest>,
    pub connection: Arc<dyn WorkerConnection>,
    state: Arc<Mutex<MasterState>>,
    /// Locks taken with [`Self::acquire_lock`] and not yet released.
    held: Mutex<Vec<ResolvedAccess>>,
}

impl BuildContext {
    /// Take a lock for part of the build, waiting in line if it is busy.
    /// Locks still held when the build ends are released then.
    pub async fn acquire_lock(&self, spec: &LockAccessSpec) -> SchedulerResult<()> {
        let access = {
            let state = lock(&self.state);
            state
                .locks
                .resolve(std::slice::from_ref(spec), &self.worker_name)?
                .pop()
                .ok_or_else(|| SchedulerError::UnknownLock(spec.lock_name.clone()))?
        };

        loop {
            let wait = {
                let mut state = lock(&self.state);
                if state.locks.holds(self.build_id, &access) {
                    // Already held since admission.
                    return Ok(());
                }
                if state
                    .locks
                    .try_claim_all(self.build_id, std::slice::from_ref(&access))
                {
                    break;
                }
                state
                    .locks
                    .wait_until_maybe_available(self.build_id, &access)?
            };
            debug!(build = %self.build_id, lock = %access.lock_name, "Waiting for lock");
            let mut guard = WaitGuard {
                state: &self.state,
                owner: self.build_id,
                access: &access,
                waiting: true,
            };
            wait.await;
            guard.waiting = false;
        }

        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(access);
        Ok(())
    }

    /// Give back a lock taken with [`Self::acquire_lock`].
    pub fn release_lock(&self, spec: &LockAccessSpec) {
        let access = {
            let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
            let Some(index) = held.iter().position(|a| a.lock_name == spec.lock_name) else {
                return;
            };
            held.remove(index)
        };
        lock(&self.state).locks.release(self.build_id, &access);
    }

    fn take_held_locks(&self) -> Vec<ResolvedAccess> {
        std::mem::take(&mut *self.held.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// Leaves the lock queue if a wait is abandoned before it resolves.
struct WaitGuard<'a> {
    state: &'a Mutex<MasterState>,
    owner: BuildId,
    access: &'a ResolvedAccess,
    waiting: bool,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        if self.waiting {
            lock(self.state)
                .locks
                .stop_waiting_until_available(self.owner, self.access);
        }
    }
}

/// A build between dispatch and completion.
#[derive(Debug, Clone)]
struct RunningBuild {
    builder_name: String,
    worker_name: String,
    slot: SlotId,
    request_ids: Vec<BuildRequestId>,
    locks: Vec<ResolvedAccess>,
}

/// An admission decision waiting for its database claim.
struct BuildPlan {
    builder_name: String,
    worker_name: String,
    slot: SlotId,
    requests: Vec<BuildRequest>,
    locks: Vec<ResolvedAccess>,
}

impl BuildPlan {
    fn request_ids(&self) -> Vec<BuildRequestId> {
        self.requests.iter().map(|br| br.id).collect()
    }
}

struct MasterState {
    builders: BTreeMap<String, Builder>,
    workers: HashMap<String, Worker>,
    slots: SlotTable,
    locks: LockRegistry,
    builds: HashMap<BuildId, RunningBuild>,
}

impl MasterState {
    fn new(config: &MasterConfig) -> Self {
        let mut state = Self {
            builders: BTreeMap::new(),
            workers: config
                .workers
                .iter()
                .map(|w| (w.name.clone(), Worker::new(w.clone())))
                .collect(),
            slots: SlotTable::default(),
            locks: LockRegistry::new(&config.locks),
            builds: HashMap::new(),
        };
        for builder in &config.builders {
            state
                .builders
                .insert(builder.name.clone(), Builder::new(builder.clone()));
        }
        state.create_latent_slots();
        state
    }

    /// Latent slots exist from the start; concrete ones appear on attach.
    fn create_latent_slots(&mut self) {
        for builder in self.builders.values() {
            for worker_name in &builder.config.workers {
                let latent = self.workers.get(worker_name).is_some_and(Worker::is_latent);
                if latent && self.slots.find(builder.name(), worker_name).is_none() {
                    self.slots.insert(builder.name(), worker_name, true);
                }
            }
        }
    }

    fn builders_serving(&self, worker_name: &str) -> Vec<String> {
        self.builders
            .values()
            .filter(|b| b.config.workers.iter().any(|w| w == worker_name))
            .map(|b| b.name().to_string())
            .collect()
    }

    fn builders_using_lock(&self, lock_name: &str) -> Vec<String> {
        self.builders
            .values()
            .filter(|b| b.config.all_lock_accesses().any(|a| a.lock_name == lock_name))
            .map(|b| b.name().to_string())
            .collect()
    }
}

fn lock(state: &Mutex<MasterState>) -> MutexGuard<'_, MasterState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

struct MasterInner {
    master_id: MasterId,
    db: Database,
    state: Arc<Mutex<MasterState>>,
    distributor: BuildRequestDistributor,
    runner: Arc<dyn BuildRunner>,
    latent: Option<Arc<dyn LatentController>>,
    events_tx: mpsc::UnboundedSender<BuildRequestEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<BuildRequestEvent>>>,
    running_builds: watch::Sender<usize>,
    shutting_down: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    this: Weak<MasterInner>,
}

/// Cheap to clone; clones control the same master.
#[derive(Clone)]
pub struct BotMaster {
    inner: Arc<MasterInner>,
}

pub struct BotMasterBuilder {
    config: MasterConfig,
    db: Database,
    runner: Arc<dyn BuildRunner>,
    latent: Option<Arc<dyn LatentController>>,
    prioritizer: Option<Arc<dyn Prioritizer>>,
}

impl BotMasterBuilder {
    pub fn latent_controller(mut self, controller: Arc<dyn LatentController>) -> Self {
        self.latent = Some(controller);
        self
    }

    /// Replace the prioritizer named in the configuration.
    pub fn prioritizer(mut self, prioritizer: Arc<dyn Prioritizer>) -> Self {
        self.prioritizer = Some(prioritizer);
        self
    }

    pub fn build(self) -> BotMaster {
        let prioritizer = self
            .prioritizer
            .unwrap_or_else(|| prioritizer_for(self.config.prioritizer));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (running_builds, _) = watch::channel(0);
        let (shutting_down, _) = watch::channel(false);
        let state = Arc::new(Mutex::new(MasterState::new(&self.config)));
        let db = self.db;

        let inner = Arc::new_cyclic(|this: &Weak<MasterInner>| {
            let starter: Weak<dyn BuildStarter> = this.clone();
            MasterInner {
                master_id: self.config.master_id,
                distributor: BuildRequestDistributor::new(starter, prioritizer, db.clone()),
                db,
                state,
                runner: self.runner,
                latent: self.latent,
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                running_builds,
                shutting_down,
                tasks: Mutex::new(Vec::new()),
                this: this.clone(),
            }
        });
        BotMaster { inner }
    }
}

fn prioritizer_for(kind: PrioritizerKind) -> Arc<dyn Prioritizer> {
    match kind {
        PrioritizerKind::Default => Arc::new(DefaultPrioritizer),
        PrioritizerKind::Unsorted => Arc::new(UnsortedPrioritizer),
    }
}

impl BotMaster {
    pub fn builder(
        config: MasterConfig,
        db: Database,
        runner: Arc<dyn BuildRunner>,
    ) -> BotMasterBuilder {
        BotMasterBuilder {
            config,
            db,
            runner,
            latent: None,
            prioritizer: None,
        }
    }

    pub fn master_id(&self) -> MasterId {
        self.inner.master_id
    }

    /// Start routing build request events and lock releases into the
    /// distributor, then look at every builder once.
    pub fn start(&self) {
        let inner = &self.inner;
        let Some(mut events) = inner
            .events_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            warn!("BotMaster already started");
            return;
        };

        let distributor = inner.distributor.clone();
        let event_task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                debug!(?event, "Build request event");
                distributor.maybe_start_builds_on(event.builder_names());
            }
        });

        let mut released = lock(&inner.state).locks.subscribe_released();
        let weak = inner.this.clone();
        let release_task = tokio::spawn(async move {
            loop {
                let lock_name = match released.recv().await {
                    Ok(name) => name,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Missed lock releases, rechecking every builder");
                        match weak.upgrade() {
                            Some(inner) => inner.distributor.maybe_start_builds_on_all(),
                            None => return,
                        }
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let builders = lock(&inner.state).builders_using_lock(&lock_name);
                if !builders.is_empty() {
                    debug!(lock = %lock_name, builders = ?builders, "Lock released");
                    inner.distributor.maybe_start_builds_on(builders);
                }
            }
        });

        inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([event_task, release_task]);
        inner.distributor.start();
        info!(master = %inner.master_id, "BotMaster started");
        self.maybe_start_builds_for_all_builders();
    }

    /// Stop admitting builds and tear down background tasks. Running builds
    /// are left to finish on their own.
    pub async fn stop(&self) {
        self.inner.distributor.stop().await;
        for task in self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
        let mut state = lock(&self.inner.state);
        for worker in state.workers.values_mut() {
            if let Some(keepalive) = worker.keepalive.take() {
                keepalive.abort();
            }
            if let Some(timer) = worker.idle_timer.take() {
                timer.abort();
            }
        }
        info!(master = %self.inner.master_id, "BotMaster stopped");
    }

    /// Where schedulers and other masters report new or released requests.
    pub fn event_sender(&self) -> mpsc::UnboundedSender<BuildRequestEvent> {
        self.inner.events_tx.clone()
    }

    pub fn maybe_start_builds_on<I, S>(&self, builder_names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inner.distributor.maybe_start_builds_on(builder_names);
    }

    pub fn maybe_start_builds_for_all_builders(&self) {
        self.inner.distributor.maybe_start_builds_on_all();
    }

    /// Wait until no admission pass is running.
    pub async fn wait_until_quiet(&self) {
        self.inner.distributor.wait_until_quiet().await;
    }

    /// Wait until no builds run and no admission pass is pending.
    pub async fn wait_until_idle(&self) {
        let mut running = self.inner.running_builds.subscribe();
        loop {
            self.inner.distributor.wait_until_quiet().await;
            let _ = running.wait_for(|n| *n == 0).await;
            if self.inner.distributor.is_quiet() && *running.borrow() == 0 {
                return;
            }
        }
    }

    pub fn running_builds(&self) -> usize {
        *self.inner.running_builds.borrow()
    }

    /// Slots of `builder_name` as (worker, state), in creation order.
    pub fn slot_states(&self, builder_name: &str) -> Vec<(String, SlotState)> {
        lock(&self.inner.state)
            .slots
            .for_builder(builder_name)
            .map(|slot| (slot.worker_name().to_string(), slot.state()))
            .collect()
    }

    /// Attach a concrete worker. Each builder that lists the worker gets a
    /// slot, which becomes idle once the worker answers the handshake.
    pub async fn attach_worker(
        &self,
        worker_name: &str,
        connection: Arc<dyn WorkerConnection>,
    ) -> SchedulerResult<()> {
        let inner = &self.inner;
        let (slots, keepalive_interval) = {
            let mut guard = lock(&inner.state);
            let state = &mut *guard;
            let worker = state
                .workers
                .get_mut(worker_name)
                .ok_or_else(|| SchedulerError::UnknownWorker(worker_name.to_string()))?;
            if worker.is_latent() {
                return Err(Error::InvalidInput(format!(
                    "latent worker {worker_name} attaches through substantiation"
                ))
                .into());
            }
            if let Some(old) = worker.disconnect() {
                info!(worker = %worker_name, "Replacing existing connection");
                old.lose_connection();
            }
            worker.connection = Some(connection.clone());
            let keepalive_interval = worker.config.keepalive_interval;

            let slots: Vec<(SlotId, String)> = state
                .builders_serving(worker_name)
                .into_iter()
                .map(|builder_name| {
                    let id = match state.slots.find(&builder_name, worker_name) {
                        Some(id) => {
                            if let Some(slot) = state.slots.get_mut(id) {
                                slot.detached();
                            }
                            id
                        }
                        None => state.slots.insert(&builder_name, worker_name, false),
                    };
                    (id, builder_name)
                })
                .collect();
            (slots, keepalive_interval)
        };

        let builders: Vec<String> = slots.iter().map(|(_, b)| b.clone()).collect();
        inner.handshake(worker_name, &connection, slots).await?;
        if let Some(interval) = keepalive_interval {
            inner.start_keepalive(worker_name, connection, interval);
        }
        info!(worker = %worker_name, builders = ?builders, "Worker attached");
        inner.distributor.maybe_start_builds_on(builders);
        Ok(())
    }

    pub fn detach_worker(&self, worker_name: &str) {
        self.inner.detach_worker(worker_name);
    }

    /// Check that the worker behind a slot is alive. Concurrent callers
    /// share one ping. A worker that fails the ping is detached.
    pub async fn ping_worker_slot(
        &self,
        builder_name: &str,
        worker_name: &str,
    ) -> SchedulerResult<bool> {
        let (slot, connection) = {
            let state = lock(&self.inner.state);
            let slot = state
                .slots
                .find(builder_name, worker_name)
                .ok_or_else(|| SchedulerError::UnknownWorker(worker_name.to_string()))?;
            let connection = state
                .workers
                .get(worker_name)
                .and_then(|w| w.connection.clone());
            (slot, connection)
        };
        let Some(connection) = connection else {
            return Ok(false);
        };
        Ok(self.inner.ping_slot(slot, connection).await)
    }

    /// Stop starting builds and wait for the running ones to finish.
    /// Returns `false` if [`Self::cancel_clean_shutdown`] was called first.
    pub async fn clean_shutdown(&self) -> bool {
        let inner = &self.inner;
        let mut cancelled = inner.shutting_down.subscribe();
        inner.shutting_down.send_replace(true);
        info!(running = self.running_builds(), "Clean shutdown requested");
        inner.distributor.stop().await;

        let mut running = inner.running_builds.subscribe();
        let finished = tokio::select! {
            biased;
            _ = cancelled.wait_for(|s| !*s) => false,
            _ = running.wait_for(|n| *n == 0) => true,
        };
        if finished {
            info!("All builds finished, shutting down");
            self.stop().await;
        } else {
            info!("Clean shutdown cancelled");
        }
        finished
    }

    pub fn cancel_clean_shutdown(&self) {
        if !self.inner.shutting_down.send_replace(false) {
            return;
        }
        self.inner.distributor.start();
        self.maybe_start_builds_for_all_builders();
    }

    /// Apply a new configuration. Removed builders and workers lose their
    /// slots; builds already running finish where they are.
    pub async fn reconfigure(&self, config: MasterConfig) -> SchedulerResult<()> {
        config.validate()?;
        let inner = &self.inner;
        let handshakes = {
            let mut guard = lock(&inner.state);
            let state = &mut *guard;
            state.locks.reconfigure(&config.locks);

            let removed: Vec<String> = state
                .workers
                .keys()
                .filter(|name| config.worker(name).is_none())
                .cloned()
                .collect();
            for name in removed {
                if let Some(mut worker) = state.workers.remove(&name) {
                    if let Some(connection) = worker.disconnect() {
                        connection.lose_connection();
                    }
                    info!(worker = %name, "Worker removed");
                }
            }
            for worker_config in &config.workers {
                let name = &worker_config.name;
                if let Some(worker) = state
                    .workers
                    .get_mut(name)
                    .filter(|w| w.config.latent == worker_config.latent)
                {
                    worker.config = worker_config.clone();
                    continue;
                }
                let replaced = state
                    .workers
                    .insert(name.clone(), Worker::new(worker_config.clone()));
                if let Some(connection) = replaced.and_then(|mut w| w.disconnect()) {
                    connection.lose_connection();
                }
            }

            state.builders = config
                .builders
                .iter()
                .map(|b| (b.name.clone(), Builder::new(b.clone())))
                .collect();

            let stale: Vec<SlotId> = state
                .slots
                .iter()
                .filter(|slot| {
                    let listed = state.builders.get(slot.builder_name()).is_some_and(|b| {
                        b.config.workers.iter().any(|w| w == slot.worker_name())
                    });
                    let same_kind = state
                        .workers
                        .get(slot.worker_name())
                        .is_some_and(|w| w.is_latent() == slot.is_latent());
                    !(listed && same_kind)
                })
                .map(WorkerSlot::id)
                .collect();
            for id in stale {
                if let Some(mut slot) = state.slots.remove(id) {
                    debug!(builder = %slot.builder_name(), worker = %slot.worker_name(), "Removing slot");
                    slot.detached();
                }
            }

            state.create_latent_slots();
            let mut handshakes = Vec::new();
            for builder in &config.builders {
                for worker_name in &builder.workers {
                    let Some(worker) = state.workers.get(worker_name) else {
                        continue;
                    };
                    if worker.is_latent() || state.slots.find(&builder.name, worker_name).is_some() {
                        continue;
                    }
                    if let Some(connection) = worker.connection.clone() {
                        let id = state.slots.insert(&builder.name, worker_name, false);
                        handshakes.push((worker_name.clone(), connection, id, builder.name.clone()));
                    }
                }
            }
            handshakes
        };

        for (worker_name, connection, slot, builder_name) in handshakes {
            if let Err(e) = inner
                .handshake(&worker_name, &connection, vec![(slot, builder_name)])
                .await
            {
                warn!(worker = %worker_name, error = %e, "Handshake after reconfiguration failed");
            }
        }
        info!(builders = config.builders.len(), workers = config.workers.len(), "Reconfigured");
        self.maybe_start_builds_for_all_builders();
        Ok(())
    }
}

impl MasterInner {
    fn lock_state(&self) -> MutexGuard<'_, MasterState> {
        lock(&self.state)
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutting_down.borrow()
    }

    /// Pick a request, a slot and the locks for `builder_name`, without
    /// claiming anything.
    fn plan_build(
        &self,
        builder_name: &str,
        build_id: BuildId,
        pending: &[BuildRequest],
    ) -> SchedulerResult<Option<BuildPlan>> {
        let state = self.lock_state();
        let Some(builder) = state.builders.get(builder_name) else {
            return Ok(None);
        };
        let Some(chosen) = builder.choose_request(pending) else {
            return Ok(None);
        };
        let Some(slot_id) = builder.next_worker(&state.slots, &state.workers) else {
            debug!(builder = %builder_name, "No worker available");
            return Ok(None);
        };
        let Some(slot) = state.slots.get(slot_id) else {
            return Ok(None);
        };
        let worker_name = slot.worker_name().to_string();

        let locks = state
            .locks
            .resolve(builder.config.all_lock_accesses(), &worker_name)?;
        if !state.locks.is_available_all(build_id, &locks) {
            debug!(builder = %builder_name, worker = %worker_name, "Locks not available");
            return Ok(None);
        }

        Ok(Some(BuildPlan {
            builder_name: builder_name.to_string(),
            worker_name,
            slot: slot_id,
            requests: builder
                .collapse(chosen, pending)
                .into_iter()
                .cloned()
                .collect(),
            locks,
        }))
    }

    /// Claim the planned slot and locks. Fails if either changed while the
    /// requests were being claimed.
    fn dispatch(&self, build_id: BuildId, plan: &BuildPlan) -> SchedulerResult<()> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let worker = state
            .workers
            .get_mut(&plan.worker_name)
            .ok_or_else(|| SchedulerError::UnknownWorker(plan.worker_name.clone()))?;
        let slot = state
            .slots
            .get_mut(plan.slot)
            .ok_or_else(|| SchedulerError::UnknownWorker(plan.worker_name.clone()))?;
        if !slot.is_available(worker) {
            return Err(Error::Conflict(format!("slot {} was taken", plan.slot)).into());
        }
        if !state.locks.try_claim_all(build_id, &plan.locks) {
            return Err(Error::Conflict("locks were taken".to_string()).into());
        }
        if let Err(e) = slot.start_build() {
            state.locks.release_all(build_id, &plan.locks);
            return Err(e);
        }
        worker.running_builds += 1;
        if let Some(timer) = worker.idle_timer.take() {
            timer.abort();
        }
        state.builds.insert(
            build_id,
            RunningBuild {
                builder_name: plan.builder_name.clone(),
                worker_name: plan.worker_name.clone(),
                slot: plan.slot,
                request_ids: plan.request_ids(),
                locks: plan.locks.clone(),
            },
        );
        Ok(())
    }

    async fn run_build(self: Arc<Self>, build_id: BuildId, plan: BuildPlan) {
        let connection = match self.prepare_worker(&plan).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!(
                    build = %build_id,
                    builder = %plan.builder_name,
                    worker = %plan.worker_name,
                    error = %e,
                    "Worker not ready, giving requests back"
                );
                let latent = matches!(e, SchedulerError::Substantiation { .. });
                self.abandon_build(build_id, !latent).await;
                return;
            }
        };

        let build = BuildContext {
            build_id,
            builder_name: plan.builder_name,
            worker_name: plan.worker_name,
            requests: plan.requests,
            connection,
            state: self.state.clone(),
            held: Mutex::new(Vec::new()),
        };
        info!(
            build = %build_id,
            builder = %build.builder_name,
            worker = %build.worker_name,
            requests = build.requests.len(),
            "Build started"
        );
        let result = match self.runner.run_build(&build).await {
            Ok(result) => result,
            Err(e) => {
                error!(build = %build_id, builder = %build.builder_name, error = %e, "Build failed");
                BuildResult::Exception
            }
        };
        self.finish_build(build_id, result, build.take_held_locks())
            .await;
    }

    /// Substantiate a latent worker or ping a concrete one.
    async fn prepare_worker(&self, plan: &BuildPlan) -> SchedulerResult<Arc<dyn WorkerConnection>> {
        let (latent, connection) = {
            let state = self.lock_state();
            let worker = state
                .workers
                .get(&plan.worker_name)
                .ok_or_else(|| SchedulerError::UnknownWorker(plan.worker_name.clone()))?;
            (worker.is_latent(), worker.connection.clone())
        };

        if latent {
            let outcome = self.substantiate(&plan.worker_name).await;
            let mut state = self.lock_state();
            if let Some(slot) = state.slots.get_mut(plan.slot) {
                match &outcome {
                    Ok(_) => slot.substantiated()?,
                    Err(_) => slot.substantiation_failed()?,
                }
            }
            return outcome;
        }

        let Some(connection) = connection else {
            self.detach_worker(&plan.worker_name);
            return Err(Error::Connection(format!("{} is not connected", plan.worker_name)).into());
        };
        if !self.ping_slot(plan.slot, connection.clone()).await {
            return Err(Error::Connection(format!("{} did not answer ping", plan.worker_name)).into());
        }
        Ok(connection)
    }

    async fn substantiate(&self, worker_name: &str) -> SchedulerResult<Arc<dyn WorkerConnection>> {
        let failed = |message: &str| SchedulerError::Substantiation {
            worker: worker_name.to_string(),
            message: message.to_string(),
        };

        let follower = {
            let mut state = self.lock_state();
            let worker = state
                .workers
                .get_mut(worker_name)
                .ok_or_else(|| SchedulerError::UnknownWorker(worker_name.to_string()))?;
            if let Some(connection) = worker.connection.clone() {
                return Ok(connection);
            }
            if worker.substantiating {
                let (tx, rx) = oneshot::channel();
                worker.substantiation_waiters.push(tx);
                Some(rx)
            } else {
                if self.latent.is_none() {
                    return Err(failed("no latent controller configured"));
                }
                worker.substantiating = true;
                None
            }
        };

        if let Some(rx) = follower {
            if !rx.await.unwrap_or(false) {
                return Err(failed("substantiation failed"));
            }
            return self
                .lock_state()
                .workers
                .get(worker_name)
                .and_then(|w| w.connection.clone())
                .ok_or_else(|| failed("worker went away"));
        }

        let Some(controller) = self.latent.clone() else {
            return Err(failed("no latent controller configured"));
        };
        info!(worker = %worker_name, "Substantiating worker");
        let outcome = controller.substantiate(worker_name).await;

        let mut state = self.lock_state();
        let Some(worker) = state.workers.get_mut(worker_name) else {
            return Err(SchedulerError::UnknownWorker(worker_name.to_string()));
        };
        worker.substantiating = false;
        if let Ok(connection) = &outcome {
            worker.connection = Some(connection.clone());
        }
        for waiter in worker.substantiation_waiters.drain(..) {
            let _ = waiter.send(outcome.is_ok());
        }
        outcome.map_err(|e| failed(&e.to_string()))
    }

    /// Ping through a slot, sharing an in-flight ping if there is one. A
    /// failed ping drops the connection and detaches the worker.
    async fn ping_slot(&self, slot_id: SlotId, connection: Arc<dyn WorkerConnection>) -> bool {
        let (tx, rx) = oneshot::channel();
        let worker_name = {
            let mut state = self.lock_state();
            let Some(slot) = state.slots.get_mut(slot_id) else {
                return false;
            };
            let first = slot.watch_ping(tx);
            first.then(|| slot.worker_name().to_string())
        };

        if let Some(worker_name) = worker_name {
            let weak = self.this.clone();
            tokio::spawn(async move {
                let alive = matches!(connection.ping().await, Ok(true));
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let builder_name = inner
                    .lock_state()
                    .slots
                    .get_mut(slot_id)
                    .map(|slot| {
                        slot.ping_answered(alive);
                        slot.builder_name().to_string()
                    });
                if !alive {
                    warn!(worker = %worker_name, "Ping failed, dropping connection");
                    connection.lose_connection();
                    inner.detach_worker(&worker_name);
                } else if let Some(builder_name) = builder_name {
                    // Admission passes skipped the slot while it was pinging.
                    inner.distributor.maybe_start_builds_on(vec![builder_name]);
                }
            });
        }
        rx.await.unwrap_or(false)
    }

    async fn handshake(
        &self,
        worker_name: &str,
        connection: &Arc<dyn WorkerConnection>,
        slots: Vec<(SlotId, String)>,
    ) -> SchedulerResult<()> {
        for (slot_id, builder_name) in slots {
            if let Err(e) = connection
                .remote_print(&format!("attached to builder {builder_name}"))
                .await
            {
                warn!(worker = %worker_name, builder = %builder_name, error = %e, "Handshake failed");
                connection.lose_connection();
                self.detach_worker(worker_name);
                return Err(e.into());
            }
            let mut state = self.lock_state();
            if let Some(slot) = state.slots.get_mut(slot_id) {
                if slot.logical_state() == SlotState::Attaching {
                    slot.attached()?;
                }
            }
        }
        Ok(())
    }

    fn start_keepalive(
        &self,
        worker_name: &str,
        connection: Arc<dyn WorkerConnection>,
        interval: Duration,
    ) {
        let weak = self.this.clone();
        let name = worker_name.to_string();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = connection.keepalive().await {
                    warn!(worker = %name, error = %e, "Keepalive failed, detaching worker");
                    connection.lose_connection();
                    if let Some(inner) = weak.upgrade() {
                        inner.detach_worker(&name);
                    }
                    return;
                }
            }
        });

        let mut state = self.lock_state();
        match state.workers.get_mut(worker_name) {
            Some(worker) => {
                if let Some(old) = worker.keepalive.replace(task) {
                    old.abort();
                }
            }
            None => task.abort(),
        }
    }

    fn detach_worker(&self, worker_name: &str) {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let Some(worker) = state.workers.get_mut(worker_name) else {
            return;
        };
        let was_connected = worker.disconnect().is_some();
        let latent = worker.is_latent();

        let slots: Vec<SlotId> = state
            .slots
            .for_worker(worker_name)
            .map(WorkerSlot::id)
            .collect();
        for id in slots {
            if latent {
                if let Some(slot) = state.slots.get_mut(id) {
                    slot.detached();
                }
            } else if let Some(mut slot) = state.slots.remove(id) {
                slot.detached();
            }
        }
        if was_connected {
            info!(worker = %worker_name, "Worker detached");
        }
    }

    /// Undo a dispatch whose worker never became ready.
    async fn abandon_build(&self, build_id: BuildId, notify: bool) {
        let record = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            let Some(record) = state.builds.remove(&build_id) else {
                return;
            };
            state.locks.release_all(build_id, &record.locks);
            if let Some(slot) = state.slots.get_mut(record.slot) {
                let reset = match slot.logical_state() {
                    SlotState::Substantiating => slot.substantiation_failed(),
                    SlotState::Building => slot.build_finished(),
                    _ => Ok(()),
                };
                if let Err(e) = reset {
                    warn!(build = %build_id, error = %e, "Could not reset slot");
                }
            }
            if let Some(worker) = state.workers.get_mut(&record.worker_name) {
                worker.running_builds = worker.running_builds.saturating_sub(1);
            }
            record
        };

        if let Err(e) = self
            .db
            .buildrequests
            .unclaim_build_requests(&record.request_ids, self.master_id)
            .await
        {
            error!(build = %build_id, error = %e, "Failed to unclaim build requests");
        }
        self.running_builds.send_modify(|n| *n = n.saturating_sub(1));
        if notify {
            let _ = self.events_tx.send(BuildRequestEvent::Unclaimed {
                builder_name: record.builder_name,
            });
        }
    }

    async fn finish_build(
        &self,
        build_id: BuildId,
        result: BuildResult,
        extra_locks: Vec<ResolvedAccess>,
    ) {
        let (record, idle_timeout, builders) = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            let Some(record) = state.builds.remove(&build_id) else {
                return;
            };
            state.locks.release_all(build_id, &record.locks);
            state.locks.release_all(build_id, &extra_locks);
            if let Some(slot) = state.slots.get_mut(record.slot) {
                if let Err(e) = slot.build_finished() {
                    warn!(build = %build_id, error = %e, "Slot changed while building");
                }
            }
            let mut idle_timeout = None;
            if let Some(worker) = state.workers.get_mut(&record.worker_name) {
                worker.running_builds = worker.running_builds.saturating_sub(1);
                if worker.is_latent() && worker.running_builds == 0 && worker.is_connected() {
                    idle_timeout = Some(worker.config.build_wait_timeout);
                }
            }
            let builders = state.builders_serving(&record.worker_name);
            (record, idle_timeout, builders)
        };

        if let Some(timeout) = idle_timeout {
            self.schedule_insubstantiation(&record.worker_name, timeout);
        }
        if let Err(e) = self
            .db
            .buildrequests
            .complete_build_requests(&record.request_ids, result)
            .await
        {
            error!(build = %build_id, error = %e, "Failed to complete build requests");
        }
        self.running_builds.send_modify(|n| *n = n.saturating_sub(1));
        info!(
            build = %build_id,
            builder = %record.builder_name,
            worker = %record.worker_name,
            result = ?result,
            "Build finished"
        );
        self.distributor.maybe_start_builds_on(builders);
    }

    fn schedule_insubstantiation(&self, worker_name: &str, timeout: Duration) {
        let weak = self.this.clone();
        let name = worker_name.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.insubstantiate_if_idle(&name).await;
            }
        });

        let mut state = self.lock_state();
        match state.workers.get_mut(worker_name) {
            Some(worker) => {
                if let Some(old) = worker.idle_timer.replace(task) {
                    old.abort();
                }
            }
            None => task.abort(),
        }
    }

    async fn insubstantiate_if_idle(&self, worker_name: &str) {
        let connection = {
            let mut state = self.lock_state();
            let Some(worker) = state.workers.get_mut(worker_name) else {
                return;
            };
            if worker.running_builds > 0 || worker.substantiating {
                return;
            }
            // This task; dropping the handle detaches it.
            worker.idle_timer.take();
            worker.connection.take()
        };
        if connection.is_none() {
            return;
        }
        let Some(controller) = &self.latent else {
            return;
        };
        match controller.insubstantiate(worker_name).await {
            Ok(()) => info!(worker = %worker_name, "Worker insubstantiated"),
            Err(e) => warn!(worker = %worker_name, error = %e, "Failed to insubstantiate worker"),
        }
    }
}

#[async_trait]
impl BuildStarter for MasterInner {
    fn builder_names(&self) -> BTreeSet<String> {
        self.lock_state().builders.keys().cloned().collect()
    }

    async fn maybe_start_build(&self, builder_name: &str) -> SchedulerResult<AttemptOutcome> {
        if self.is_shutting_down() {
            return Ok(AttemptOutcome::StopBuilder);
        }
        let Some(this) = self.this.upgrade() else {
            return Err(SchedulerError::Stopped);
        };

        let pending = self
            .db
            .buildrequests
            .get_unclaimed_build_requests(builder_name)
            .await?;
        let build_id = BuildId::new();
        let Some(plan) = self.plan_build(builder_name, build_id, &pending)? else {
            return Ok(AttemptOutcome::StopBuilder);
        };

        let ids = plan.request_ids();
        if !self
            .db
            .buildrequests
            .claim_build_requests(&ids, self.master_id)
            .await?
        {
            debug!(builder = %builder_name, requests = ?ids, "Requests claimed elsewhere");
            return Ok(AttemptOutcome::Retry);
        }

        if let Err(e) = self.dispatch(build_id, &plan) {
            warn!(builder = %builder_name, error = %e, "Dispatch failed after claim, giving requests back");
            self.db
                .buildrequests
                .unclaim_build_requests(&ids, self.master_id)
                .await?;
            return Ok(AttemptOutcome::StopBuilder);
        }

        debug!(
            build = %build_id,
            builder = %builder_name,
            worker = %plan.worker_name,
            requests = ?ids,
            "Dispatching build"
        );
        self.running_builds.send_modify(|n| *n += 1);
        tokio::spawn(this.run_build(build_id, plan));
        Ok(AttemptOutcome::Started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::testing::FakeConnection;
    use buildmaster_config::{BuilderConfig, LockConfig, WorkerConfig};
    use buildmaster_core::SourceStamp;
    use buildmaster_db::{BuildRequestRepo, MemoryDb, NewBuildset};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    /// Runs builds until the test opens the gate.
    struct GatedRunner {
        gate: Semaphore,
        started: Mutex<Vec<(String, Vec<BuildRequestId>)>>,
        step_lock: Option<LockAccessSpec>,
        acquired: AtomicUsize,
    }

    impl GatedRunner {
        fn new() -> Arc<Self> {
            Self::with_step_lock(None)
        }

        fn with_step_lock(step_lock: Option<LockAccessSpec>) -> Arc<Self> {
            Arc::new(Self {
                gate: Semaphore::new(0),
                started: Mutex::new(Vec::new()),
                step_lock,
                acquired: AtomicUsize::new(0),
            })
        }

        fn open(&self, builds: usize) {
            self.gate.add_permits(builds);
        }

        fn started(&self) -> Vec<(String, Vec<BuildRequestId>)> {
            self.started.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BuildRunner for GatedRunner {
        async fn run_build(&self, build: &BuildContext) -> SchedulerResult<BuildResult> {
            self.started.lock().unwrap().push((
                build.builder_name.clone(),
                build.requests.iter().map(|br| br.id).collect(),
            ));
            if let Some(spec) = &self.step_lock {
                build.acquire_lock(spec).await?;
                self.acquired.fetch_add(1, Ordering::SeqCst);
            }
            build
                .connection
                .remote_start_command(1, "build", &[build.builder_name.clone()])
                .await?;
            self.gate
                .acquire()
                .await
                .map_err(|_| SchedulerError::Stopped)?
                .forget();
            Ok(BuildResult::Success)
        }
    }

    #[derive(Default)]
    struct FakeLatent {
        fails: AtomicBool,
        substantiations: AtomicUsize,
        insubstantiations: AtomicUsize,
    }

    #[async_trait]
    impl LatentController for FakeLatent {
        async fn substantiate(&self, _worker_name: &str) -> buildmaster_core::Result<Arc<dyn WorkerConnection>> {
            self.substantiations.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(1)).await;
            if self.fails.load(Ordering::SeqCst) {
                return Err(Error::Unavailable("no capacity".to_string()));
            }
            Ok(FakeConnection::new())
        }

        async fn insubstantiate(&self, _worker_name: &str) -> buildmaster_core::Result<()> {
            self.insubstantiations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config(builders: Vec<BuilderConfig>, workers: Vec<WorkerConfig>) -> MasterConfig {
        MasterConfig {
            builders,
            workers,
            ..MasterConfig::default()
        }
    }

    fn stamp(branch: &str) -> SourceStamp {
        SourceStamp {
            codebase: String::new(),
            repository: "https://example.com/app.git".to_string(),
            project: "app".to_string(),
            branch: Some(branch.to_string()),
            revision: None,
            changes: vec![],
        }
    }

    async fn request(db: &MemoryDb, builder: &str, branch: &str) -> BuildRequestId {
        let (_, ids) = db
            .create_build_requests(NewBuildset {
                builder_names: vec![builder.to_string()],
                sourcestamps: vec![stamp(branch)],
                reason: "test".to_string(),
                priority: 0,
            })
            .await
            .unwrap();
        ids[builder]
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fn master(config: MasterConfig, db: &Arc<MemoryDb>, runner: &Arc<GatedRunner>) -> BotMaster {
        let master = BotMaster::builder(config, Database::in_memory(db.clone()), runner.clone()).build();
        master.start();
        master
    }

    fn one_builder() -> MasterConfig {
        config(
            vec![BuilderConfig::new("linux", ["w1"])],
            vec![WorkerConfig::new("w1")],
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_runs_on_attached_worker() {
        let db = Arc::new(MemoryDb::new());
        let runner = GatedRunner::new();
        let master = master(one_builder(), &db, &runner);
        let conn = FakeConnection::new();
        master.attach_worker("w1", conn.clone()).await.unwrap();
        assert_eq!(master.slot_states("linux"), vec![("w1".to_string(), SlotState::Idle)]);
        assert_eq!(conn.printed.lock().unwrap().clone(), vec!["attached to builder linux"]);

        let id = request(&db, "linux", "main").await;
        master.maybe_start_builds_on(["linux"]);
        settle().await;

        assert_eq!(runner.started(), vec![("linux".to_string(), vec![id])]);
        assert_eq!(master.slot_states("linux")[0].1, SlotState::Building);
        assert_eq!(master.running_builds(), 1);
        assert_eq!(conn.pings.load(Ordering::SeqCst), 1);
        assert_eq!(conn.commands.lock().unwrap().clone(), vec!["build"]);

        runner.open(1);
        master.wait_until_idle().await;
        assert_eq!(master.slot_states("linux")[0].1, SlotState::Idle);
        let requests = db.build_requests().await;
        assert!(requests[0].complete);
        assert_eq!(requests[0].results, Some(BuildResult::Success));
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_one_master_claims_a_request() {
        let db = Arc::new(MemoryDb::new());
        let runner = GatedRunner::new();
        let mut second_config = one_builder();
        second_config.master_id = MasterId(2);
        let first = master(one_builder(), &db, &runner);
        let second = master(second_config, &db, &runner);
        first.attach_worker("w1", FakeConnection::new()).await.unwrap();
        second.attach_worker("w1", FakeConnection::new()).await.unwrap();

        request(&db, "linux", "main").await;
        first.maybe_start_builds_on(["linux"]);
        second.maybe_start_builds_on(["linux"]);
        settle().await;

        assert_eq!(runner.started().len(), 1);
        assert_eq!(first.running_builds() + second.running_builds(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_building_slot_is_not_reused() {
        let db = Arc::new(MemoryDb::new());
        let runner = GatedRunner::new();
        let master = master(one_builder(), &db, &runner);
        master.attach_worker("w1", FakeConnection::new()).await.unwrap();

        let first = request(&db, "linux", "main").await;
        let second = request(&db, "linux", "dev").await;
        master.maybe_start_builds_on(["linux"]);
        settle().await;
        assert_eq!(runner.started(), vec![("linux".to_string(), vec![first])]);

        // Finishing the build frees the slot and starts the next request.
        runner.open(1);
        settle().await;
        assert_eq!(runner.started()[1], ("linux".to_string(), vec![second]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_collapsed_requests_share_one_build() {
        let db = Arc::new(MemoryDb::new());
        let runner = GatedRunner::new();
        let mut builder = BuilderConfig::new("linux", ["w1"]);
        builder.collapse_requests = true;
        let master = master(config(vec![builder], vec![WorkerConfig::new("w1")]), &db, &runner);
        master.attach_worker("w1", FakeConnection::new()).await.unwrap();

        let a = request(&db, "linux", "main").await;
        let b = request(&db, "linux", "main").await;
        master.maybe_start_builds_on(["linux"]);
        runner.open(1);
        master.wait_until_idle().await;

        assert_eq!(runner.started(), vec![("linux".to_string(), vec![a, b])]);
        assert!(db.build_requests().await.iter().all(|br| br.complete));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latent_worker_substantiates_and_insubstantiates() {
        let db = Arc::new(MemoryDb::new());
        let runner = GatedRunner::new();
        let latent = Arc::new(FakeLatent::default());
        let mut cloud = WorkerConfig::latent("cloud");
        cloud.build_wait_timeout = Duration::from_secs(60);
        let master = BotMaster::builder(
            config(vec![BuilderConfig::new("linux", ["cloud"])], vec![cloud]),
            Database::in_memory(db.clone()),
            runner.clone(),
        )
        .latent_controller(latent.clone())
        .build();
        master.start();
        assert_eq!(master.slot_states("linux"), vec![("cloud".to_string(), SlotState::Latent)]);

        request(&db, "linux", "main").await;
        master.maybe_start_builds_on(["linux"]);
        settle().await;
        assert_eq!(master.slot_states("linux")[0].1, SlotState::Substantiating);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(latent.substantiations.load(Ordering::SeqCst), 1);
        assert_eq!(master.slot_states("linux")[0].1, SlotState::Building);
        assert_eq!(runner.started().len(), 1);

        runner.open(1);
        settle().await;
        assert_eq!(master.slot_states("linux")[0].1, SlotState::Latent);
        assert_eq!(latent.insubstantiations.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(latent.insubstantiations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_substantiation_returns_slot_to_latent() {
        let db = Arc::new(MemoryDb::new());
        let runner = GatedRunner::new();
        let latent = Arc::new(FakeLatent::default());
        latent.fails.store(true, Ordering::SeqCst);
        let master = BotMaster::builder(
            config(
                vec![BuilderConfig::new("linux", ["cloud"])],
                vec![WorkerConfig::latent("cloud")],
            ),
            Database::in_memory(db.clone()),
            runner.clone(),
        )
        .latent_controller(latent.clone())
        .build();
        master.start();

        request(&db, "linux", "main").await;
        master.maybe_start_builds_on(["linux"]);
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(latent.substantiations.load(Ordering::SeqCst), 1);
        assert_eq!(master.slot_states("linux")[0].1, SlotState::Latent);
        assert!(runner.started().is_empty());
        assert_eq!(master.running_builds(), 0);
        let requests = db.build_requests().await;
        assert!(!requests[0].is_claimed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_release_starts_waiting_builder() {
        let db = Arc::new(MemoryDb::new());
        let runner = GatedRunner::new();
        let mut a = BuilderConfig::new("a", ["w1"]);
        a.locks.push(LockAccessSpec::exclusive("deploy"));
        let mut b = BuilderConfig::new("b", ["w2"]);
        b.locks.push(LockAccessSpec::exclusive("deploy"));
        let mut config = config(vec![a, b], vec![WorkerConfig::new("w1"), WorkerConfig::new("w2")]);
        config.locks.push(LockConfig::master("deploy", 1));
        let master = master(config, &db, &runner);
        master.attach_worker("w1", FakeConnection::new()).await.unwrap();
        master.attach_worker("w2", FakeConnection::new()).await.unwrap();

        request(&db, "a", "main").await;
        request(&db, "b", "main").await;
        master.maybe_start_builds_on(["a", "b"]);
        settle().await;
        assert_eq!(runner.started().len(), 1);

        // Nobody notifies "b" explicitly; the lock release does.
        runner.open(1);
        settle().await;
        assert_eq!(runner.started().len(), 2);
        let builders: BTreeSet<String> = runner.started().into_iter().map(|(b, _)| b).collect();
        assert_eq!(builders.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_waits_for_step_lock() {
        let db = Arc::new(MemoryDb::new());
        let runner = GatedRunner::with_step_lock(Some(LockAccessSpec::exclusive("deploy")));
        let mut config = config(
            vec![BuilderConfig::new("a", ["w1"]), BuilderConfig::new("b", ["w2"])],
            vec![WorkerConfig::new("w1"), WorkerConfig::new("w2")],
        );
        config.locks.push(LockConfig::master("deploy", 1));
        let master = master(config, &db, &runner);
        master.attach_worker("w1", FakeConnection::new()).await.unwrap();
        master.attach_worker("w2", FakeConnection::new()).await.unwrap();

        request(&db, "a", "main").await;
        request(&db, "b", "main").await;
        master.maybe_start_builds_on(["a", "b"]);
        settle().await;
        assert_eq!(runner.started().len(), 2);
        assert_eq!(runner.acquired.load(Ordering::SeqCst), 1);

        // The first build ends holding the lock; ending releases it.
        runner.open(1);
        settle().await;
        assert_eq!(runner.acquired.load(Ordering::SeqCst), 2);
        runner.open(1);
        master.wait_until_idle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_lock_merged_at_admission_is_not_waited_for() {
        let db = Arc::new(MemoryDb::new());
        let runner = GatedRunner::with_step_lock(Some(LockAccessSpec::counting("cpu")));
        let mut builder = BuilderConfig::new("linux", ["w1"]);
        builder.locks.push(LockAccessSpec::counting("cpu").with_count(2));
        builder.step_locks.push(LockAccessSpec::counting("cpu"));
        let mut config = config(vec![builder], vec![WorkerConfig::new("w1")]);
        config.locks.push(LockConfig::master("cpu", 2));
        let master = master(config, &db, &runner);
        master.attach_worker("w1", FakeConnection::new()).await.unwrap();

        request(&db, "linux", "main").await;
        master.maybe_start_builds_on(["linux"]);
        settle().await;
        assert_eq!(runner.acquired.load(Ordering::SeqCst), 1);

        runner.open(1);
        master.wait_until_idle().await;
        assert!(db.build_requests().await[0].complete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_finishing_during_ping_frees_slot() {
        let db = Arc::new(MemoryDb::new());
        let runner = GatedRunner::new();
        let master = master(one_builder(), &db, &runner);
        let conn = FakeConnection::new();
        master.attach_worker("w1", conn.clone()).await.unwrap();
        request(&db, "linux", "main").await;
        master.maybe_start_builds_on(["linux"]);
        settle().await;
        assert_eq!(master.slot_states("linux")[0].1, SlotState::Building);

        conn.set_ping_delay(Duration::from_secs(5));
        let ping = tokio::spawn({
            let master = master.clone();
            async move { master.ping_worker_slot("linux", "w1").await }
        });
        settle().await;
        assert_eq!(master.slot_states("linux")[0].1, SlotState::Pinging);
        conn.set_ping_delay(Duration::ZERO);

        runner.open(1);
        settle().await;
        assert_eq!(master.running_builds(), 0);
        assert_eq!(master.slot_states("linux")[0].1, SlotState::Pinging);

        assert!(ping.await.unwrap().unwrap());
        assert_eq!(master.slot_states("linux")[0].1, SlotState::Idle);

        let next = request(&db, "linux", "dev").await;
        master.maybe_start_builds_on(["linux"]);
        settle().await;
        assert_eq!(runner.started().len(), 2);
        assert_eq!(runner.started()[1].1, vec![next]);
        runner.open(1);
        master.wait_until_idle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_during_ping_starts_once_ping_answers() {
        let db = Arc::new(MemoryDb::new());
        let runner = GatedRunner::new();
        let master = master(one_builder(), &db, &runner);
        let conn = FakeConnection::new();
        master.attach_worker("w1", conn.clone()).await.unwrap();

        conn.set_ping_delay(Duration::from_secs(5));
        let ping = tokio::spawn({
            let master = master.clone();
            async move { master.ping_worker_slot("linux", "w1").await }
        });
        settle().await;
        conn.set_ping_delay(Duration::ZERO);

        let id = request(&db, "linux", "main").await;
        master.maybe_start_builds_on(["linux"]);
        settle().await;
        assert!(runner.started().is_empty());

        // Nobody notifies again; the answered ping does.
        assert!(ping.await.unwrap().unwrap());
        settle().await;
        assert_eq!(runner.started(), vec![("linux".to_string(), vec![id])]);
        runner.open(1);
        master.wait_until_idle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_ping_detaches_worker() {
        let db = Arc::new(MemoryDb::new());
        let runner = GatedRunner::new();
        let master = master(one_builder(), &db, &runner);
        let conn = FakeConnection::new();
        master.attach_worker("w1", conn.clone()).await.unwrap();
        conn.ping_fails.store(true, Ordering::SeqCst);

        request(&db, "linux", "main").await;
        master.maybe_start_builds_on(["linux"]);
        settle().await;

        assert!(runner.started().is_empty());
        assert!(conn.lost.load(Ordering::SeqCst));
        assert!(master.slot_states("linux").is_empty());
        assert_eq!(master.running_builds(), 0);
        assert!(!db.build_requests().await[0].is_claimed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_pings_are_shared() {
        let db = Arc::new(MemoryDb::new());
        let runner = GatedRunner::new();
        let master = master(one_builder(), &db, &runner);
        let conn = FakeConnection::new();
        master.attach_worker("w1", conn.clone()).await.unwrap();

        let (a, b) = tokio::join!(
            master.ping_worker_slot("linux", "w1"),
            master.ping_worker_slot("linux", "w1"),
        );
        assert!(a.unwrap());
        assert!(b.unwrap());
        assert_eq!(conn.pings.load(Ordering::SeqCst), 1);
        assert_eq!(master.slot_states("linux")[0].1, SlotState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_failure_detaches_worker() {
        let db = Arc::new(MemoryDb::new());
        let runner = GatedRunner::new();
        let mut worker = WorkerConfig::new("w1");
        worker.keepalive_interval = Some(Duration::from_secs(30));
        let master = master(config(vec![BuilderConfig::new("linux", ["w1"])], vec![worker]), &db, &runner);
        let conn = FakeConnection::new();
        master.attach_worker("w1", conn.clone()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(master.slot_states("linux").len(), 1);

        conn.keepalive_fails.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(conn.lost.load(Ordering::SeqCst));
        assert!(master.slot_states("linux").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_shutdown_waits_for_running_builds() {
        let db = Arc::new(MemoryDb::new());
        let runner = GatedRunner::new();
        let master = master(one_builder(), &db, &runner);
        master.attach_worker("w1", FakeConnection::new()).await.unwrap();
        request(&db, "linux", "main").await;
        master.maybe_start_builds_on(["linux"]);
        settle().await;

        let shutdown = tokio::spawn({
            let master = master.clone();
            async move { master.clean_shutdown().await }
        });
        settle().await;
        assert!(!shutdown.is_finished());

        // No new builds start while shutting down.
        request(&db, "linux", "dev").await;
        master.maybe_start_builds_on(["linux"]);
        settle().await;
        assert_eq!(runner.started().len(), 1);

        runner.open(1);
        assert!(shutdown.await.unwrap());
        assert_eq!(runner.started().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_clean_shutdown_resumes_admission() {
        let db = Arc::new(MemoryDb::new());
        let runner = GatedRunner::new();
        let master = master(one_builder(), &db, &runner);
        master.attach_worker("w1", FakeConnection::new()).await.unwrap();
        request(&db, "linux", "main").await;
        master.maybe_start_builds_on(["linux"]);
        settle().await;

        let shutdown = tokio::spawn({
            let master = master.clone();
            async move { master.clean_shutdown().await }
        });
        settle().await;
        request(&db, "linux", "dev").await;

        master.cancel_clean_shutdown();
        assert!(!shutdown.await.unwrap());

        runner.open(2);
        settle().await;
        assert_eq!(runner.started().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconfigure_drops_removed_builder() {
        let db = Arc::new(MemoryDb::new());
        let runner = GatedRunner::new();
        let both = config(
            vec![BuilderConfig::new("linux", ["w1"]), BuilderConfig::new("mac", ["w1"])],
            vec![WorkerConfig::new("w1")],
        );
        let master = master(both, &db, &runner);
        master.attach_worker("w1", FakeConnection::new()).await.unwrap();
        assert_eq!(master.slot_states("mac").len(), 1);

        master.reconfigure(one_builder()).await.unwrap();
        assert!(master.slot_states("mac").is_empty());
        assert_eq!(master.slot_states("linux")[0].1, SlotState::Idle);

        request(&db, "mac", "main").await;
        master.maybe_start_builds_on(["mac"]);
        settle().await;
        assert!(runner.started().is_empty());

        // Adding the builder back hands the connected worker a fresh slot.
        let mut back = one_builder();
        back.builders.push(BuilderConfig::new("mac", ["w1"]));
        master.reconfigure(back).await.unwrap();
        settle().await;
        assert_eq!(runner.started().len(), 1);
        assert_eq!(runner.started()[0].0, "mac");
    }

    #[tokio::test]
    async fn test_latent_workers_cannot_attach_directly() {
        let db = Arc::new(MemoryDb::new());
        let runner = GatedRunner::new();
        let master = master(
            config(
                vec![BuilderConfig::new("linux", ["cloud"])],
                vec![WorkerConfig::latent("cloud")],
            ),
            &db,
            &runner,
        );
        assert!(master.attach_worker("cloud", FakeConnection::new()).await.is_err());
        assert!(matches!(
            master.attach_worker("nope", FakeConnection::new()).await,
            Err(SchedulerError::UnknownWorker(_))
        ));
    }
}
