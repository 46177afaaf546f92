//! Serializes build admission across builders.
//!
//! Callers notify the distributor that some builders may have work with
//! [`BuildRequestDistributor::maybe_start_builds_on`]. Names are merged into
//! a pending set; a single activity loop drains it, orders the builders with
//! a [`Prioritizer`], and asks the [`BuildStarter`] to start builds on each
//! one in turn until that builder has nothing more to start. Bursts of
//! notifications therefore collapse into at most one extra pass.

use async_trait::async_trait;
use buildmaster_db::Database;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::SchedulerResult;

/// Consecutive claim races tolerated on one builder within a pass.
const MAX_RETRIES_PER_BUILDER: usize = 16;

/// Result of one attempt to start a build on a builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// A build was dispatched; try the builder again.
    Started,
    /// Lost a claim race; try the builder again.
    Retry,
    /// Nothing more can start on this builder right now.
    StopBuilder,
}

/// Performs admission for single builders.
#[async_trait]
pub trait BuildStarter: Send + Sync {
    /// Builders that currently exist.
    fn builder_names(&self) -> BTreeSet<String>;

    async fn maybe_start_build(&self, builder_name: &str) -> SchedulerResult<AttemptOutcome>;
}

/// Orders the builders considered in one pass.
#[async_trait]
pub trait Prioritizer: Send + Sync {
    async fn prioritize(&self, db: &Database, builders: Vec<String>)
    -> SchedulerResult<Vec<String>>;
}

/// Builders with the most urgent pending request first: highest request
/// priority, then oldest request, then name. Builders with no pending
/// requests go last.
#[derive(Debug, Default)]
pub struct DefaultPrioritizer;

#[async_trait]
impl Prioritizer for DefaultPrioritizer {
    async fn prioritize(
        &self,
        db: &Database,
        builders: Vec<String>,
    ) -> SchedulerResult<Vec<String>> {
        // (has no requests, -priority, oldest submission, name)
        let mut keyed: Vec<(bool, i32, Option<DateTime<Utc>>, String)> = Vec::new();
        for name in builders {
            let pending = db.buildrequests.get_unclaimed_build_requests(&name).await?;
            let priority = pending.iter().map(|br| br.priority).max();
            let oldest = pending.iter().map(|br| br.submitted_at).min();
            keyed.push((
                priority.is_none(),
                -priority.unwrap_or_default(),
                oldest,
                name,
            ));
        }
        keyed.sort();
        Ok(keyed.into_iter().map(|(_, _, _, name)| name).collect())
    }
}

/// Keeps builders in the order they were requested.
#[derive(Debug, Default)]
pub struct UnsortedPrioritizer;

#[async_trait]
impl Prioritizer for UnsortedPrioritizer {
    async fn prioritize(
        &self,
        _db: &Database,
        builders: Vec<String>,
    ) -> SchedulerResult<Vec<String>> {
        Ok(builders)
    }
}

#[derive(Debug, Default)]
struct DistributorState {
    /// Builders named since the current pass took its snapshot, in
    /// arrival order.
    pending: Vec<String>,
    /// An activity loop is running.
    active: bool,
    /// Admission is enabled.
    running: bool,
}

struct Inner {
    starter: Weak<dyn BuildStarter>,
    prioritizer: Arc<dyn Prioritizer>,
    db: Database,
    state: Mutex<DistributorState>,
    /// `true` while no activity loop is running.
    quiet: watch::Sender<bool>,
}

/// Cheap to clone; clones share the same activity loop.
#[derive(Clone)]
pub struct BuildRequestDistributor {
    inner: Arc<Inner>,
}

impl BuildRequestDistributor {
    pub fn new(
        starter: Weak<dyn BuildStarter>,
        prioritizer: Arc<dyn Prioritizer>,
        db: Database,
    ) -> Self {
        let (quiet, _) = watch::channel(true);
        Self {
            inner: Arc::new(Inner {
                starter,
                prioritizer,
                db,
                state: Mutex::new(DistributorState::default()),
                quiet,
            }),
        }
    }

    /// Enable admission and pick up anything that was requested while
    /// stopped.
    pub fn start(&self) {
        let mut state = self.inner.lock_state();
        state.running = true;
        if !state.pending.is_empty() {
            self.activate(&mut state);
        }
    }

    /// Disable admission and wait for the in-flight pass to wind down.
    /// Notifications received while stopped are kept for [`Self::start`].
    pub async fn stop(&self) {
        self.inner.lock_state().running = false;
        self.wait_until_quiet().await;
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock_state().running
    }

    pub fn is_quiet(&self) -> bool {
        *self.inner.quiet.borrow()
    }

    /// Wait until no activity loop is running.
    pub async fn wait_until_quiet(&self) {
        let mut quiet = self.inner.quiet.subscribe();
        // The sender lives in `self`, so this cannot fail.
        let _ = quiet.wait_for(|q| *q).await;
    }

    /// Note that `builder_names` may be able to start builds.
    pub fn maybe_start_builds_on<I, S>(&self, builder_names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.inner.lock_state();
        for name in builder_names {
            let name = name.into();
            if !state.pending.contains(&name) {
                state.pending.push(name);
            }
        }
        if state.running && !state.pending.is_empty() {
            self.activate(&mut state);
        }
    }

    pub fn maybe_start_builds_on_all(&self) {
        if let Some(starter) = self.inner.starter.upgrade() {
            self.maybe_start_builds_on(starter.builder_names());
        }
    }

    fn activate(&self, state: &mut DistributorState) {
        if state.active {
            return;
        }
        state.active = true;
        self.inner.quiet.send_replace(false);
        tokio::spawn(self.inner.clone().run());
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, DistributorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn run(self: Arc<Self>) {
        loop {
            let builders = {
                let mut state = self.lock_state();
                if !state.running || state.pending.is_empty() {
                    state.active = false;
                    self.quiet.send_replace(true);
                    return;
                }
                std::mem::take(&mut state.pending)
            };
            self.pass(builders).await;
        }
    }

    async fn pass(&self, builders: Vec<String>) {
        let Some(starter) = self.starter.upgrade() else {
            return;
        };
        let existing = starter.builder_names();
        let builders: Vec<String> = builders
            .into_iter()
            .filter(|name| existing.contains(name))
            .collect();
        if builders.is_empty() {
            return;
        }

        let ordered = match self.prioritizer.prioritize(&self.db, builders.clone()).await {
            Ok(ordered) => reconcile(ordered, &builders),
            Err(e) => {
                error!(error = %e, "Prioritizer failed, using request order");
                builders
            }
        };
        debug!(builders = ?ordered, "Starting admission pass");

        for name in ordered {
            if !self.lock_state().running {
                debug!("Admission stopped mid-pass");
                return;
            }
            self.start_builds_on(starter.as_ref(), &name).await;
        }
    }

    async fn start_builds_on(&self, starter: &dyn BuildStarter, builder_name: &str) {
        let mut retries = 0;
        loop {
            match starter.maybe_start_build(builder_name).await {
                Ok(AttemptOutcome::Started) => retries = 0,
                Ok(AttemptOutcome::Retry) => {
                    retries += 1;
                    if retries >= MAX_RETRIES_PER_BUILDER {
                        warn!(builder = %builder_name, retries, "Giving up on builder for this pass");
                        return;
                    }
                }
                Ok(AttemptOutcome::StopBuilder) => return,
                Err(e) => {
                    error!(builder = %builder_name, error = %e, "Failed to start build");
                    return;
                }
            }
            if !self.lock_state().running {
                return;
            }
        }
    }
}

/// Keep the prioritizer's order but make sure every builder of the pass
/// appears exactly once.
fn reconcile(ordered: Vec<String>, builders: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut result: Vec<String> = ordered
        .into_iter()
        .filter(|name| builders.contains(name) && seen.insert(name.clone()))
        .collect();
    result.extend(builders.iter().filter(|name| !seen.contains(*name)).cloned());
    result
}
