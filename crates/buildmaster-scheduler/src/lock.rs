//! Counting/exclusive locks with FIFO fairness.
//!
//! A [`BaseLock`] hands out shared ("counting") and sole ("exclusive")
//! access. Requesters that cannot be admitted queue up and are notified,
//! in arrival order, when a release may have made room. A notification is
//! only a hint: the woken requester must check [`BaseLock::is_available`]
//! again and then [`BaseLock::claim`].
//!
//! Worker locks keep one independent [`BaseLock`] per worker. The
//! [`LockRegistry`] owns every lock identity of a master and offers the
//! all-or-nothing claim used when a build is admitted.

use buildmaster_config::LockConfig;
use buildmaster_core::{AccessMode, BuildId, LockAccessSpec, LockKind};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::sync::{broadcast, oneshot};
use tracing::debug;

use crate::{SchedulerError, SchedulerResult};

/// Identifies a lock holder. Builds hold locks, so a holder is a build id.
pub type LockOwner = BuildId;

/// One way of holding a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockAccess {
    pub mode: AccessMode,
    /// Tokens used by a counting access. Exclusive access ignores it.
    pub count: u32,
}

impl LockAccess {
    pub fn counting(count: u32) -> Self {
        Self {
            mode: AccessMode::Counting,
            count,
        }
    }

    pub fn exclusive() -> Self {
        Self {
            mode: AccessMode::Exclusive,
            count: 1,
        }
    }

    pub fn is_exclusive(&self) -> bool {
        self.mode == AccessMode::Exclusive
    }
}

impl From<&LockAccessSpec> for LockAccess {
    fn from(spec: &LockAccessSpec) -> Self {
        match spec.mode {
            AccessMode::Counting => LockAccess::counting(spec.count),
            AccessMode::Exclusive => LockAccess::exclusive(),
        }
    }
}

/// Running totals of what a lock has handed out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockTally {
    pub counting: u32,
    pub exclusive: u32,
}

impl LockTally {
    fn admits(&self, access: LockAccess, max_count: u32) -> bool {
        if access.is_exclusive() {
            self.counting == 0 && self.exclusive == 0
        } else {
            self.exclusive == 0 && self.counting + access.count <= max_count
        }
    }

    fn add(&mut self, access: LockAccess) {
        if access.is_exclusive() {
            self.exclusive += 1;
        } else {
            self.counting += access.count;
        }
    }

    fn remove(&mut self, access: LockAccess) {
        if access.is_exclusive() {
            self.exclusive -= 1;
        } else {
            self.counting -= access.count;
        }
    }
}

#[derive(Debug)]
struct Waiter {
    owner: LockOwner,
    access: LockAccess,
    /// Taken when the waiter is woken.
    notify: Option<oneshot::Sender<()>>,
}

/// Resolves once the lock may be available to the waiter.
///
/// Also resolves if the waiter is removed from the queue or the lock goes
/// away, so callers must always re-check availability.
#[derive(Debug)]
pub struct LockWait {
    rx: Option<oneshot::Receiver<()>>,
}

impl LockWait {
    fn ready() -> Self {
        Self { rx: None }
    }
}

impl Future for LockWait {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if let Some(rx) = self.rx.as_mut() {
            // A dropped sender means the entry is gone; that is a wake-up too.
            let _ = ready!(Pin::new(rx).poll(cx));
            self.rx = None;
        }
        Poll::Ready(())
    }
}

/// A single lock instance.
#[derive(Debug)]
pub struct BaseLock {
    name: String,
    max_count: u32,
    owners: Vec<(LockOwner, LockAccess)>,
    waiting: Vec<Waiter>,
    tally: LockTally,
}

impl BaseLock {
    pub fn new(name: impl Into<String>, max_count: u32) -> Self {
        Self {
            name: name.into(),
            max_count,
            owners: Vec::new(),
            waiting: Vec::new(),
            tally: LockTally::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_count(&self) -> u32 {
        self.max_count
    }

    pub fn tally(&self) -> LockTally {
        self.tally
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_idle(&self) -> bool {
        self.owners.is_empty() && self.waiting.is_empty()
    }

    /// Walk the first `upto` waiters in order, granting each one on top of
    /// the current holders for as long as that is possible. Returns how
    /// many were granted and the tally afterwards.
    ///
    /// Availability checks and wake-ups both use this walk, so a requester
    /// is only ever admitted when everyone queued ahead of it could have
    /// been admitted first.
    fn grant_scan(&self, upto: usize) -> (usize, LockTally) {
        let mut tally = self.tally;
        for (granted, waiter) in self.waiting.iter().take(upto).enumerate() {
            if !tally.admits(waiter.access, self.max_count) {
                return (granted, tally);
            }
            tally.add(waiter.access);
        }
        (upto.min(self.waiting.len()), tally)
    }

    fn queue_position(&self, owner: LockOwner) -> Option<usize> {
        self.waiting.iter().position(|w| w.owner == owner)
    }

    /// Whether `owner` could take `access` now without overtaking anyone
    /// queued ahead of it. A requester that is not queued is behind
    /// everyone.
    pub fn is_available(&self, owner: LockOwner, access: LockAccess) -> bool {
        let ahead = self.queue_position(owner).unwrap_or(self.waiting.len());
        let (granted, tally) = self.grant_scan(ahead);
        granted == ahead && tally.admits(access, self.max_count)
    }

    /// Take the lock. The caller must have checked [`Self::is_available`].
    pub fn claim(&mut self, owner: LockOwner, access: LockAccess) {
        debug_assert!(
            self.is_available(owner, access),
            "lock {} claimed while unavailable",
            self.name
        );
        self.waiting.retain(|w| w.owner != owner);
        self.owners.push((owner, access));
        self.tally.add(access);
        debug!(lock = %self.name, %owner, mode = %access.mode, "Lock claimed");
    }

    /// Give the lock back and wake whoever can now proceed. Releasing a
    /// lock that is not held is a no-op; returns whether it was held.
    pub fn release(&mut self, owner: LockOwner, access: LockAccess) -> bool {
        let Some(index) = self
            .owners
            .iter()
            .position(|(o, a)| *o == owner && *a == access)
        else {
            return false;
        };
        self.owners.remove(index);
        self.tally.remove(access);
        debug!(lock = %self.name, %owner, mode = %access.mode, "Lock released");
        self.wake_up();
        true
    }

    fn wake_up(&mut self) {
        let (granted, _) = self.grant_scan(self.waiting.len());
        for waiter in self.waiting.iter_mut().take(granted) {
            if let Some(notify) = waiter.notify.take() {
                let _ = notify.send(());
            }
        }
    }

    /// Queue `owner` for `access`, or resolve at once if it could claim
    /// now. Waiting again replaces the owner's previous queue entry and
    /// keeps its place.
    pub fn wait_until_maybe_available(&mut self, owner: LockOwner, access: LockAccess) -> LockWait {
        if self.is_available(owner, access) {
            return LockWait::ready();
        }
        let (tx, rx) = oneshot::channel();
        match self.waiting.iter_mut().find(|w| w.owner == owner) {
            Some(waiter) => {
                waiter.access = access;
                waiter.notify = Some(tx);
            }
            None => self.waiting.push(Waiter {
                owner,
                access,
                notify: Some(tx),
            }),
        }
        LockWait { rx: Some(rx) }
    }

    /// Leave the queue. If the owner had already been woken, the room it
    /// was woken for is offered to the next waiters.
    pub fn stop_waiting_until_available(&mut self, owner: LockOwner, access: LockAccess) {
        let Some(index) = self.queue_position(owner) else {
            return;
        };
        let waiter = self.waiting.remove(index);
        debug_assert_eq!(waiter.access, access);
        if waiter.notify.is_none() {
            self.wake_up();
        }
    }

    pub fn is_owner(&self, owner: LockOwner, access: LockAccess) -> bool {
        self.owners.iter().any(|(o, a)| *o == owner && *a == access)
    }

    /// Whether `owner` holds this lock in any mode.
    pub fn holds(&self, owner: LockOwner) -> bool {
        self.owners.iter().any(|(o, _)| *o == owner)
    }

    pub fn set_max_count(&mut self, max_count: u32) {
        if self.max_count != max_count {
            self.max_count = max_count;
            self.wake_up();
        }
    }
}

/// A family of locks, one per worker, sharing a name and configuration.
#[derive(Debug)]
pub struct WorkerLock {
    name: String,
    max_count: u32,
    max_count_for_worker: BTreeMap<String, u32>,
    locks: HashMap<String, BaseLock>,
}

impl WorkerLock {
    pub fn new(config: &LockConfig) -> Self {
        Self {
            name: config.name.clone(),
            max_count: config.max_count,
            max_count_for_worker: config.max_count_for_worker.clone(),
            locks: HashMap::new(),
        }
    }

    fn max_count_for(&self, worker: &str) -> u32 {
        self.max_count_for_worker
            .get(worker)
            .copied()
            .unwrap_or(self.max_count)
    }

    /// The instance for `worker`, created on first use.
    pub fn for_worker(&mut self, worker: &str) -> &mut BaseLock {
        let max_count = self.max_count_for(worker);
        let name = &self.name;
        self.locks
            .entry(worker.to_string())
            .or_insert_with(|| BaseLock::new(format!("{}@{}", name, worker), max_count))
    }

    pub fn get(&self, worker: &str) -> Option<&BaseLock> {
        self.locks.get(worker)
    }

    fn update(&mut self, config: &LockConfig) {
        self.max_count = config.max_count;
        self.max_count_for_worker = config.max_count_for_worker.clone();
        let limits: Vec<(String, u32)> = self
            .locks
            .keys()
            .map(|worker| (worker.clone(), self.max_count_for(worker)))
            .collect();
        for (worker, max_count) in limits {
            if let Some(lock) = self.locks.get_mut(&worker) {
                lock.set_max_count(max_count);
            }
        }
    }
}

#[derive(Debug)]
enum LockIdentity {
    Master(BaseLock),
    Worker(WorkerLock),
}

impl LockIdentity {
    fn kind(&self) -> LockKind {
        match self {
            LockIdentity::Master(_) => LockKind::Master,
            LockIdentity::Worker(_) => LockKind::Worker,
        }
    }

    fn is_idle(&self) -> bool {
        match self {
            LockIdentity::Master(lock) => lock.is_idle(),
            LockIdentity::Worker(family) => family.locks.values().all(BaseLock::is_idle),
        }
    }
}

/// A lock access bound to the concrete instance it applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAccess {
    pub lock_name: String,
    /// Set for worker locks: whose instance to use.
    pub worker: Option<String>,
    pub access: LockAccess,
}

/// Every lock identity of a master, keyed by name.
///
/// Identities survive reconfiguration: a lock that keeps its name and kind
/// keeps its holders and queue, and only its limits change.
#[derive(Debug)]
pub struct LockRegistry {
    locks: HashMap<String, LockIdentity>,
    released: broadcast::Sender<String>,
}

impl Default for LockRegistry {
    fn default() -> Self {
        let (released, _) = broadcast::channel(256);
        Self {
            locks: HashMap::new(),
            released,
        }
    }
}

impl LockRegistry {
    pub fn new(configs: &[LockConfig]) -> Self {
        let mut registry = Self::default();
        registry.reconfigure(configs);
        registry
    }

    /// Names of locks that were just released. Receivers should treat a
    /// name as a hint to retry whatever was blocked on it.
    pub fn subscribe_released(&self) -> broadcast::Receiver<String> {
        self.released.subscribe()
    }

    /// Apply new lock declarations. Locks that disappeared from the
    /// configuration are dropped once nobody holds or waits for them.
    pub fn reconfigure(&mut self, configs: &[LockConfig]) {
        for config in configs {
            match self.locks.get_mut(&config.name) {
                Some(LockIdentity::Master(lock)) if config.kind == LockKind::Master => {
                    lock.set_max_count(config.max_count);
                }
                Some(LockIdentity::Worker(family)) if config.kind == LockKind::Worker => {
                    family.update(config);
                }
                _ => {
                    let identity = match config.kind {
                        LockKind::Master => {
                            LockIdentity::Master(BaseLock::new(&config.name, config.max_count))
                        }
                        LockKind::Worker => LockIdentity::Worker(WorkerLock::new(config)),
                    };
                    self.locks.insert(config.name.clone(), identity);
                }
            }
        }
        self.locks.retain(|name, identity| {
            configs.iter().any(|c| &c.name == name) || !identity.is_idle()
        });
    }

    pub fn kind_of(&self, name: &str) -> Option<LockKind> {
        self.locks.get(name).map(LockIdentity::kind)
    }

    /// Bind lock accesses to the instances a build on `worker` would use.
    /// The same lock named twice is merged into its most demanding access.
    pub fn resolve<'a>(
        &self,
        specs: impl IntoIterator<Item = &'a LockAccessSpec>,
        worker: &str,
    ) -> SchedulerResult<Vec<ResolvedAccess>> {
        let mut resolved: Vec<ResolvedAccess> = Vec::new();
        for spec in specs {
            let kind = self
                .kind_of(&spec.lock_name)
                .ok_or_else(|| SchedulerError::UnknownLock(spec.lock_name.clone()))?;
            let access = LockAccess::from(spec);
            if let Some(existing) = resolved.iter_mut().find(|r| r.lock_name == spec.lock_name) {
                existing.access = merge_access(existing.access, access);
                continue;
            }
            resolved.push(ResolvedAccess {
                lock_name: spec.lock_name.clone(),
                worker: (kind == LockKind::Worker).then(|| worker.to_string()),
                access,
            });
        }
        Ok(resolved)
    }

    pub fn instance(&self, access: &ResolvedAccess) -> Option<&BaseLock> {
        match (self.locks.get(&access.lock_name)?, &access.worker) {
            (LockIdentity::Master(lock), None) => Some(lock),
            (LockIdentity::Worker(family), Some(worker)) => family.get(worker),
            _ => None,
        }
    }

    pub fn instance_mut(&mut self, access: &ResolvedAccess) -> Option<&mut BaseLock> {
        match (self.locks.get_mut(&access.lock_name)?, &access.worker) {
            (LockIdentity::Master(lock), None) => Some(lock),
            (LockIdentity::Worker(family), Some(worker)) => Some(family.for_worker(worker)),
            _ => None,
        }
    }

    /// Whether `owner` already holds the instance `access` refers to,
    /// whatever access it was claimed with.
    pub fn holds(&self, owner: LockOwner, access: &ResolvedAccess) -> bool {
        self.instance(access).is_some_and(|lock| lock.holds(owner))
    }

    pub fn is_available(&self, owner: LockOwner, access: &ResolvedAccess) -> bool {
        match self.instance(access) {
            Some(lock) => lock.is_available(owner, access.access),
            // A worker lock instance nobody has touched yet is free.
            None => match (self.locks.get(&access.lock_name), &access.worker) {
                (Some(LockIdentity::Worker(family)), Some(worker)) => {
                    LockTally::default().admits(access.access, family.max_count_for(worker))
                }
                _ => false,
            },
        }
    }

    pub fn is_available_all(&self, owner: LockOwner, accesses: &[ResolvedAccess]) -> bool {
        accesses.iter().all(|a| self.is_available(owner, a))
    }

    /// Claim every access, or none of them.
    pub fn try_claim_all(&mut self, owner: LockOwner, accesses: &[ResolvedAccess]) -> bool {
        if !self.is_available_all(owner, accesses) {
            return false;
        }
        for access in accesses {
            if let Some(lock) = self.instance_mut(access) {
                lock.claim(owner, access.access);
            }
        }
        true
    }

    pub fn release(&mut self, owner: LockOwner, access: &ResolvedAccess) -> bool {
        let released = self
            .instance_mut(access)
            .is_some_and(|lock| lock.release(owner, access.access));
        if released {
            // Nobody listening is fine.
            let _ = self.released.send(access.lock_name.clone());
        }
        released
    }

    pub fn release_all(&mut self, owner: LockOwner, accesses: &[ResolvedAccess]) {
        for access in accesses {
            self.release(owner, access);
        }
    }

    pub fn wait_until_maybe_available(
        &mut self,
        owner: LockOwner,
        access: &ResolvedAccess,
    ) -> SchedulerResult<LockWait> {
        let lock = self
            .instance_mut(access)
            .ok_or_else(|| SchedulerError::UnknownLock(access.lock_name.clone()))?;
        Ok(lock.wait_until_maybe_available(owner, access.access))
    }

    pub fn stop_waiting_until_available(&mut self, owner: LockOwner, access: &ResolvedAccess) {
        if let Some(lock) = self.instance_mut(access) {
            lock.stop_waiting_until_available(owner, access.access);
        }
    }
}

/// The more demanding of two accesses to the same lock.
fn merge_access(a: LockAccess, b: LockAccess) -> LockAccess {
    if a.is_exclusive() || b.is_exclusive() {
        LockAccess::exclusive()
    } else {
        LockAccess::counting(a.count.max(b.count))
    }
}
