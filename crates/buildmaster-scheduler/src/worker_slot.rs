//! The pairing of one builder with one worker, and its state machine.
//!
//! ```text
//! ATTACHING --handshake--> IDLE --start--> BUILDING --finish--> IDLE
//! LATENT --start--> SUBSTANTIATING --up--> BUILDING --finish--> LATENT
//! SUBSTANTIATING --failed--> LATENT
//! IDLE/BUILDING --ping--> PINGING --answer--> previous state
//! any --detach--> ATTACHING (concrete) or LATENT (latent)
//! ```

use derive_more::Display;
use std::collections::BTreeMap;
use tokio::sync::oneshot;

use crate::worker::Worker;
use crate::{SchedulerError, SchedulerResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum SlotState {
    #[display("attaching")]
    Attaching,
    #[display("idle")]
    Idle,
    #[display("pinging")]
    Pinging,
    #[display("building")]
    Building,
    #[display("latent")]
    Latent,
    #[display("substantiating")]
    Substantiating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[display("slot-{_0}")]
pub struct SlotId(u64);

#[derive(Debug)]
pub struct WorkerSlot {
    id: SlotId,
    builder_name: String,
    worker_name: String,
    latent: bool,
    state: SlotState,
    /// State to return to once the in-flight ping is answered.
    state_before_ping: Option<SlotState>,
    ping_watchers: Vec<oneshot::Sender<bool>>,
}

impl WorkerSlot {
    fn new(id: SlotId, builder_name: &str, worker_name: &str, latent: bool) -> Self {
        Self {
            id,
            builder_name: builder_name.to_string(),
            worker_name: worker_name.to_string(),
            latent,
            state: if latent {
                SlotState::Latent
            } else {
                SlotState::Attaching
            },
            state_before_ping: None,
            ping_watchers: Vec::new(),
        }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn builder_name(&self) -> &str {
        &self.builder_name
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    pub fn is_latent(&self) -> bool {
        self.latent
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    /// The state underneath an in-flight ping.
    pub fn logical_state(&self) -> SlotState {
        self.state_before_ping.unwrap_or(self.state)
    }

    pub fn is_busy(&self) -> bool {
        !matches!(self.state, SlotState::Idle | SlotState::Latent)
    }

    /// Whether a new build could be placed on this slot.
    pub fn is_available(&self, worker: &Worker) -> bool {
        if self.is_busy() {
            return false;
        }
        self.latent || worker.can_start_build()
    }

    /// Move the logical state. While a ping is in flight the slot stays
    /// `PINGING` and the answer restores the new state instead.
    fn transition(&mut self, from: &[SlotState], to: SlotState) -> SchedulerResult<()> {
        let current = self.logical_state();
        if !from.contains(&current) {
            return Err(SchedulerError::InvalidSlotTransition {
                slot: format!("{}/{}", self.builder_name, self.worker_name),
                from: current.to_string(),
                to: to.to_string(),
            });
        }
        match self.state_before_ping.as_mut() {
            Some(previous) => *previous = to,
            None => self.state = to,
        }
        Ok(())
    }

    /// The worker answered the attach handshake.
    pub fn attached(&mut self) -> SchedulerResult<()> {
        self.transition(&[SlotState::Attaching], SlotState::Idle)
    }

    pub fn start_build(&mut self) -> SchedulerResult<()> {
        if self.latent {
            self.transition(&[SlotState::Latent], SlotState::Substantiating)
        } else {
            self.transition(&[SlotState::Idle], SlotState::Building)
        }
    }

    pub fn substantiated(&mut self) -> SchedulerResult<()> {
        self.transition(&[SlotState::Substantiating], SlotState::Building)
    }

    pub fn substantiation_failed(&mut self) -> SchedulerResult<()> {
        self.transition(&[SlotState::Substantiating], SlotState::Latent)
    }

    pub fn build_finished(&mut self) -> SchedulerResult<()> {
        let to = if self.latent {
            SlotState::Latent
        } else {
            SlotState::Idle
        };
        self.transition(&[SlotState::Building], to)
    }

    /// The worker went away. Pending pings are answered negatively.
    pub fn detached(&mut self) {
        self.state = if self.latent {
            SlotState::Latent
        } else {
            SlotState::Attaching
        };
        self.state_before_ping = None;
        for watcher in self.ping_watchers.drain(..) {
            let _ = watcher.send(false);
        }
    }

    /// Register interest in a ping. Returns `true` for the first watcher,
    /// which must send the actual ping and report back through
    /// [`Self::ping_answered`]; later watchers share that answer.
    pub fn watch_ping(&mut self, watcher: oneshot::Sender<bool>) -> bool {
        self.ping_watchers.push(watcher);
        if self.state_before_ping.is_some() {
            return false;
        }
        self.state_before_ping = Some(self.state);
        self.state = SlotState::Pinging;
        true
    }

    pub fn ping_answered(&mut self, alive: bool) {
        if let Some(previous) = self.state_before_ping.take() {
            if self.state == SlotState::Pinging {
                self.state = previous;
            }
        }
        for watcher in self.ping_watchers.drain(..) {
            let _ = watcher.send(alive);
        }
    }
}

/// Every slot of a master, in creation order.
#[derive(Debug, Default)]
pub struct SlotTable {
    slots: BTreeMap<SlotId, WorkerSlot>,
    next_id: u64,
}

impl SlotTable {
    pub fn insert(&mut self, builder_name: &str, worker_name: &str, latent: bool) -> SlotId {
        self.next_id += 1;
        let id = SlotId(self.next_id);
        self.slots
            .insert(id, WorkerSlot::new(id, builder_name, worker_name, latent));
        id
    }

    pub fn get(&self, id: SlotId) -> Option<&WorkerSlot> {
        self.slots.get(&id)
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut WorkerSlot> {
        self.slots.get_mut(&id)
    }

    pub fn remove(&mut self, id: SlotId) -> Option<WorkerSlot> {
        self.slots.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerSlot> {
        self.slots.values()
    }

    pub fn find(&self, builder_name: &str, worker_name: &str) -> Option<SlotId> {
        self.slots
            .values()
            .find(|s| s.builder_name == builder_name && s.worker_name == worker_name)
            .map(WorkerSlot::id)
    }

    pub fn for_builder<'a>(&'a self, builder_name: &'a str) -> impl Iterator<Item = &'a WorkerSlot> {
        self.slots
            .values()
            .filter(move |s| s.builder_name == builder_name)
    }

    pub fn for_worker<'a>(&'a self, worker_name: &'a str) -> impl Iterator<Item = &'a WorkerSlot> {
        self.slots
            .values()
            .filter(move |s| s.worker_name == worker_name)
    }
}
