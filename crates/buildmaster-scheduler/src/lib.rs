//! Build scheduling for buildmaster.
//!
//! Turns changes into build requests and build requests into builds:
//! tree-stable change classification, FIFO-fair build locks, worker slots,
//! and the distributor that admits builds one builder at a time.

pub mod botmaster;
pub mod builder;
pub mod classifier;
pub mod distributor;
pub mod error;
pub mod events;
pub mod lock;
pub mod worker;
pub mod worker_slot;

pub use botmaster::{BotMaster, BotMasterBuilder, BuildContext, BuildRunner};
pub use builder::Builder;
pub use classifier::{ChangeClassifier, ChangeFilter, Importance, TimerKey, TimerPolicy};
pub use distributor::{
    AttemptOutcome, BuildRequestDistributor, BuildStarter, DefaultPrioritizer, Prioritizer,
    UnsortedPrioritizer,
};
pub use error::{SchedulerError, SchedulerResult};
pub use events::BuildRequestEvent;
pub use lock::{BaseLock, LockAccess, LockOwner, LockRegistry, LockWait, ResolvedAccess, WorkerLock};
pub use worker::{LatentController, RemoteCommand, Worker, WorkerConnection};
pub use worker_slot::{SlotId, SlotState, SlotTable, WorkerSlot};
