//! Lock declarations shared by configuration and the scheduler.

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// Scope of a lock identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
pub enum LockKind {
    /// One instance for the whole master.
    #[display("master")]
    Master,
    /// One independent instance per worker, all sharing a configuration.
    #[display("worker")]
    Worker,
}

/// How a holder uses a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum AccessMode {
    /// Shared access; up to `max_count` tokens may be held at once.
    #[display("counting")]
    Counting,
    /// Sole access; no other holder of any mode.
    #[display("exclusive")]
    Exclusive,
}

/// A request for a lock made by a builder or step configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockAccessSpec {
    pub lock_name: String,
    pub mode: AccessMode,
    /// Tokens consumed by a counting access. Ignored for exclusive access.
    pub count: u32,
}

impl LockAccessSpec {
    pub fn counting(lock_name: impl Into<String>) -> Self {
        Self {
            lock_name: lock_name.into(),
            mode: AccessMode::Counting,
            count: 1,
        }
    }

    pub fn exclusive(lock_name: impl Into<String>) -> Self {
        Self {
            lock_name: lock_name.into(),
            mode: AccessMode::Exclusive,
            count: 1,
        }
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }
}
