//! Core domain types for the buildmaster CI orchestrator.
//!
//! This crate contains:
//! - Resource and row identifiers
//! - Changes and source stamps
//! - Build requests and build results
//! - Lock declarations

pub mod buildrequest;
pub mod change;
pub mod error;
pub mod id;
pub mod lock;

pub use buildrequest::{BuildRequest, BuildResult};
pub use change::{Change, ChangeKey, SourceStamp};
pub use error::{Error, Result};
pub use id::{BuildId, BuildRequestId, BuildsetId, ChangeId, MasterId, ResourceId, SchedulerId};
pub use lock::{AccessMode, LockAccessSpec, LockKind};
