//! KDL configuration parsing for buildmaster.
//!
//! This crate handles parsing of:
//! - Master identity and prioritizer selection
//! - Lock, worker and builder declarations
//! - Scheduler declarations and their change filters

pub mod error;
mod kdl_util;
pub mod master;
pub mod scheduler;

pub use error::{ConfigError, ConfigResult};
pub use master::{
    BuilderConfig, LockConfig, MasterConfig, NextWorkerKind, PrioritizerKind, WorkerConfig,
    load_master_config, parse_master_config,
};
pub use scheduler::{ChangeFilterConfig, SchedulerConfig, SchedulerKind, StringMatcher};
