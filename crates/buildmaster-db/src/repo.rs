//! Repository traits and implementations.

pub mod buildrequest;
pub mod change;
pub mod scheduler;

pub use buildrequest::{BuildRequestRepo, NewBuildset, PgBuildRequestRepo};
pub use change::{ChangeRepo, PgChangeRepo};
pub use scheduler::{ClassificationFilter, PgSchedulerRepo, SchedulerRepo};
