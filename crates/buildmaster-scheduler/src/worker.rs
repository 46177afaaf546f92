//! Worker connections and per-worker runtime state.

use async_trait::async_trait;
use buildmaster_config::WorkerConfig;
use buildmaster_core::Result;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Handle for a command started on a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub step_id: u32,
    pub command: String,
}

/// The master's side of a connected worker.
#[async_trait]
pub trait WorkerConnection: Send + Sync {
    /// Show a message in the worker's log.
    async fn remote_print(&self, message: &str) -> Result<()>;

    /// Start `command` for step `step_id` of a build.
    async fn remote_start_command(
        &self,
        step_id: u32,
        command: &str,
        args: &[String],
    ) -> Result<RemoteCommand>;

    /// Round-trip check. `Ok(false)` means the worker answered but is not
    /// fit to take work.
    async fn ping(&self) -> Result<bool>;

    async fn keepalive(&self) -> Result<()>;

    /// Drop the connection. The master treats the worker as detached.
    fn lose_connection(&self);
}

/// Starts and stops latent workers.
#[async_trait]
pub trait LatentController: Send + Sync {
    /// Bring the worker up and return its connection once attached.
    async fn substantiate(&self, worker_name: &str) -> Result<Arc<dyn WorkerConnection>>;

    async fn insubstantiate(&self, worker_name: &str) -> Result<()>;
}

/// Runtime state of one configured worker.
pub struct Worker {
    pub config: WorkerConfig,
    pub(crate) connection: Option<Arc<dyn WorkerConnection>>,
    pub(crate) running_builds: usize,
    pub(crate) substantiating: bool,
    /// Callers waiting on the in-flight substantiation.
    pub(crate) substantiation_waiters: Vec<oneshot::Sender<bool>>,
    pub(crate) keepalive: Option<JoinHandle<()>>,
    pub(crate) idle_timer: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            connection: None,
            running_builds: 0,
            substantiating: false,
            substantiation_waiters: Vec::new(),
            keepalive: None,
            idle_timer: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn is_latent(&self) -> bool {
        self.config.latent
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn running_builds(&self) -> usize {
        self.running_builds
    }

    /// Whether the worker takes one more build right now.
    pub fn can_start_build(&self) -> bool {
        if !self.is_latent() && !self.is_connected() {
            return false;
        }
        self.config
            .max_builds
            .is_none_or(|max| self.running_builds < max)
    }

    /// Forget the connection and stop background tasks tied to it.
    pub(crate) fn disconnect(&mut self) -> Option<Arc<dyn WorkerConnection>> {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.abort();
        }
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
        for waiter in self.substantiation_waiters.drain(..) {
            let _ = waiter.send(false);
        }
        self.connection.take()
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.config.name)
            .field("latent", &self.config.latent)
            .field("connected", &self.is_connected())
            .field("running_builds", &self.running_builds)
            .finish()
    }
}
