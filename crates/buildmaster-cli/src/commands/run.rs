//! Run a master in this process.
//!
//! Concrete workers from the configuration are attached as in-process
//! workers that log what they are asked to do. Latent workers are left
//! alone since there is nothing to substantiate them with.

use anyhow::{Context, Result};
use async_trait::async_trait;
use buildmaster_config::load_master_config;
use buildmaster_core::{BuildResult, Change};
use buildmaster_db::{Database, MemoryDb};
use buildmaster_scheduler::{
    BotMaster, BuildContext, BuildRunner, ChangeClassifier, RemoteCommand, SchedulerResult,
    WorkerConnection,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// A worker living inside the master process.
struct LocalWorker {
    name: String,
}

#[async_trait]
impl WorkerConnection for LocalWorker {
    async fn remote_print(&self, message: &str) -> buildmaster_core::Result<()> {
        info!(worker = %self.name, "{}", message);
        Ok(())
    }

    async fn remote_start_command(
        &self,
        step_id: u32,
        command: &str,
        args: &[String],
    ) -> buildmaster_core::Result<RemoteCommand> {
        info!(worker = %self.name, step = step_id, command = %command, args = ?args, "Starting command");
        Ok(RemoteCommand {
            step_id,
            command: command.to_string(),
        })
    }

    async fn ping(&self) -> buildmaster_core::Result<bool> {
        Ok(true)
    }

    async fn keepalive(&self) -> buildmaster_core::Result<()> {
        Ok(())
    }

    fn lose_connection(&self) {
        warn!(worker = %self.name, "Local worker connection dropped");
    }
}

/// Starts a single `build` command per build.
struct CommandRunner;

#[async_trait]
impl BuildRunner for CommandRunner {
    async fn run_build(&self, build: &BuildContext) -> SchedulerResult<BuildResult> {
        build
            .connection
            .remote_print(&format!(
                "build {} for {} ({} requests)",
                build.build_id,
                build.builder_name,
                build.requests.len()
            ))
            .await?;
        let started = build
            .connection
            .remote_start_command(1, "build", &[build.builder_name.clone()])
            .await;
        Ok(match started {
            Ok(_) => BuildResult::Success,
            Err(e) => {
                warn!(build = %build.build_id, error = %e, "Build command failed to start");
                BuildResult::Exception
            }
        })
    }
}

pub async fn run_master(config_path: &str, database_url: Option<&str>) -> Result<()> {
    let config = load_master_config(config_path)
        .with_context(|| format!("Failed to load config file: {}", config_path))?;

    let db = match database_url {
        Some(url) => {
            let pool = buildmaster_db::create_pool(url)
                .await
                .context("Failed to connect to database")?;
            buildmaster_db::run_migrations(&pool)
                .await
                .context("Failed to run migrations")?;
            Database::postgres(pool)
        }
        None => {
            info!("No database configured, keeping state in memory");
            Database::in_memory(Arc::new(MemoryDb::new()))
        }
    };

    let master = BotMaster::builder(config.clone(), db.clone(), Arc::new(CommandRunner)).build();
    master.start();

    for worker in config.workers.iter().filter(|w| !w.latent) {
        let connection = Arc::new(LocalWorker {
            name: worker.name.clone(),
        });
        master
            .attach_worker(&worker.name, connection)
            .await
            .with_context(|| format!("Failed to attach worker {}", worker.name))?;
    }

    // Changes arrive from change sources; none is wired up in-process yet.
    let (changes, _) = broadcast::channel::<Change>(1024);
    let mut schedulers = Vec::new();
    for scheduler_config in &config.schedulers {
        let scheduler = ChangeClassifier::load(scheduler_config, db.clone(), master.event_sender())
            .await
            .with_context(|| format!("Failed to load scheduler {}", scheduler_config.name))?;
        scheduler.start(changes.subscribe()).await;
        schedulers.push(scheduler);
    }

    info!(
        master = %config.name,
        builders = config.builders.len(),
        schedulers = schedulers.len(),
        "Master running, press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    for scheduler in &schedulers {
        scheduler.stop().await;
    }
    if !master.clean_shutdown().await {
        master.stop().await;
    }
    Ok(())
}
