//! CLI command implementations.

pub mod run;

use anyhow::{Context, Result};
use buildmaster_config::load_master_config;

pub fn validate(path: &str) -> Result<()> {
    let config = load_master_config(path)
        .with_context(|| format!("Configuration error in {}", path))?;
    println!("Configuration is valid");
    println!("  master:     {} (id {})", config.name, config.master_id);
    println!("  locks:      {}", config.locks.len());
    println!("  workers:    {}", config.workers.len());
    println!("  builders:   {}", config.builders.len());
    println!("  schedulers: {}", config.schedulers.len());
    Ok(())
}
