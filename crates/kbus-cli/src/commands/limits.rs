//! `kbus limits`: print the effective configuration.

use anyhow::{Context, Result};
use kbus_core::BusConfig;

/// Prints `config` as TOML.
pub fn run(config: &BusConfig) -> Result<()> {
    let text = config.to_toml().context("failed to render limits")?;
    print!("{text}");
    Ok(())
}
