//! The module that implements the `mrt config` command.

use anyhow::{Context, Result};
use clap::Parser;
use mrt_runtime::RuntimeConfig;
use std::path::PathBuf;

/// Prints the effective runtime configuration as TOML.
#[derive(Parser)]
pub struct ConfigCommand {
    /// A configuration file to start from instead of the defaults.
    #[arg(long, value_name = "FILE")]
    file: Option<PathBuf>,

    /// Ignore `MRT_*` environment variables.
    #[arg(long)]
    no_env: bool,
}

impl ConfigCommand {
    /// Executes the command.
    pub fn execute(self) -> Result<()> {
        let mut config = match &self.file {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read `{}`", path.display()))?;
                RuntimeConfig::from_toml(&text)
                    .with_context(|| format!("failed to parse `{}`", path.display()))?
            }
            None => RuntimeConfig::new(),
        };
        if !self.no_env {
            config.apply_env(|var| std::env::var(var).ok())?;
        }
        print!("{}", toml::to_string(&config)?);
        Ok(())
    }
}
