//! The module that implements the `mrt walk` command.

use crate::scenario::{Scenario, Seed};
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

/// Simulates a stack scenario and prints the frames and roots a walk finds.
#[derive(Parser)]
pub struct WalkCommand {
    /// The scenario file.
    scenario: PathBuf,

    /// Where to start the walk, overriding the scenario's `seed`.
    #[arg(long, value_name = "SEED")]
    seed: Option<Seed>,

    /// Report whole stacks conservatively instead of frame by frame.
    #[arg(long)]
    conservative: bool,

    /// Print the report as JSON.
    #[arg(long)]
    json: bool,
}

impl WalkCommand {
    /// Executes the command.
    pub fn execute(self) -> Result<()> {
        let mut scenario = Scenario::from_file(&self.scenario)?;
        if let Some(seed) = self.seed {
            scenario.seed = seed;
        }
        scenario.config.apply_env(|var| std::env::var(var).ok())?;
        if self.conservative {
            scenario.config.conservative_stack_reporting(true);
        }
        log::debug!("walking {} with {:?}", self.scenario.display(), scenario.config);

        let report = scenario.simulate()?;
        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print!("{report}");
        }
        Ok(())
    }
}
