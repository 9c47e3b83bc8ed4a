//! The `mrt` command line tool.
//!
//! Simulates managed stacks described by scenario files and runs the
//! runtime's stack walks over them. See `mrt --help` for usage.

use anyhow::Result;
use clap::Parser;

/// Managed runtime stack-walk explorer
#[derive(Parser)]
#[command(
    name = "mrt",
    version = version(),
    after_help = "Usage examples:\n\
                  \n\
                  Printing the frames and roots a GC walk finds:\n\
                  \n  \
                  mrt walk scenario.toml\n\
                  \n\
                  Running the exception dispatch walk instead:\n\
                  \n  \
                  mrt walk --seed exception scenario.toml\n"
)]
struct Mrt {
    #[command(subcommand)]
    subcommand: Subcommand,
}

/// If MRT_VERSION_INFO is set, use it, otherwise use CARGO_PKG_VERSION.
fn version() -> &'static str {
    option_env!("MRT_VERSION_INFO").unwrap_or(env!("CARGO_PKG_VERSION"))
}

#[derive(Parser)]
enum Subcommand {
    /// Walks the stack described by a scenario file
    Walk(mrt_cli::commands::WalkCommand),

    /// Classifies return addresses
    Classify(mrt_cli::commands::ClassifyCommand),

    /// Prints the effective runtime configuration
    Config(mrt_cli::commands::ConfigCommand),
}

impl Mrt {
    /// Executes the command.
    pub fn execute(self) -> Result<()> {
        match self.subcommand {
            Subcommand::Walk(c) => c.execute(),
            Subcommand::Classify(c) => c.execute(),
            Subcommand::Config(c) => c.execute(),
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();
    Mrt::parse().execute()
}

#[test]
fn verify_cli() {
    use clap::CommandFactory;
    Mrt::command().debug_assert()
}
