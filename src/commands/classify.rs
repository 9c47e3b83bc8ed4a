//! The module that implements the `mrt classify` command.

use crate::scenario::Scenario;
use anyhow::Result;
use clap::Parser;
use mrt_frametable::{FrameTable, standard_thunk_table};
use mrt_unwinder::thunks;
use std::num::ParseIntError;
use std::path::PathBuf;

/// Classifies return addresses against the thunk table scenarios run with.
#[derive(Parser)]
pub struct ClassifyCommand {
    /// Hexadecimal addresses, with or without a `0x` prefix.
    #[arg(required = true, value_parser = parse_address)]
    addresses: Vec<usize>,

    /// Also name the method of this scenario containing each address.
    #[arg(long, value_name = "FILE")]
    scenario: Option<PathBuf>,
}

fn parse_address(s: &str) -> Result<usize, ParseIntError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    usize::from_str_radix(digits, 16)
}

impl ClassifyCommand {
    /// Executes the command.
    pub fn execute(self) -> Result<()> {
        let thunk_table = standard_thunk_table();
        let methods = match &self.scenario {
            Some(path) => Some(FrameTable::new(Scenario::from_file(path)?.methods)?),
            None => None,
        };

        for addr in self.addresses {
            let category = thunk_table.classify(addr);
            print!("{addr:#x}: {category:?}");
            if thunks::is_non_eh_thunk(category) {
                print!(" (non-EH thunk)");
            }
            if let Some((_, method)) = methods.as_ref().and_then(|t| t.lookup(addr)) {
                print!(" in {}+{:#x}", method.name, addr - method.start);
            }
            println!();
        }
        Ok(())
    }
}
