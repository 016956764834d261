//! Command-line interface module
//!
//! Argument parsing with clap.

mod args;

pub use args::CliArgs;
use clap::Parser;

/// Parse the process arguments, exiting with usage on error
pub fn parse_args() -> CliArgs {
    CliArgs::parse()
}
