//! The zilc executable.

use anyhow::Result;
use clap::Parser;

use zilc_cli::commands::CompileCommand;

fn main() -> Result<()> {
    env_logger::init();
    CompileCommand::parse().execute()
}
