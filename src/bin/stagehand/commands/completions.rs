//! `stagehand completions` command
//!
//! Generates shell completions, component flags included.

use std::io;

use anyhow::Result;
use clap::CommandFactory;
use clap_complete::generate;

use crate::cli::{with_component_flags, Cli, CompletionsArgs};
use stagehand::core::flags::DeclaredFlag;

pub fn execute(args: &CompletionsArgs, declared: &[DeclaredFlag]) -> Result<()> {
    let mut cmd = with_component_flags(Cli::command(), declared);
    let name = cmd.get_name().to_string();

    generate(args.shell, &mut cmd, name, &mut io::stdout());

    Ok(())
}
