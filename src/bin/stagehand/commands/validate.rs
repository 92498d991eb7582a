//! `stagehand validate` command

use anyhow::Result;

use crate::cli::Cli;
use crate::commands::global_input;
use stagehand::components;
use stagehand::core::flags::FlagValues;
use stagehand::util::cancel::CancelToken;
use stagehand::util::shell::{Shell, Status};
use stagehand::RunMode;

pub fn execute(cli: &Cli, flags: FlagValues, shell: &Shell, cancel: &CancelToken) -> Result<()> {
    let input = global_input(cli, flags, RunMode::ValidateOnly, cancel)?;
    let report = components::manager(input)?.run(cli.preset)?;

    shell.status(
        Status::Passed,
        format!("{} components validated for preset {}", report.order.len(), cli.preset),
    );
    Ok(())
}
