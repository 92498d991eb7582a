//! `stagehand assemble` command

use anyhow::{Context, Result};

use crate::cli::{AssembleArgs, Cli};
use crate::commands::global_input;
use stagehand::components;
use stagehand::core::flags::FlagValues;
use stagehand::util::cancel::CancelToken;
use stagehand::util::fs::tree_digest;
use stagehand::util::shell::{Shell, Status};
use stagehand::RunMode;

pub fn execute(
    cli: &Cli,
    args: &AssembleArgs,
    flags: FlagValues,
    shell: &Shell,
    cancel: &CancelToken,
) -> Result<()> {
    let mode = if args.plan {
        RunMode::Plan
    } else {
        RunMode::Assemble
    };
    let input = global_input(cli, flags, mode, cancel)?;
    let mut manager = components::manager(input)?;

    if !args.plan {
        shell.status(
            Status::Assembling,
            format!("preset {} into {}", cli.preset, cli.base_dir.display()),
        );
    }
    let report = manager.run(cli.preset)?;

    if args.plan {
        let json = serde_json::to_string_pretty(&report.plan).context("failed to serialize plan")?;
        println!("{}", json);
        return Ok(());
    }

    for path in &report.written {
        shell.status(Status::Written, path.display());
    }
    if shell.is_verbose() {
        shell.note(format!("component order: {}", report.order.join(" -> ")));
        for bundle in manager.bundles().iter() {
            let dir = cli.base_dir.join(bundle.name);
            if dir.is_dir() {
                shell.note(format!("bundle `{}` digest {}", bundle.name, tree_digest(&dir)?));
            }
        }
    }
    shell.status(
        Status::Finished,
        format!(
            "{} components, {} operations, {} changed",
            report.order.len(),
            report.plan.op_count(),
            report.changed
        ),
    );
    Ok(())
}
