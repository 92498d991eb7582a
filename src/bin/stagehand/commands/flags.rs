//! `stagehand flags` command

use anyhow::{Context, Result};
use serde::Serialize;

use crate::cli::{Cli, FlagsArgs};
use stagehand::components;
use stagehand::core::flags::FlagKind;
use stagehand::GlobalInput;

#[derive(Serialize)]
struct FlagEntry<'a> {
    name: &'a str,
    component: &'a str,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    env: Option<&'a str>,
    help: &'a str,
}

fn kind_name(kind: FlagKind) -> &'static str {
    match kind {
        FlagKind::String => "string",
        FlagKind::Bool => "bool",
        FlagKind::List => "list",
    }
}

pub fn execute(cli: &Cli, args: &FlagsArgs) -> Result<()> {
    let manager = components::manager(GlobalInput::default())?;
    let flags = manager.enabled_flags(cli.preset)?;

    if args.json {
        let entries: Vec<FlagEntry<'_>> = flags
            .iter()
            .map(|d| FlagEntry {
                name: d.flag.name,
                component: d.owner,
                kind: kind_name(d.flag.kind),
                env: d.flag.env,
                help: d.flag.help,
            })
            .collect();
        let json = serde_json::to_string_pretty(&entries).context("failed to serialize flags")?;
        println!("{}", json);
        return Ok(());
    }

    println!("# Component flags for preset `{}`:", cli.preset);
    let width = flags.iter().map(|d| d.flag.name.len()).max().unwrap_or(0) + 2;
    let mut owner = "";
    for d in &flags {
        if d.owner != owner {
            owner = d.owner;
            println!();
            println!("{}:", owner);
        }
        let env = d
            .flag
            .env
            .map(|var| format!(" [env: {}]", var))
            .unwrap_or_default();
        println!(
            "  --{:<width$} {}{}",
            d.flag.name,
            d.flag.help,
            env,
            width = width
        );
    }
    Ok(())
}
