//! Command implementations

pub mod assemble;
pub mod completions;
pub mod flags;
pub mod validate;

use anyhow::Result;

use crate::cli::Cli;
use stagehand::core::flags::FlagValues;
use stagehand::util::cancel::CancelToken;
use stagehand::util::config::{global_config_path, load_config, project_config_path, Config};
use stagehand::{Defaults, GlobalInput, RunMode, Topology};

/// Run-wide input from the global options.
pub fn global_input(cli: &Cli, flags: FlagValues, mode: RunMode, cancel: &CancelToken) -> Result<GlobalInput> {
    let topology = match &cli.topology {
        Some(path) => Topology::load(path)?,
        None => Topology::default(),
    };
    let defaults = match &cli.defaults {
        Some(path) => Defaults::load_overlay(path)?,
        None => Defaults::builtin(),
    };
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => load_config(
            global_config_path().as_deref(),
            &project_config_path(&cli.base_dir),
        ),
    };

    Ok(GlobalInput {
        base_dir: cli.base_dir.clone(),
        topology,
        flags,
        defaults,
        config,
        mode,
        cancel: cancel.clone(),
    })
}
