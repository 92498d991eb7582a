//! CLI definitions using clap.
//!
//! Component flags are not part of the derive; they are attached to
//! `assemble` and `validate` at runtime from the registered components.

use std::path::PathBuf;

use clap::{Args, Command, Parser, Subcommand};
use clap_complete::Shell as CompletionShell;

use stagehand::core::flags::DeclaredFlag;
use stagehand::util::shell::ColorChoice;
use stagehand::Preset;

/// Stagehand - assembles air-gapped installer bundles for a control plane
#[derive(Parser)]
#[command(name = "stagehand")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Deployment preset
    #[arg(long, global = true, default_value = "lab", env = "STAGEHAND_PRESET")]
    pub preset: Preset,

    /// Output directory holding the persisted state and the bundles
    #[arg(long, global = true, default_value = ".", env = "STAGEHAND_BASE_DIR")]
    pub base_dir: PathBuf,

    /// Topology file (YAML) describing the control nodes
    #[arg(long, global = true)]
    pub topology: Option<PathBuf>,

    /// Defaults overlay (YAML) replacing built-in artifact coordinates
    #[arg(long, global = true)]
    pub defaults: Option<PathBuf>,

    /// Tool configuration file, instead of <base-dir>/.stagehand/config.toml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print errors only
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Color output: auto, always, never
    #[arg(long, global = true, default_value = "auto")]
    pub color: ColorChoice,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Hydrate, build, and persist every bundle
    Assemble(AssembleArgs),

    /// Hydrate and run the consistency checks without building
    Validate,

    /// List the component flags accepted for the preset
    Flags(FlagsArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Args)]
pub struct AssembleArgs {
    /// Print the operation plan as JSON instead of executing it
    #[arg(long)]
    pub plan: bool,
}

#[derive(Args)]
pub struct FlagsArgs {
    /// Print the listing as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: CompletionShell,
}

/// Subcommands that accept component flags.
pub const FLAG_COMMANDS: &[&str] = &["assemble", "validate"];

/// Attach component flags to the commands that accept them.
pub fn with_component_flags(mut cmd: Command, declared: &[DeclaredFlag]) -> Command {
    for name in FLAG_COMMANDS {
        cmd = cmd.mut_subcommand(*name, |sub| {
            let heading = "Component flags";
            sub.args(declared.iter().map(|d| d.flag.to_arg().help_heading(heading)))
        });
    }
    cmd
}
