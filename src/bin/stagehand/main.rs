//! Stagehand CLI - assembles staged installer bundles

use anyhow::Result;
use clap::{CommandFactory, FromArgMatches};
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;

use cli::{with_component_flags, Cli, Commands};
use stagehand::components;
use stagehand::core::flags::{DeclaredFlag, FlagValues};
use stagehand::engine::GlobalInput;
use stagehand::util::cancel::{cancel_on_interrupt, CancelToken};
use stagehand::util::diagnostic::{emit, Diagnostic};
use stagehand::util::Shell;

fn main() {
    let declared = match components::manager(GlobalInput::default()).and_then(|m| m.declared_flags()) {
        Ok(declared) => declared,
        Err(e) => {
            emit(&Diagnostic::from_error(&e.into()), false);
            std::process::exit(1);
        }
    };

    let matches = with_component_flags(Cli::command(), &declared).get_matches();
    let cli = match Cli::from_arg_matches(&matches) {
        Ok(cli) => cli,
        Err(e) => e.exit(),
    };

    let shell = Shell::from_flags(cli.quiet, cli.verbose, cli.color);

    // Set up logging
    let filter = if cli.verbose {
        EnvFilter::new("stagehand=debug")
    } else if cli.quiet {
        EnvFilter::new("stagehand=error")
    } else {
        EnvFilter::new("stagehand=info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    let cancel = CancelToken::new();
    let notice = Shell::from_flags(cli.quiet, cli.verbose, cli.color);
    if let Err(e) = cancel_on_interrupt(&cancel, move || {
        notice.warn("interrupted; stopping at the next checkpoint (Ctrl-C again to abort)")
    }) {
        tracing::warn!("failed to install the interrupt handler: {}", e);
    }

    let flags = component_flags(&declared, &matches);
    if let Err(e) = run(cli, flags, &declared, &shell, &cancel) {
        emit(&Diagnostic::from_error(&e), shell.use_color());
        std::process::exit(1);
    }
}

fn component_flags(declared: &[DeclaredFlag], matches: &clap::ArgMatches) -> FlagValues {
    match matches.subcommand() {
        Some((name, sub)) if cli::FLAG_COMMANDS.contains(&name) => FlagValues::from_matches(declared, sub),
        _ => FlagValues::new(),
    }
}

fn run(
    cli: Cli,
    flags: FlagValues,
    declared: &[DeclaredFlag],
    shell: &Shell,
    cancel: &CancelToken,
) -> Result<()> {
    match &cli.command {
        Commands::Assemble(args) => commands::assemble::execute(&cli, args, flags, shell, cancel),
        Commands::Validate => commands::validate::execute(&cli, flags, shell, cancel),
        Commands::Flags(args) => commands::flags::execute(&cli, args),
        Commands::Completions(args) => commands::completions::execute(args, declared),
    }
}
