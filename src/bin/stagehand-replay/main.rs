//! stagehand-replay - runs an installer bundle's recipe on the target host

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use stagehand::ops::replay::{load_recipe, ReplayOptions, Replayer, SystemRunner};
use stagehand::util::cancel::{cancel_on_interrupt, CancelToken};
use stagehand::util::config::{global_config_path, load_config, project_config_path, Config};
use stagehand::util::diagnostic::{emit, Diagnostic};
use stagehand::util::shell::{ColorChoice, Shell, Status};
use stagehand::Stage;

/// Replay the install steps of an assembled bundle
#[derive(Parser)]
#[command(name = "stagehand-replay")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Installer bundle directory containing recipe.yaml
    bundle_dir: PathBuf,

    /// Skip every stage below this one
    #[arg(long, value_name = "STAGE")]
    from_stage: Option<u8>,

    /// List the steps without running them
    #[arg(long)]
    dry_run: bool,

    /// Tool configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Print errors only
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Color output: auto, always, never
    #[arg(long, default_value = "auto")]
    color: ColorChoice,
}

fn main() {
    let cli = Cli::parse();
    let shell = Shell::from_flags(cli.quiet, cli.verbose, cli.color);

    let filter = if cli.verbose {
        EnvFilter::new("stagehand=debug")
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
        notice.warn("interrupted; stopping the current step (Ctrl-C again to abort)")
    }) {
        tracing::warn!("failed to install the interrupt handler: {}", e);
    }

    if let Err(e) = run(&cli, &shell, cancel) {
        emit(&Diagnostic::from_error(&e), shell.use_color());
        std::process::exit(1);
    }
}

fn run(cli: &Cli, shell: &Shell, cancel: CancelToken) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => load_config(
            global_config_path().as_deref(),
            &project_config_path(&cli.bundle_dir),
        ),
    };
    let recipe = load_recipe(&cli.bundle_dir)?;
    let options = ReplayOptions {
        from_stage: cli.from_stage.map(Stage::new),
        dry_run: cli.dry_run,
    };

    let runner = SystemRunner::new(&cli.bundle_dir, &config, cancel.clone());
    if !cli.dry_run {
        shell.status(
            Status::Replaying,
            format!("bundle `{}` ({} steps)", recipe.bundle, recipe.ops.len()),
        );
    }
    let report = Replayer::new(&runner, shell, cancel).replay(&recipe, &options)?;

    if !report.skipped.is_empty() {
        shell.status(Status::Skipped, format!("{} steps before the start stage", report.skipped.len()));
    }
    let verb = if cli.dry_run { "planned" } else { "completed" };
    shell.status(Status::Finished, format!("{} steps {}", report.executed.len(), verb));
    Ok(())
}
