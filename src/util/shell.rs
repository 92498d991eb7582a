//! Centralized terminal output for the CLIs.
//!
//! Status lines go to stderr as `{status:>12} {message}`; machine-readable
//! output (plans, flag listings in JSON) goes to stdout and is printed by the
//! commands themselves. Long waits get an `indicatif` spinner when stderr is
//! a terminal.

use std::fmt::Display;
use std::io::{self, IsTerminal};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

/// Output verbosity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// --quiet: errors only, no spinners
    Quiet,
    #[default]
    Normal,
    /// --verbose: status lines only, no spinners
    Verbose,
}

/// Color output mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorChoice {
    #[default]
    Auto,
    Always,
    Never,
}

impl std::str::FromStr for ColorChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(ColorChoice::Auto),
            "always" => Ok(ColorChoice::Always),
            "never" => Ok(ColorChoice::Never),
            _ => Err(format!(
                "invalid color choice '{}'; expected 'auto', 'always', or 'never'",
                s
            )),
        }
    }
}

/// Status types for output messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    // Success statuses (green)
    Finished,
    Written,
    Passed,

    // In-progress statuses (cyan)
    Assembling,
    Replaying,
    Running,
    Waiting,

    // Info statuses (blue)
    Info,
    Planned,

    // Warning statuses (yellow)
    Skipped,
    Warning,
}

impl Status {
    fn as_str(&self) -> &'static str {
        match self {
            Status::Finished => "Finished",
            Status::Written => "Written",
            Status::Passed => "Passed",
            Status::Assembling => "Assembling",
            Status::Replaying => "Replaying",
            Status::Running => "Running",
            Status::Waiting => "Waiting",
            Status::Info => "Info",
            Status::Planned => "Planned",
            Status::Skipped => "Skipped",
            Status::Warning => "Warning",
        }
    }

    fn color_code(&self) -> &'static str {
        match self {
            Status::Finished | Status::Written | Status::Passed => "\x1b[1;32m",
            Status::Assembling | Status::Replaying | Status::Running | Status::Waiting => "\x1b[1;36m",
            Status::Info | Status::Planned => "\x1b[1;34m",
            Status::Skipped | Status::Warning => "\x1b[1;33m",
        }
    }
}

const STATUS_WIDTH: usize = 12;

/// Central shell for CLI output.
#[derive(Debug, Default)]
pub struct Shell {
    verbosity: Verbosity,
    use_color: bool,
    interactive: bool,
}

impl Shell {
    pub fn new(verbosity: Verbosity, color: ColorChoice) -> Self {
        let interactive = io::stderr().is_terminal();
        let use_color = match color {
            ColorChoice::Auto => interactive,
            ColorChoice::Always => true,
            ColorChoice::Never => false,
        };
        Shell {
            verbosity,
            use_color,
            interactive,
        }
    }

    /// Create a shell from CLI flags; quiet wins over verbose.
    pub fn from_flags(quiet: bool, verbose: bool, color: ColorChoice) -> Self {
        let verbosity = if quiet {
            Verbosity::Quiet
        } else if verbose {
            Verbosity::Verbose
        } else {
            Verbosity::Normal
        };
        Shell::new(verbosity, color)
    }

    pub fn is_quiet(&self) -> bool {
        self.verbosity == Verbosity::Quiet
    }

    pub fn is_verbose(&self) -> bool {
        self.verbosity == Verbosity::Verbose
    }

    pub fn use_color(&self) -> bool {
        self.use_color
    }

    /// Print `{status:>12} {message}`; quiet mode keeps only warnings.
    pub fn status(&self, status: Status, msg: impl Display) {
        if self.is_quiet() && status != Status::Warning {
            return;
        }
        eprintln!("{} {}", self.format_status(status), msg);
    }

    pub fn note(&self, msg: impl Display) {
        self.status(Status::Info, msg);
    }

    pub fn warn(&self, msg: impl Display) {
        self.status(Status::Warning, msg);
    }

    fn format_status(&self, status: Status) -> String {
        let text = status.as_str();
        if self.use_color {
            format!("{}{:>width$}\x1b[0m", status.color_code(), text, width = STATUS_WIDTH)
        } else {
            format!("{:>width$}", text, width = STATUS_WIDTH)
        }
    }

    /// Spinner for an open-ended wait; a status line when not interactive.
    pub fn spinner(&self, status: Status, msg: impl Display) -> Spinner {
        let msg = msg.to_string();
        if self.verbosity != Verbosity::Normal || !self.interactive {
            self.status(status, &msg);
            return Spinner { pb: None };
        }

        let pb = ProgressBar::new_spinner();
        let template = if self.use_color {
            "{prefix:>12.cyan.bold} {spinner} {msg} ({elapsed})"
        } else {
            "{prefix:>12} {spinner} {msg} ({elapsed})"
        };
        if let Ok(style) = ProgressStyle::default_spinner().template(template) {
            pb.set_style(style);
        }
        pb.set_prefix(status.as_str());
        pb.set_message(msg);
        pb.enable_steady_tick(Duration::from_millis(120));
        Spinner { pb: Some(pb) }
    }
}

/// Handle to a running spinner.
pub struct Spinner {
    pb: Option<ProgressBar>,
}

impl Spinner {
    pub fn set_message(&self, msg: impl Display) {
        if let Some(pb) = &self.pb {
            pb.set_message(msg.to_string());
        }
    }

    pub fn finish(self) {
        if let Some(pb) = &self.pb {
            pb.finish_and_clear();
        }
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        if let Some(pb) = &self.pb {
            if !pb.is_finished() {
                pb.finish_and_clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_choice_parse() {
        assert_eq!("always".parse::<ColorChoice>(), Ok(ColorChoice::Always));
        assert!("rainbow".parse::<ColorChoice>().is_err());
    }

    #[test]
    fn test_quiet_wins() {
        let shell = Shell::from_flags(true, true, ColorChoice::Never);
        assert!(shell.is_quiet());
        assert!(!shell.use_color());
    }

    #[test]
    fn test_format_without_color() {
        let shell = Shell::new(Verbosity::Normal, ColorChoice::Never);
        assert_eq!(shell.format_status(Status::Planned), "     Planned");
    }
}
