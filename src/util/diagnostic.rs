//! User-facing error reports.
//!
//! Every failure the CLIs print names what failed, the chain of causes, and
//! where possible a concrete next step.

use std::error::Error as StdError;
use std::fmt;
use std::path::PathBuf;

use miette::Diagnostic as MietteDiagnostic;

use crate::engine::error::{ConfigError, RunError, ViewError};
use crate::ipam::ValidationError;
use crate::ops::replay::ReplayError;

/// Common suggestion messages for consistent error handling.
pub mod suggestions {
    /// Suggestion when a flag is unknown or disabled.
    pub const LIST_FLAGS: &str = "Run `stagehand flags --preset <preset>` to see the accepted flags";

    /// Suggestion when the persisted state belongs to another preset.
    pub const PRESET_MISMATCH: &str =
        "Pass the preset the directory was assembled with, or assemble into a fresh --base-dir";

    /// Suggestion when persisted state cannot be read.
    pub const BROKEN_STATE: &str =
        "Fix or remove the persisted state file; the next run recreates it from defaults";

    /// Suggestion when a dependency declaration is wrong.
    pub const DEPENDENCIES: &str = "Check the depends_on() declarations of the components involved";

    /// Suggestion when a build operation fails.
    pub const BUILD_FAILED: &str =
        "Re-run `stagehand assemble --verbose`; completed operations are skipped";

    /// Suggestion when a network fetch fails.
    pub const FETCH_FAILED: &str =
        "Check registry access or the [net] section of .stagehand/config.toml";

    /// Suggestion when the addressing plan is inconsistent.
    pub const FIX_PLAN: &str = "Adjust the conflicting addresses, then run `stagehand validate`";

    /// Suggestion after a failed replay stage.
    pub const RESUME_REPLAY: &str =
        "Fix the failure, then resume with `stagehand-replay <bundle-dir> --from-stage <stage>`";
}

/// An error message with optional suggestions.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// Primary message
    pub message: String,
    /// Additional context lines
    pub context: Vec<String>,
    /// Suggested fixes
    pub suggestions: Vec<String>,
    /// Related location (file path)
    pub location: Option<PathBuf>,
}

impl Diagnostic {
    /// Create a new error diagnostic.
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            message: message.into(),
            context: Vec::new(),
            suggestions: Vec::new(),
            location: None,
        }
    }

    /// Add context to the diagnostic.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context.push(context.into());
        self
    }

    /// Add a suggestion for fixing the issue.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    /// Add a file location.
    pub fn with_location(mut self, path: impl Into<PathBuf>) -> Self {
        self.location = Some(path.into());
        self
    }

    /// Format the diagnostic for terminal output.
    pub fn format(&self, color: bool) -> String {
        let mut output = String::new();

        let label = if color { "\x1b[1;31merror\x1b[0m" } else { "error" };
        output.push_str(&format!("{}: {}\n", label, self.message));

        if let Some(ref path) = self.location {
            output.push_str(&format!("  --> {}\n", path.display()));
        }

        for ctx in &self.context {
            output.push_str(&format!("  = {}\n", ctx));
        }

        if !self.suggestions.is_empty() {
            output.push('\n');
            let help_prefix = if color { "\x1b[1;32mhelp\x1b[0m" } else { "help" };
            output.push_str(&format!("{}: consider:\n", help_prefix));
            for (i, suggestion) in self.suggestions.iter().enumerate() {
                output.push_str(&format!("  {}. {}\n", i + 1, suggestion));
            }
        }

        output
    }

    /// Build a report for any error, recognizing the crate's own error types.
    pub fn from_error(err: &anyhow::Error) -> Self {
        if let Some(run) = err.downcast_ref::<RunError>() {
            return Diagnostic::from_run_error(run);
        }
        if let Some(replay) = err.downcast_ref::<ReplayError>() {
            return Diagnostic::from_replay_error(replay);
        }
        if let Some(config) = err.downcast_ref::<ConfigError>() {
            return Diagnostic::from_config_error(config);
        }

        let mut diag = Diagnostic::error(err.to_string());
        for cause in err.chain().skip(1) {
            diag = diag.with_context(cause.to_string());
        }
        diag
    }

    fn from_config_error(err: &ConfigError) -> Self {
        let diag = with_causes(Diagnostic::error(err.to_string()), err);
        match err {
            ConfigError::Flag(_) | ConfigError::DisabledFlag { .. } => {
                diag.with_suggestion(suggestions::LIST_FLAGS)
            }
            ConfigError::PresetMismatch { path, .. } => diag
                .with_location(path)
                .with_suggestion(suggestions::PRESET_MISMATCH),
            ConfigError::StateVersion { path, .. } | ConfigError::InvalidState { path, .. } => diag
                .with_location(path)
                .with_suggestion(suggestions::BROKEN_STATE),
            ConfigError::ComponentState { .. } => diag.with_suggestion(suggestions::BROKEN_STATE),
            ConfigError::MissingDependency { .. } | ConfigError::DependencyCycle(_) => {
                diag.with_suggestion(suggestions::DEPENDENCIES)
            }
            _ => diag,
        }
    }

    /// Report for a failed assembly run.
    pub fn from_run_error(err: &RunError) -> Self {
        if let RunError::Config(config) = err {
            return Diagnostic::from_config_error(config);
        }

        let mut diag = Diagnostic::error(err.to_string());
        let mut findings = false;
        let mut network = false;
        let mut view = false;

        let mut cause = err.source();
        while let Some(current) = cause {
            if let Some(plan) = current.downcast_ref::<ValidationError>() {
                findings = true;
                for finding in plan.findings() {
                    diag = diag.with_context(match finding.code() {
                        Some(code) => format!("[{}] {}", code, finding),
                        None => finding.to_string(),
                    });
                }
                break;
            }
            view |= current.downcast_ref::<ViewError>().is_some();
            network |= current.downcast_ref::<reqwest::Error>().is_some();
            diag = diag.with_context(current.to_string());
            cause = current.source();
        }

        match err {
            RunError::Validate { .. } if findings => diag.with_suggestion(suggestions::FIX_PLAN),
            RunError::Hydrate { .. } if view => diag.with_suggestion(suggestions::DEPENDENCIES),
            RunError::Build { .. } if network => diag
                .with_suggestion(suggestions::FETCH_FAILED)
                .with_suggestion(suggestions::BUILD_FAILED),
            RunError::Build { .. } => diag.with_suggestion(suggestions::BUILD_FAILED),
            RunError::Persist { path, .. } => diag.with_location(path),
            _ => diag,
        }
    }

    /// Report for a failed replay.
    pub fn from_replay_error(err: &ReplayError) -> Self {
        let diag = with_causes(Diagnostic::error(err.to_string()), err);
        match err {
            ReplayError::Load { path, .. } | ReplayError::Version { path, .. } => diag.with_location(path),
            ReplayError::Op { .. } | ReplayError::WaitExhausted { .. } => {
                diag.with_suggestion(suggestions::RESUME_REPLAY)
            }
            ReplayError::Cancelled { .. } => diag,
        }
    }
}

fn with_causes(mut diag: Diagnostic, err: &dyn StdError) -> Diagnostic {
    let mut cause = err.source();
    while let Some(current) = cause {
        diag = diag.with_context(current.to_string());
        cause = current.source();
    }
    diag
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format(false))
    }
}

/// Print a diagnostic to stderr.
pub fn emit(diagnostic: &Diagnostic, color: bool) {
    eprint!("{}", diagnostic.format(color));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::flags::FlagError;
    use crate::core::stage::Stage;
    use ipnet::Ipv4Net;

    #[test]
    fn test_diagnostic_formatting() {
        let diag = Diagnostic::error("validation failed for component `fabric`")
            .with_context("management subnet 10.0.0.0/24 overlaps with VTEP subnet 10.0.0.128/25")
            .with_suggestion("Move the VTEP subnet")
            .with_location("out/stagehand.yaml");

        let output = diag.format(false);
        assert!(output.starts_with("error: validation failed"));
        assert!(output.contains("  --> out/stagehand.yaml"));
        assert!(output.contains("overlaps with VTEP subnet"));
        assert!(output.contains("help: consider:"));
        assert!(output.contains("1. Move the VTEP subnet"));
    }

    #[test]
    fn test_validation_findings_listed_with_codes() {
        let net = |s: &str| s.parse::<Ipv4Net>().unwrap();
        let plan = ValidationError::Multiple(vec![
            ValidationError::Overlap {
                first: "management".into(),
                first_net: net("10.0.0.0/24"),
                second: "VTEP".into(),
                second_net: net("10.0.0.128/25"),
            },
            ValidationError::PrefixLength {
                position: "control VIP".into(),
                addr: net("10.0.0.5/31"),
                expected: 32,
            },
        ]);
        let err = RunError::Validate {
            component: "fabric".into(),
            source: anyhow::Error::new(plan),
        };

        let diag = Diagnostic::from_run_error(&err);
        assert_eq!(diag.context.len(), 2);
        assert!(diag.context[0].starts_with("[stagehand::ipam::overlap]"));
        assert!(diag.context[0].contains("10.0.0.128/25"));
        assert!(diag.context[1].contains("must be a /32"));
        assert_eq!(diag.suggestions, [suggestions::FIX_PLAN]);
    }

    #[test]
    fn test_flag_errors_suggest_listing() {
        let err = RunError::Config(ConfigError::Flag(FlagError::Unknown {
            flag: "nope".into(),
        }));
        let diag = Diagnostic::from_error(&anyhow::Error::new(err));
        assert_eq!(diag.message, "unknown flag `--nope`");
        assert_eq!(diag.suggestions, [suggestions::LIST_FLAGS]);
    }

    #[test]
    fn test_replay_failure_suggests_resume() {
        let err = ReplayError::Op {
            bundle: "control-install".into(),
            stage: Stage(1),
            name: "registry-install".into(),
            source: anyhow::anyhow!("exit status 1"),
        };
        let diag = Diagnostic::from_replay_error(&err);
        assert!(diag.message.contains("stage 1 `registry-install`"));
        assert_eq!(diag.context, ["exit status 1"]);
        assert_eq!(diag.suggestions, [suggestions::RESUME_REPLAY]);
    }
}
