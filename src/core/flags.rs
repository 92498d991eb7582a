//! Component-declared command-line flags.
//!
//! Components describe the flags they understand; the CLI turns the union
//! of all declarations into `clap` arguments and hands the parsed values back
//! as [`FlagValues`]. Name collisions are caught here, before any component
//! is hydrated.

use std::collections::BTreeMap;

use clap::parser::ValueSource;
use clap::{Arg, ArgAction, ArgMatches};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of value a flag carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagKind {
    String,
    Bool,
    /// Comma-separated or repeated values.
    List,
}

/// A flag declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flag {
    pub name: &'static str,
    pub help: &'static str,
    pub env: Option<&'static str>,
    pub kind: FlagKind,
}

impl Flag {
    pub const fn string(name: &'static str, help: &'static str) -> Self {
        Flag {
            name,
            help,
            env: None,
            kind: FlagKind::String,
        }
    }

    pub const fn bool(name: &'static str, help: &'static str) -> Self {
        Flag {
            name,
            help,
            env: None,
            kind: FlagKind::Bool,
        }
    }

    pub const fn list(name: &'static str, help: &'static str) -> Self {
        Flag {
            name,
            help,
            env: None,
            kind: FlagKind::List,
        }
    }

    /// Also read the value from an environment variable.
    pub const fn env(mut self, var: &'static str) -> Self {
        self.env = Some(var);
        self
    }

    /// Build the `clap` argument for this flag.
    pub fn to_arg(&self) -> Arg {
        let mut arg = Arg::new(self.name).long(self.name).help(self.help);
        if let Some(env) = self.env {
            arg = arg.env(env);
        }
        match self.kind {
            FlagKind::String => arg.action(ArgAction::Set).value_name("VALUE"),
            FlagKind::Bool => arg.action(ArgAction::SetTrue),
            FlagKind::List => arg
                .action(ArgAction::Append)
                .value_delimiter(',')
                .value_name("VALUE"),
        }
    }
}

/// A flag together with the component that declared it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredFlag {
    pub owner: &'static str,
    pub flag: Flag,
}

/// Flag declaration or usage problems.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlagError {
    #[error("flag `--{flag}` is declared by both `{first}` and `{second}`")]
    Duplicate {
        flag: String,
        first: String,
        second: String,
    },

    #[error("flag `--{flag}` declared by `{owner}` collides with a global flag")]
    Reserved { flag: String, owner: String },

    #[error("unknown flag `--{flag}`")]
    Unknown { flag: String },

    #[error("flag `--{flag}` expects a {expected} value")]
    WrongKind { flag: String, expected: &'static str },
}

/// Merge per-component declarations into one list, rejecting duplicates and
/// collisions with `reserved` global flag names.
pub fn collect_flags<I>(declarations: I, reserved: &[&str]) -> Result<Vec<DeclaredFlag>, FlagError>
where
    I: IntoIterator<Item = (&'static str, Vec<Flag>)>,
{
    let mut out: Vec<DeclaredFlag> = Vec::new();

    for (owner, flags) in declarations {
        for flag in flags {
            if reserved.contains(&flag.name) {
                return Err(FlagError::Reserved {
                    flag: flag.name.to_string(),
                    owner: owner.to_string(),
                });
            }
            if let Some(existing) = out.iter().find(|d| d.flag.name == flag.name) {
                return Err(FlagError::Duplicate {
                    flag: flag.name.to_string(),
                    first: existing.owner.to_string(),
                    second: owner.to_string(),
                });
            }
            out.push(DeclaredFlag { owner, flag });
        }
    }

    Ok(out)
}

/// A parsed flag value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    List(Vec<String>),
    String(String),
}

/// Flag values supplied for a run; absent flags leave persisted state alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlagValues {
    values: BTreeMap<String, FlagValue>,
}

impl FlagValues {
    pub fn new() -> Self {
        FlagValues::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: FlagValue) -> &mut Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<FlagValue>) -> Self {
        self.set(name, value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn get_str(&self, name: &str) -> Result<Option<&str>, FlagError> {
        match self.values.get(name) {
            None => Ok(None),
            Some(FlagValue::String(s)) => Ok(Some(s)),
            Some(_) => Err(FlagError::WrongKind {
                flag: name.to_string(),
                expected: "string",
            }),
        }
    }

    pub fn get_bool(&self, name: &str) -> Result<Option<bool>, FlagError> {
        match self.values.get(name) {
            None => Ok(None),
            Some(FlagValue::Bool(b)) => Ok(Some(*b)),
            Some(_) => Err(FlagError::WrongKind {
                flag: name.to_string(),
                expected: "boolean",
            }),
        }
    }

    pub fn get_list(&self, name: &str) -> Result<Option<&[String]>, FlagError> {
        match self.values.get(name) {
            None => Ok(None),
            Some(FlagValue::List(l)) => Ok(Some(l)),
            Some(FlagValue::String(s)) => Ok(Some(std::slice::from_ref(s))),
            Some(_) => Err(FlagError::WrongKind {
                flag: name.to_string(),
                expected: "list",
            }),
        }
    }

    /// Fail on the first supplied value that no component declared.
    pub fn check_known(&self, declared: &[DeclaredFlag]) -> Result<(), FlagError> {
        for name in self.names() {
            if !declared.iter().any(|d| d.flag.name == name) {
                return Err(FlagError::Unknown {
                    flag: name.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Extract the values the user actually supplied (command line or env).
    pub fn from_matches(declared: &[DeclaredFlag], matches: &ArgMatches) -> Self {
        let mut values = FlagValues::new();

        for d in declared {
            let name = d.flag.name;
            let supplied = matches!(
                matches.value_source(name),
                Some(ValueSource::CommandLine) | Some(ValueSource::EnvVariable)
            );
            if !supplied {
                continue;
            }
            let value = match d.flag.kind {
                FlagKind::Bool => Some(FlagValue::Bool(matches.get_flag(name))),
                FlagKind::String => matches
                    .get_one::<String>(name)
                    .map(|s| FlagValue::String(s.clone())),
                FlagKind::List => matches
                    .get_many::<String>(name)
                    .map(|v| FlagValue::List(v.cloned().collect())),
            };
            if let Some(value) = value {
                values.set(name, value);
            }
        }

        values
    }
}

impl From<&str> for FlagValue {
    fn from(s: &str) -> Self {
        FlagValue::String(s.to_string())
    }
}

impl From<bool> for FlagValue {
    fn from(b: bool) -> Self {
        FlagValue::Bool(b)
    }
}

impl From<Vec<String>> for FlagValue {
    fn from(l: Vec<String>) -> Self {
        FlagValue::List(l)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Command;

    #[test]
    fn test_collect_flags_rejects_duplicates() {
        let err = collect_flags(
            [
                ("base", vec![Flag::string("control-vip", "")]),
                ("fabric", vec![Flag::string("control-vip", "")]),
            ],
            &[],
        )
        .unwrap_err();

        assert_eq!(
            err,
            FlagError::Duplicate {
                flag: "control-vip".to_string(),
                first: "base".to_string(),
                second: "fabric".to_string(),
            }
        );
    }

    #[test]
    fn test_collect_flags_rejects_reserved() {
        let err = collect_flags([("base", vec![Flag::string("preset", "")])], &["preset"])
            .unwrap_err();
        assert!(matches!(err, FlagError::Reserved { .. }));
    }

    #[test]
    fn test_unknown_flag_value() {
        let declared =
            collect_flags([("base", vec![Flag::string("control-vip", "")])], &[]).unwrap();
        let values = FlagValues::new().with("nope", "x");
        assert_eq!(
            values.check_known(&declared),
            Err(FlagError::Unknown {
                flag: "nope".to_string()
            })
        );
    }

    #[test]
    fn test_values_from_matches_only_supplied() {
        let declared = collect_flags(
            [(
                "base",
                vec![
                    Flag::string("control-vip", ""),
                    Flag::bool("dev", ""),
                    Flag::list("dns", ""),
                    Flag::string("untouched", ""),
                ],
            )],
            &[],
        )
        .unwrap();

        let cmd = declared
            .iter()
            .fold(Command::new("t"), |cmd, d| cmd.arg(d.flag.to_arg()));
        let matches = cmd
            .try_get_matches_from([
                "t",
                "--control-vip",
                "10.0.0.5/32",
                "--dev",
                "--dns",
                "1.1.1.1,8.8.8.8",
            ])
            .unwrap();

        let values = FlagValues::from_matches(&declared, &matches);
        assert_eq!(values.get_str("control-vip").unwrap(), Some("10.0.0.5/32"));
        assert_eq!(values.get_bool("dev").unwrap(), Some(true));
        assert_eq!(
            values.get_list("dns").unwrap().unwrap(),
            &["1.1.1.1".to_string(), "8.8.8.8".to_string()]
        );
        assert_eq!(values.get_str("untouched").unwrap(), None);
        assert!(values.get_bool("control-vip").is_err());
    }
}
