//! Artifact coordinates and field-level fallback resolution.
//!
//! An [`ArtifactRef`] names a container image, chart, or binary bundle as a
//! partial `{repository, name, tag}` record. Components rarely spell out a
//! complete coordinate; instead they layer a sparse override on top of shared
//! defaults with [`fallback`], which resolves each field independently.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A partial `{repository, name, tag}` coordinate; any field may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ArtifactRef {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub repository: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub tag: String,
}

/// An artifact reference that is missing a field it needs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArtifactRefError {
    #[error("artifact reference `{reference}` has no {field}")]
    MissingField {
        reference: String,
        field: &'static str,
    },

    #[error("invalid artifact reference `{0}`")]
    Invalid(String),
}

impl ArtifactRef {
    pub fn new(
        repository: impl Into<String>,
        name: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        ArtifactRef {
            repository: repository.into(),
            name: name.into(),
            tag: tag.into(),
        }
    }

    /// A reference carrying only a repository.
    pub fn repository(repository: impl Into<String>) -> Self {
        ArtifactRef {
            repository: repository.into(),
            ..ArtifactRef::default()
        }
    }

    /// A reference carrying only a tag.
    pub fn tag(tag: impl Into<String>) -> Self {
        ArtifactRef {
            tag: tag.into(),
            ..ArtifactRef::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.repository.is_empty() && self.name.is_empty() && self.tag.is_empty()
    }

    /// Whether every field is populated.
    pub fn is_complete(&self) -> bool {
        !self.repository.is_empty() && !self.name.is_empty() && !self.tag.is_empty()
    }

    /// Return a complete copy or name the first missing field.
    pub fn require_complete(&self) -> Result<&Self, ArtifactRefError> {
        let missing = if self.repository.is_empty() {
            "repository"
        } else if self.name.is_empty() {
            "name"
        } else if self.tag.is_empty() {
            "tag"
        } else {
            return Ok(self);
        };
        Err(ArtifactRefError::MissingField {
            reference: self.to_string(),
            field: missing,
        })
    }

    /// Registry host (`host[:port]`) part of the repository.
    pub fn registry_host(&self) -> &str {
        self.repository
            .split_once('/')
            .map(|(host, _)| host)
            .unwrap_or(&self.repository)
    }

    /// Repository path below the registry host, joined with the name.
    pub fn path(&self) -> String {
        match self.repository.split_once('/') {
            Some((_, prefix)) if !prefix.is_empty() => format!("{}/{}", prefix, self.name),
            _ => self.name.clone(),
        }
    }
}

/// Resolve references field by field.
///
/// Each field of the result is the first non-empty value of that field among
/// `refs`, in order. Whether another field of the same argument was set has
/// no bearing, so `fallback(&[tag_override, defaults])` keeps the default
/// repository and name while taking the overriding tag.
pub fn fallback<'a>(refs: impl IntoIterator<Item = &'a ArtifactRef>) -> ArtifactRef {
    let mut out = ArtifactRef::default();
    for r in refs {
        if out.repository.is_empty() {
            out.repository.clone_from(&r.repository);
        }
        if out.name.is_empty() {
            out.name.clone_from(&r.name);
        }
        if out.tag.is_empty() {
            out.tag.clone_from(&r.tag);
        }
        if out.is_complete() {
            break;
        }
    }
    out
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.repository.is_empty(), self.name.is_empty()) {
            (false, false) => write!(f, "{}/{}", self.repository, self.name)?,
            (false, true) => write!(f, "{}/", self.repository)?,
            (true, _) => write!(f, "{}", self.name)?,
        }
        if !self.tag.is_empty() {
            write!(f, ":{}", self.tag)?;
        }
        Ok(())
    }
}

impl FromStr for ArtifactRef {
    type Err = ArtifactRefError;

    /// Parse `repository/name:tag`; the last path segment is the name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.contains(char::is_whitespace) {
            return Err(ArtifactRefError::Invalid(s.to_string()));
        }

        let (path, tag) = match s.rfind(':') {
            // A colon before the last slash is a registry port, not a tag.
            Some(idx) if s[idx..].find('/').is_none() => (&s[..idx], &s[idx + 1..]),
            _ => (s, ""),
        };
        let (repository, name) = match path.rsplit_once('/') {
            Some((repo, name)) => (repo, name),
            None => ("", path),
        };
        if name.is_empty() {
            return Err(ArtifactRefError::Invalid(s.to_string()));
        }

        Ok(ArtifactRef::new(repository, name, tag))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_is_per_field() {
        let over = ArtifactRef::tag("v2");
        let defaults = ArtifactRef::new("r", "n", "v1");

        assert_eq!(fallback([&over, &defaults]), ArtifactRef::new("r", "n", "v2"));
    }

    #[test]
    fn test_fallback_repository_only_override() {
        let target = ArtifactRef::repository("10.0.0.5:31000/airgap");
        let source = ArtifactRef::new("ghcr.io/acme", "zot", "v2.1.0");

        assert_eq!(
            fallback([&target, &source]),
            ArtifactRef::new("10.0.0.5:31000/airgap", "zot", "v2.1.0")
        );
    }

    #[test]
    fn test_fallback_is_associative() {
        let a = ArtifactRef::new("", "a", "");
        let b = ArtifactRef::new("rb", "", "tb");
        let c = ArtifactRef::new("rc", "c", "tc");

        let left = fallback([&fallback([&a, &b]), &c]);
        let right = fallback([&a, &fallback([&b, &c])]);
        let flat = fallback([&a, &b, &c]);
        assert_eq!(left, right);
        assert_eq!(left, flat);
        assert_eq!(flat, ArtifactRef::new("rb", "a", "tb"));
    }

    #[test]
    fn test_fallback_does_not_mutate_arguments() {
        let a = ArtifactRef::tag("x");
        let b = ArtifactRef::new("r", "n", "y");
        let _ = fallback([&a, &b]);
        assert_eq!(a, ArtifactRef::tag("x"));
        assert_eq!(b, ArtifactRef::new("r", "n", "y"));
    }

    #[test]
    fn test_fallback_empty() {
        assert!(fallback(std::iter::empty()).is_empty());
    }

    #[test]
    fn test_require_complete_names_missing_field() {
        let err = ArtifactRef::new("r", "n", "").require_complete().unwrap_err();
        assert_eq!(
            err,
            ArtifactRefError::MissingField {
                reference: "r/n".to_string(),
                field: "tag"
            }
        );
    }

    #[test]
    fn test_parse_and_display() {
        let r: ArtifactRef = "10.0.0.5:31000/airgap/fabric/zot:v2.1.0".parse().unwrap();
        assert_eq!(r.repository, "10.0.0.5:31000/airgap/fabric");
        assert_eq!(r.name, "zot");
        assert_eq!(r.tag, "v2.1.0");
        assert_eq!(r.registry_host(), "10.0.0.5:31000");
        assert_eq!(r.path(), "airgap/fabric/zot");
        assert_eq!(r.to_string(), "10.0.0.5:31000/airgap/fabric/zot:v2.1.0");

        let untagged: ArtifactRef = "localhost:5000/zot".parse().unwrap();
        assert_eq!(untagged.repository, "localhost:5000");
        assert_eq!(untagged.name, "zot");
        assert!(untagged.tag.is_empty());
        assert_eq!(untagged.path(), "zot");

        assert!("".parse::<ArtifactRef>().is_err());
        assert!("registry/".parse::<ArtifactRef>().is_err());
    }
}
