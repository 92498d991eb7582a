//! Stage and bundle vocabulary.
//!
//! A [`Stage`] is an ordered checkpoint: every install action recorded for
//! stage `n` may assume all actions of stages `< n` in the same bundle have
//! already succeeded. A [`Bundle`] is a named output directory; installer
//! bundles additionally carry a replay recipe.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Ordered install checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Stage(pub u8);

impl Stage {
    pub const fn new(n: u8) -> Self {
        Stage(n)
    }

    pub const fn index(self) -> u8 {
        self.0
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stage {}", self.0)
    }
}

/// Named output directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bundle {
    pub name: &'static str,
    /// Installer bundles get a `recipe.yaml` with their install operations.
    pub installer: bool,
}

impl Bundle {
    pub const fn new(name: &'static str, installer: bool) -> Self {
        Bundle { name, installer }
    }
}

impl fmt::Display for Bundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// The bundles known to a run, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct BundleSet {
    bundles: Vec<Bundle>,
}

impl BundleSet {
    pub fn new(bundles: impl IntoIterator<Item = Bundle>) -> Self {
        BundleSet {
            bundles: bundles.into_iter().collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Bundle> {
        self.bundles.iter().find(|b| b.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bundle> {
        self.bundles.iter()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.bundles.iter().map(|b| b.name).collect()
    }

    /// Name of the first bundle declared twice, if any.
    pub fn duplicate(&self) -> Option<&'static str> {
        self.bundles
            .iter()
            .enumerate()
            .find(|(i, b)| self.bundles[..*i].iter().any(|o| o.name == b.name))
            .map(|(_, b)| b.name)
    }
}
