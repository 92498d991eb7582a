//! Versioned default artifact coordinates and per-preset profiles.
//!
//! Defaults are an explicit input to the orchestrator rather than ambient
//! state: the built-in record can be overlaid with a YAML file, and each
//! component resolves its artifacts against the record it was handed.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::artifact::ArtifactRef;
use crate::core::preset::Preset;

/// Schema version of the defaults record understood by this build.
pub const DEFAULTS_SCHEMA: u32 = 1;

/// Upstream repository all built-in artifacts are published under.
pub const UPSTREAM_REPOSITORY: &str = "ghcr.io/stagehand-dev/airgap";

/// Well-known artifact identifiers.
pub mod ids {
    pub const K3S: &str = "k3s";
    pub const ZOT: &str = "zot";
    pub const ZOT_CHART: &str = "zot-chart";
    pub const FABRIC: &str = "fabric";
    pub const FABRIC_CHART: &str = "fabric-chart";
    pub const FABRIC_CTL: &str = "fabric-ctl";
}

/// Lookup of an artifact id that the defaults record does not know.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("no default artifact `{id}` in defaults for release {release}")]
pub struct UnknownArtifact {
    pub id: String,
    pub release: String,
}

/// Defaults that depend on the deployment profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresetDefaults {
    /// Multiplier on the attempts of every default readiness wait.
    pub wait_scale: u32,
}

impl Default for PresetDefaults {
    fn default() -> Self {
        PresetDefaults { wait_scale: 1 }
    }
}

/// Default coordinates for every artifact a release ships.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Defaults {
    pub schema: u32,
    pub release: semver::Version,
    #[serde(default)]
    pub artifacts: BTreeMap<String, ArtifactRef>,
    #[serde(default)]
    pub presets: BTreeMap<Preset, PresetDefaults>,
}

impl Defaults {
    /// Defaults compiled into this release.
    pub fn builtin() -> Self {
        let upstream = |name: &str, tag: &str| ArtifactRef::new(UPSTREAM_REPOSITORY, name, tag);

        let artifacts = [
            (ids::K3S, upstream("k3s-airgap", "v1.32.1-k3s1")),
            (ids::ZOT, upstream("zot", "v2.1.2")),
            (ids::ZOT_CHART, upstream("charts/zot", "0.1.66")),
            (ids::FABRIC, upstream("fabric", "v0.71.0")),
            (ids::FABRIC_CHART, upstream("charts/fabric", "0.71.0")),
            (ids::FABRIC_CTL, upstream("fabric-ctl", "v0.71.0")),
        ]
        .into_iter()
        .map(|(id, r)| (id.to_string(), r))
        .collect();

        // Virtual switches boot inside nested VMs and take about twice as
        // long to join the fabric.
        let presets = [
            (Preset::Lab, PresetDefaults { wait_scale: 1 }),
            (Preset::Vlab, PresetDefaults { wait_scale: 2 }),
        ]
        .into_iter()
        .collect();

        Defaults {
            schema: DEFAULTS_SCHEMA,
            release: semver::Version::new(0, 1, 0),
            artifacts,
            presets,
        }
    }

    /// Load a defaults overlay from YAML and apply it over the built-in record.
    pub fn load_overlay(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read defaults file: {}", path.display()))?;
        let overlay: DefaultsOverlay = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse defaults file: {}", path.display()))?;

        let mut defaults = Defaults::builtin();
        defaults.apply(overlay)?;
        Ok(defaults)
    }

    /// Apply an overlay; only artifact fields that are set in the overlay
    /// replace the built-in ones.
    pub fn apply(&mut self, overlay: DefaultsOverlay) -> Result<()> {
        if overlay.schema != DEFAULTS_SCHEMA {
            bail!(
                "unsupported defaults schema {} (this build understands {})",
                overlay.schema,
                DEFAULTS_SCHEMA
            );
        }
        if let Some(release) = overlay.release {
            self.release = release;
        }
        for (id, over) in overlay.artifacts {
            let merged = match self.artifacts.get(&id) {
                Some(base) => crate::core::artifact::fallback([&over, base]),
                None => over,
            };
            self.artifacts.insert(id, merged);
        }
        self.presets.extend(overlay.presets);
        Ok(())
    }

    /// Profile of `preset`; presets without an entry use the neutral profile.
    pub fn preset(&self, preset: Preset) -> PresetDefaults {
        self.presets.get(&preset).copied().unwrap_or_default()
    }

    /// Default coordinate for an artifact id.
    pub fn artifact(&self, id: &str) -> Result<&ArtifactRef, UnknownArtifact> {
        self.artifacts.get(id).ok_or_else(|| UnknownArtifact {
            id: id.to_string(),
            release: self.release.to_string(),
        })
    }
}

impl Default for Defaults {
    fn default() -> Self {
        Defaults::builtin()
    }
}

/// Partial defaults record read from a file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DefaultsOverlay {
    pub schema: u32,
    pub release: Option<semver::Version>,
    pub artifacts: BTreeMap<String, ArtifactRef>,
    pub presets: BTreeMap<Preset, PresetDefaults>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_builtin_artifacts_are_complete() {
        let defaults = Defaults::builtin();
        for (id, r) in &defaults.artifacts {
            assert!(r.is_complete(), "{} is incomplete: {}", id, r);
        }
        assert!(defaults.artifact(ids::ZOT).is_ok());
        assert_eq!(
            defaults.artifact("nope").unwrap_err().id,
            "nope".to_string()
        );
    }

    #[test]
    fn test_overlay_replaces_only_given_fields() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("defaults.yaml");
        std::fs::write(
            &path,
            "schema: 1\nrelease: 0.2.0\nartifacts:\n  zot:\n    tag: v9.9.9\n  extra:\n    repository: r\n    name: e\n    tag: t\n",
        )
        .unwrap();

        let defaults = Defaults::load_overlay(&path).unwrap();
        let zot = defaults.artifact(ids::ZOT).unwrap();
        assert_eq!(zot.tag, "v9.9.9");
        assert_eq!(zot.repository, UPSTREAM_REPOSITORY);
        assert_eq!(defaults.release, semver::Version::new(0, 2, 0));
        assert!(defaults.artifact("extra").is_ok());
    }

    #[test]
    fn test_preset_profiles() {
        let mut defaults = Defaults::builtin();
        assert_eq!(defaults.preset(Preset::Lab).wait_scale, 1);
        assert_eq!(defaults.preset(Preset::Vlab).wait_scale, 2);

        let overlay: DefaultsOverlay =
            serde_yaml::from_str("schema: 1\npresets:\n  vlab:\n    waitScale: 3\n").unwrap();
        defaults.apply(overlay).unwrap();
        assert_eq!(defaults.preset(Preset::Vlab).wait_scale, 3);
        assert_eq!(defaults.preset(Preset::Lab).wait_scale, 1);

        defaults.presets.clear();
        assert_eq!(defaults.preset(Preset::Vlab), PresetDefaults::default());
    }

    #[test]
    fn test_overlay_rejects_unknown_schema() {
        let mut defaults = Defaults::builtin();
        let overlay = DefaultsOverlay {
            schema: 7,
            ..DefaultsOverlay::default()
        };
        assert!(defaults.apply(overlay).is_err());
    }
}
