//! Persisted component state and bundle snapshots.
//!
//! `<base>/stagehand.yaml` holds `{version, preset, components}` and is the
//! input of the next run. Every bundle gets a copy of the same document for
//! audit, and installer bundles get their `recipe.yaml`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::preset::Preset;
use crate::engine::error::{ConfigError, StateError};
use crate::ops::op::Recipe;
use crate::ops::replay::RECIPE_FILE;
use crate::util::fs::{write_string, WriteOutcome};

/// File name of the persisted state, at the base and in every bundle.
pub const STATE_FILE: &str = "stagehand.yaml";

/// Version of the state document layout.
pub const STATE_VERSION: u32 = 1;

/// One component's persisted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentState {
    /// Schema version of `config`, owned by the component.
    pub version: u32,
    #[serde(default)]
    pub config: serde_yaml::Value,
}

impl ComponentState {
    pub fn encode<T: Serialize>(version: u32, config: &T) -> Result<Self, StateError> {
        Ok(ComponentState {
            version,
            config: serde_yaml::to_value(config)?,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StateError> {
        Ok(serde_yaml::from_value(self.config.clone())?)
    }
}

/// The persisted state of a whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    pub version: u32,
    pub preset: Preset,
    #[serde(default)]
    pub components: BTreeMap<String, ComponentState>,
}

impl StateDocument {
    pub fn new(preset: Preset) -> Self {
        StateDocument {
            version: STATE_VERSION,
            preset,
            components: BTreeMap::new(),
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("failed to serialize state")
    }
}

#[derive(Deserialize)]
struct VersionHeader {
    version: u32,
}

pub fn state_path(base_dir: &Path) -> PathBuf {
    base_dir.join(STATE_FILE)
}

/// Load `<base>/stagehand.yaml`; `None` on a fresh directory.
pub fn load_state(base_dir: &Path) -> Result<Option<StateDocument>, ConfigError> {
    let path = state_path(base_dir);
    if !path.exists() {
        return Ok(None);
    }

    let invalid = |source: anyhow::Error| ConfigError::InvalidState {
        path: path.clone(),
        source,
    };
    let contents = std::fs::read_to_string(&path)
        .map_err(|e| invalid(anyhow::Error::new(e)))?;

    let header: VersionHeader =
        serde_yaml::from_str(&contents).map_err(|e| invalid(anyhow::Error::new(e)))?;
    if header.version != STATE_VERSION {
        return Err(ConfigError::StateVersion {
            path,
            found: header.version,
            expected: STATE_VERSION,
        });
    }

    let doc: StateDocument =
        serde_yaml::from_str(&contents).map_err(|e| invalid(anyhow::Error::new(e)))?;
    Ok(Some(doc))
}

/// Write a state document to `path`, leaving identical files alone.
pub fn write_state(path: &Path, doc: &StateDocument) -> Result<WriteOutcome> {
    write_string(path, &doc.to_yaml()?)
}

/// Write `<bundle_dir>/recipe.yaml`.
pub fn write_recipe(bundle_dir: &Path, recipe: &Recipe) -> Result<WriteOutcome> {
    let yaml = serde_yaml::to_string(recipe).context("failed to serialize recipe")?;
    write_string(&bundle_dir.join(RECIPE_FILE), &yaml)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::op::{InstallOp, RecipeEntry};
    use crate::ops::replay::load_recipe;
    use crate::core::stage::Stage;
    use tempfile::TempDir;

    #[test]
    fn test_fresh_directory_has_no_state() {
        let tmp = TempDir::new().unwrap();
        assert!(load_state(tmp.path()).unwrap().is_none());
    }

    #[test]
    fn test_state_round_trip_is_stable() {
        let tmp = TempDir::new().unwrap();
        let mut doc = StateDocument::new(Preset::Vlab);
        doc.components.insert(
            "base".into(),
            ComponentState::encode(1, &serde_json::json!({"controlVIP": "10.0.0.1/32"})).unwrap(),
        );

        let path = state_path(tmp.path());
        assert!(write_state(&path, &doc).unwrap().is_written());
        assert!(!write_state(&path, &doc).unwrap().is_written());

        let loaded = load_state(tmp.path()).unwrap().unwrap();
        assert_eq!(loaded, doc);
    }

    #[test]
    fn test_unknown_state_version() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(state_path(tmp.path()), "version: 9\npreset: lab\n").unwrap();
        assert!(matches!(
            load_state(tmp.path()),
            Err(ConfigError::StateVersion { found: 9, .. })
        ));
    }

    #[test]
    fn test_garbage_state_is_invalid() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(state_path(tmp.path()), "version: [").unwrap();
        assert!(matches!(
            load_state(tmp.path()),
            Err(ConfigError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_recipe_written_and_loadable() {
        let tmp = TempDir::new().unwrap();
        let recipe = Recipe::new(
            "install",
            vec![RecipeEntry::new(Stage(0), "hello", InstallOp::command(["echo", "hi"]))],
        );
        write_recipe(tmp.path(), &recipe).unwrap();
        assert_eq!(load_recipe(tmp.path()).unwrap(), recipe);
    }
}
