//! Persistent user settings: last-used parameters and named profiles.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::encoding::{decode_map, encode_map};
use crate::error::{PartSegError, Result};
use crate::parameters::{AlgorithmChoice, ParameterMap};

/// Named, reusable algorithm configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationProfile {
    pub name: String,
    pub algorithm: String,
    pub values: ParameterMap,
}

impl SegmentationProfile {
    pub fn new(name: &str, algorithm: &str, values: ParameterMap) -> Self {
        Self {
            name: name.to_string(),
            algorithm: algorithm.to_string(),
            values,
        }
    }

    pub fn to_choice(&self) -> AlgorithmChoice {
        AlgorithmChoice::new(self.algorithm.clone(), self.values.clone())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct StoredSettings {
    last_executed_algorithm: Option<String>,
    use_physical_unit: bool,
    algorithms: BTreeMap<String, Value>,
    profiles: Vec<StoredProfile>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredProfile {
    name: String,
    algorithm: String,
    values: Value,
}

/// Settings file manager
///
/// Parameter values are stored with the same marker encoding as project
/// archives. A missing file yields defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsStore {
    path: PathBuf,
    last_executed_algorithm: Option<String>,
    use_physical_unit: bool,
    algorithms: BTreeMap<String, ParameterMap>,
    profiles: BTreeMap<String, SegmentationProfile>,
}

impl SettingsStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Open the store at `path`, reading it if it exists
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut store = Self::new(path);
        store.load()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reload from disk
    pub fn load(&mut self) -> Result<()> {
        if !self.path.exists() {
            debug!("No settings file at {}", self.path.display());
            return Ok(());
        }
        let content = fs::read_to_string(&self.path)
            .map_err(|e| PartSegError::Settings(format!("Failed to read settings file: {e}")))?;
        let stored: StoredSettings = serde_json::from_str(&content)
            .map_err(|e| PartSegError::Settings(format!("Failed to parse settings file: {e}")))?;

        let settings_error = |e: PartSegError| PartSegError::Settings(e.to_string());
        let mut algorithms = BTreeMap::new();
        for (name, values) in stored.algorithms {
            algorithms.insert(name, decode_map(values).map_err(settings_error)?);
        }
        let mut profiles = BTreeMap::new();
        for profile in stored.profiles {
            let values = decode_map(profile.values).map_err(settings_error)?;
            profiles.insert(
                profile.name.clone(),
                SegmentationProfile::new(&profile.name, &profile.algorithm, values),
            );
        }

        self.last_executed_algorithm = stored.last_executed_algorithm;
        self.use_physical_unit = stored.use_physical_unit;
        self.algorithms = algorithms;
        self.profiles = profiles;
        Ok(())
    }

    /// Write to disk, creating the parent directory if needed
    pub fn save(&self) -> Result<()> {
        let stored = StoredSettings {
            last_executed_algorithm: self.last_executed_algorithm.clone(),
            use_physical_unit: self.use_physical_unit,
            algorithms: self
                .algorithms
                .iter()
                .map(|(name, values)| (name.clone(), encode_map(values)))
                .collect(),
            profiles: self
                .profiles
                .values()
                .map(|p| StoredProfile {
                    name: p.name.clone(),
                    algorithm: p.algorithm.clone(),
                    values: encode_map(&p.values),
                })
                .collect(),
        };
        let content = serde_json::to_string_pretty(&stored)
            .map_err(|e| PartSegError::Settings(format!("Failed to serialize settings: {e}")))?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, content)
            .map_err(|e| PartSegError::Settings(format!("Failed to write settings file: {e}")))?;
        Ok(())
    }

    pub fn last_executed_algorithm(&self) -> Option<&str> {
        self.last_executed_algorithm.as_deref()
    }

    pub fn set_last_executed_algorithm(&mut self, name: &str) {
        self.last_executed_algorithm = Some(name.to_string());
    }

    /// Parameters last used with `algorithm`
    pub fn algorithm_values(&self, algorithm: &str) -> Option<&ParameterMap> {
        self.algorithms.get(algorithm)
    }

    pub fn set_algorithm_values(&mut self, algorithm: &str, values: ParameterMap) {
        self.algorithms.insert(algorithm.to_string(), values);
    }

    /// Last executed algorithm with its last-used values
    pub fn last_choice(&self) -> Option<AlgorithmChoice> {
        let name = self.last_executed_algorithm.as_ref()?;
        let values = self.algorithms.get(name).cloned().unwrap_or_default();
        Some(AlgorithmChoice::new(name.clone(), values))
    }

    pub fn use_physical_unit(&self) -> bool {
        self.use_physical_unit
    }

    pub fn set_use_physical_unit(&mut self, value: bool) {
        self.use_physical_unit = value;
    }

    pub fn profile(&self, name: &str) -> Option<&SegmentationProfile> {
        self.profiles.get(name)
    }

    pub fn profiles(&self) -> impl Iterator<Item = &SegmentationProfile> {
        self.profiles.values()
    }

    /// Add or replace a profile
    pub fn add_profile(&mut self, profile: SegmentationProfile) {
        self.profiles.insert(profile.name.clone(), profile);
    }

    pub fn remove_profile(&mut self, name: &str) -> Option<SegmentationProfile> {
        self.profiles.remove(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;
    use crate::parameters::{parameter_map, ParameterValue};
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let store = SettingsStore::open(dir.path().join("settings.json")).unwrap();
        assert!(store.last_choice().is_none());
        assert!(!store.use_physical_unit());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let mut store = SettingsStore::new(&path);
        let values = parameter_map([
            ("channel", ParameterValue::Channel(Channel::Index(1))),
            ("minimum_size", ParameterValue::Int(100)),
        ]);
        store.set_algorithm_values("Threshold", values.clone());
        store.set_last_executed_algorithm("Threshold");
        store.set_use_physical_unit(true);
        store.add_profile(SegmentationProfile::new("small", "Threshold", values.clone()));
        store.save().unwrap();

        let reloaded = SettingsStore::open(&path).unwrap();
        assert_eq!(reloaded, store);
        assert_eq!(reloaded.last_choice().unwrap().values, values);
        assert_eq!(reloaded.profile("small").unwrap().to_choice().name, "Threshold");
    }

    #[test]
    fn test_unparsable_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(SettingsStore::open(&path), Err(PartSegError::Settings(_))));
    }
}
