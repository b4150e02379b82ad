//! The auto-scope config file — `~/.atoll/auto-scope.json`.
//!
//! Persists per-path overrides and a short resolution history so repeated
//! ingests of the same tree keep their scope even if the heuristics evolve.

use crate::scope::ScopeOverride;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Resolution history entries kept before the oldest are dropped.
const HISTORY_CAP: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoScopeConfig {
    pub enabled: bool,
    /// Number of hash characters in each project-id affix.
    pub hash_length: usize,
    /// Record resolutions into `history` automatically.
    pub auto_save: bool,
    /// Path (or URL) → explicit scope override.
    #[serde(default)]
    pub overrides: BTreeMap<String, OverrideEntry>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub locator: String,
    pub project_id: String,
    pub dataset: String,
    pub resolved_at: DateTime<Utc>,
}

impl Default for AutoScopeConfig {
    fn default() -> Self {
        AutoScopeConfig {
            enabled: true,
            hash_length: 8,
            auto_save: true,
            overrides: BTreeMap::new(),
            history: Vec::new(),
        }
    }
}

impl AutoScopeConfig {
    /// Default location: `~/.atoll/auto-scope.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".atoll").join("auto-scope.json"))
    }

    /// Load from `path`, or defaults when the file is missing. A malformed
    /// file is an error — silently resetting it would lose overrides.
    pub fn load(path: &Path) -> io::Result<Self> {
        match fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, json)
    }

    /// Override for a locator, if configured. Exact match only; locators are
    /// normalized before they get here.
    pub fn override_for(&self, locator: &str) -> ScopeOverride {
        match self.overrides.get(locator) {
            Some(entry) => ScopeOverride {
                project: entry.project.clone(),
                dataset: entry.dataset.clone(),
            },
            None => ScopeOverride::default(),
        }
    }

    /// Append a resolution to the history, bounding its length.
    pub fn record(&mut self, locator: &str, project_id: &str, dataset: &str) {
        if !self.auto_save {
            return;
        }
        self.history.push(HistoryEntry {
            locator: locator.to_string(),
            project_id: project_id.to_string(),
            dataset: dataset.to_string(),
            resolved_at: Utc::now(),
        });
        if self.history.len() > HISTORY_CAP {
            let excess = self.history.len() - HISTORY_CAP;
            self.history.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AutoScopeConfig::load(&dir.path().join("auto-scope.json")).unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.hash_length, 8);
        assert!(cfg.overrides.is_empty());
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auto-scope.json");

        let mut cfg = AutoScopeConfig::default();
        cfg.overrides.insert(
            "/home/dev/work".to_string(),
            OverrideEntry { project: Some("work".to_string()), dataset: None },
        );
        cfg.record("/home/dev/work", "work", "local");
        cfg.save(&path).unwrap();

        let loaded = AutoScopeConfig::load(&path).unwrap();
        assert_eq!(loaded.overrides.len(), 1);
        assert_eq!(loaded.history.len(), 1);
        assert_eq!(loaded.override_for("/home/dev/work").project.as_deref(), Some("work"));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auto-scope.json");
        fs::write(&path, "{not json").unwrap();
        assert!(AutoScopeConfig::load(&path).is_err());
    }

    #[test]
    fn history_is_bounded() {
        let mut cfg = AutoScopeConfig::default();
        for i in 0..(HISTORY_CAP + 10) {
            cfg.record(&format!("/p/{i}"), "id", "local");
        }
        assert_eq!(cfg.history.len(), HISTORY_CAP);
        assert_eq!(cfg.history.last().unwrap().locator, format!("/p/{}", HISTORY_CAP + 9));
    }
}
