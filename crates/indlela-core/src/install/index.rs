//! Index of installed models, persisted as `models.json` at the cache root.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;

/// One installed (modelId, version) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalModel {
    pub model_id: String,
    pub version: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub installed_at: DateTime<Utc>,
    /// Drives LRU eviction; refreshed on activation and session load.
    pub last_used_at: DateTime<Utc>,
}

/// In-memory view of `models.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalModelIndex {
    #[serde(default)]
    pub models: Vec<LocalModel>,
}

impl LocalModelIndex {
    /// Load the index, tolerating a missing or corrupt file.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "index unreadable, starting empty");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    /// Persist atomically next to the final path.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        let raw = serde_json::to_string_pretty(self).expect("index serializes");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn get(&self, model_id: &str, version: &str) -> Option<&LocalModel> {
        self.models
            .iter()
            .find(|m| m.model_id == model_id && m.version == version)
    }

    /// Insert or replace an entry.
    pub fn upsert(&mut self, model: LocalModel) {
        self.remove(&model.model_id, &model.version);
        self.models.push(model);
    }

    pub fn remove(&mut self, model_id: &str, version: &str) {
        self.models
            .retain(|m| !(m.model_id == model_id && m.version == version));
    }

    /// Refresh the LRU stamp.
    pub fn touch(&mut self, model_id: &str, version: &str) {
        if let Some(model) = self
            .models
            .iter_mut()
            .find(|m| m.model_id == model_id && m.version == version)
        {
            model.last_used_at = Utc::now();
        }
    }

    pub fn total_size(&self) -> u64 {
        self.models.iter().map(|m| m.size_bytes).sum()
    }

    /// Entries ordered least-recently-used first.
    pub fn lru_order(&self) -> Vec<&LocalModel> {
        let mut entries: Vec<&LocalModel> = self.models.iter().collect();
        entries.sort_by_key(|m| m.last_used_at);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(id: &str, version: &str, size: u64) -> LocalModel {
        LocalModel {
            model_id: id.into(),
            version: version.into(),
            path: PathBuf::from(format!("/cache/{id}/{version}")),
            size_bytes: size,
            installed_at: Utc::now(),
            last_used_at: Utc::now(),
        }
    }

    #[test]
    fn test_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("models.json");

        let mut index = LocalModelIndex::default();
        index.upsert(model("m1", "1.0.0", 100));
        index.upsert(model("m2", "2.0.0", 200));
        index.save(&path).unwrap();

        let loaded = LocalModelIndex::load(&path);
        assert_eq!(loaded.models.len(), 2);
        assert_eq!(loaded.total_size(), 300);
        assert!(loaded.get("m1", "1.0.0").is_some());
    }

    #[test]
    fn test_corrupt_index_starts_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("models.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(LocalModelIndex::load(&path).models.is_empty());
    }

    #[test]
    fn test_upsert_replaces() {
        let mut index = LocalModelIndex::default();
        index.upsert(model("m1", "1.0.0", 100));
        index.upsert(model("m1", "1.0.0", 150));
        assert_eq!(index.models.len(), 1);
        assert_eq!(index.total_size(), 150);
    }

    #[test]
    fn test_lru_order() {
        let mut index = LocalModelIndex::default();
        let mut old = model("m1", "1.0.0", 100);
        old.last_used_at = Utc::now() - chrono::Duration::hours(2);
        index.upsert(old);
        index.upsert(model("m2", "1.0.0", 100));
        let order = index.lru_order();
        assert_eq!(order[0].model_id, "m1");
    }
}
