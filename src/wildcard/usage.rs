use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Per-item emit counts for one wildcard.
pub type UsageCounts = BTreeMap<String, u64>;

/// Shared usage file: wildcard basename -> {item: count}.
#[derive(Debug)]
pub struct UsageStore {
    path: Option<PathBuf>,
    data: Mutex<BTreeMap<String, UsageCounts>>,
}

impl UsageStore {
    /// Open the usage file, starting empty if it is missing or unreadable.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = if path.exists() {
            match fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|content| serde_json::from_str(&content).map_err(|e| e.to_string()))
            {
                Ok(data) => data,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Failed to load wildcard usage file");
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };

        Self {
            path: Some(path),
            data: Mutex::new(data),
        }
    }

    /// Usage store without a backing file (for testing).
    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Increment `item`'s count for `wildcard` and persist.
    pub fn record(&self, wildcard: &str, item: &str) {
        let mut data = self.data.lock();
        *data
            .entry(wildcard.to_string())
            .or_default()
            .entry(item.to_string())
            .or_insert(0) += 1;
        self.persist(&data);
    }

    pub fn counts(&self, wildcard: &str) -> UsageCounts {
        self.data.lock().get(wildcard).cloned().unwrap_or_default()
    }

    /// Forget every count recorded for `wildcard`.
    pub fn reset(&self, wildcard: &str) {
        let mut data = self.data.lock();
        if data.remove(wildcard).is_some() {
            self.persist(&data);
        }
    }

    fn persist(&self, data: &BTreeMap<String, UsageCounts>) {
        let Some(path) = &self.path else {
            return;
        };

        if let Err(err) = write_atomic(path, data) {
            warn!(path = %path.display(), error = %err, "Failed to save wildcard usage file");
        } else {
            debug!(path = %path.display(), "Saved wildcard usage");
        }
    }
}

fn write_atomic(path: &Path, data: &BTreeMap<String, UsageCounts>) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let json = serde_json::to_string_pretty(data).map_err(std::io::Error::other)?;
    let temp_file = path.with_extension("json.tmp");
    fs::write(&temp_file, json)?;
    fs::rename(&temp_file, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn counts_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("usage.json");

        let store = UsageStore::open(&path);
        store.record("style", "anime");
        store.record("style", "anime");
        store.record("style", "realistic");
        store.record("color", "red");

        let reopened = UsageStore::open(&path);
        let style = reopened.counts("style");
        assert_eq!(style.get("anime"), Some(&2));
        assert_eq!(style.get("realistic"), Some(&1));
        assert_eq!(reopened.counts("color").get("red"), Some(&1));
    }

    #[test]
    fn reset_only_touches_one_wildcard() {
        let store = UsageStore::in_memory();
        store.record("style", "anime");
        store.record("color", "red");

        store.reset("style");
        assert!(store.counts("style").is_empty());
        assert_eq!(store.counts("color").len(), 1);
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("usage.json");
        fs::write(&path, "{not json").unwrap();

        let store = UsageStore::open(&path);
        assert!(store.counts("style").is_empty());
    }
}
