use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::manager::WildcardManager;
use super::usage::{UsageCounts, UsageStore};

pub type SharedManager = Arc<Mutex<WildcardManager>>;

/// One [`WildcardManager`] per wildcard file path for the life of the process.
#[derive(Debug)]
pub struct WildcardFactory {
    usage: Arc<UsageStore>,
    managers: Mutex<HashMap<PathBuf, SharedManager>>,
    seed_source: Mutex<Option<StdRng>>,
}

impl WildcardFactory {
    pub fn new(usage: Arc<UsageStore>) -> Self {
        Self {
            usage,
            managers: Mutex::new(HashMap::new()),
            seed_source: Mutex::new(None),
        }
    }

    /// Factory whose managers draw rotations from a seeded generator.
    pub fn with_seed(usage: Arc<UsageStore>, seed: u64) -> Self {
        Self {
            usage,
            managers: Mutex::new(HashMap::new()),
            seed_source: Mutex::new(Some(StdRng::seed_from_u64(seed))),
        }
    }

    pub fn usage(&self) -> &Arc<UsageStore> {
        &self.usage
    }

    pub fn get_manager(&self, path: impl AsRef<Path>) -> SharedManager {
        let path = path.as_ref();
        let mut managers = self.managers.lock();
        if let Some(manager) = managers.get(path) {
            return manager.clone();
        }

        let manager = match self.seed_source.lock().as_mut() {
            Some(source) => WildcardManager::with_rng(
                path,
                self.usage.clone(),
                StdRng::seed_from_u64(source.gen()),
            ),
            None => WildcardManager::new(path, self.usage.clone()),
        };
        let manager = Arc::new(Mutex::new(manager));
        managers.insert(path.to_path_buf(), manager.clone());
        manager
    }

    pub fn reset_all(&self) {
        for manager in self.managers.lock().values() {
            manager.lock().reset();
        }
    }

    /// Usage counts of every cached manager, keyed by wildcard basename.
    pub fn get_all_usage_stats(&self) -> BTreeMap<String, UsageCounts> {
        self.managers
            .lock()
            .values()
            .map(|manager| {
                let manager = manager.lock();
                (manager.name().to_string(), manager.get_usage_stats())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn same_path_returns_same_instance() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("style.txt");
        fs::write(&path, "realistic\nanime\n").unwrap();

        let factory = WildcardFactory::new(Arc::new(UsageStore::in_memory()));
        let first = factory.get_manager(&path);
        let second = factory.get_manager(&path);
        assert!(Arc::ptr_eq(&first, &second));

        let other = factory.get_manager(dir.path().join("color.txt"));
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn shared_instance_keeps_cycle_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("style.txt");
        fs::write(&path, "realistic\nanime\ncyberpunk\n").unwrap();

        let factory = WildcardFactory::with_seed(Arc::new(UsageStore::in_memory()), 1);
        let mut drawn: Vec<String> = (0..3)
            .map(|_| factory.get_manager(&path).lock().get_next())
            .collect();
        drawn.sort();
        assert_eq!(drawn, vec!["anime", "cyberpunk", "realistic"]);
    }

    #[test]
    fn aggregates_usage_by_basename() {
        let dir = TempDir::new().unwrap();
        let style = dir.path().join("style.txt");
        let color = dir.path().join("color.txt");
        fs::write(&style, "realistic\n").unwrap();
        fs::write(&color, "red\nblue\n").unwrap();

        let factory = WildcardFactory::new(Arc::new(UsageStore::in_memory()));
        factory.get_manager(&style).lock().get_next();
        factory.get_manager(&color).lock().get_next();
        factory.get_manager(&color).lock().get_next();

        let stats = factory.get_all_usage_stats();
        assert_eq!(stats["style"].values().sum::<u64>(), 1);
        assert_eq!(stats["color"].values().sum::<u64>(), 2);
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let factory = WildcardFactory::new(Arc::new(UsageStore::in_memory()));
        let manager = factory.get_manager(dir.path().join("absent.txt"));
        assert_eq!(manager.lock().get_next(), "");
        factory.reset_all();
    }
}
