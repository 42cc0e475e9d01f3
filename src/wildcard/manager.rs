use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use super::usage::{UsageCounts, UsageStore};

/// Cycles through the values of one wildcard file.
///
/// Each cycle is the file order rotated to a random start, so every value is
/// emitted exactly once before any value repeats.
#[derive(Debug)]
pub struct WildcardManager {
    path: PathBuf,
    name: String,
    items: Vec<String>,
    index: usize,
    shuffled: VecDeque<String>,
    usage: Arc<UsageStore>,
    rng: StdRng,
}

impl WildcardManager {
    pub fn new(path: impl Into<PathBuf>, usage: Arc<UsageStore>) -> Self {
        Self::with_rng(path, usage, StdRng::from_entropy())
    }

    pub fn with_rng(path: impl Into<PathBuf>, usage: Arc<UsageStore>, rng: StdRng) -> Self {
        let path = path.into();
        let name = wildcard_name(&path);
        let items = load_items(&path);

        let mut manager = Self {
            path,
            name,
            items,
            index: 0,
            shuffled: VecDeque::new(),
            usage,
            rng,
        };
        manager.reshuffle();
        manager
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File stem, used as the key in the usage file.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn items(&self) -> &[String] {
        &self.items
    }

    /// Next unused value of the current cycle. Empty string if the file has no values.
    pub fn get_next(&mut self) -> String {
        if self.items.is_empty() {
            return String::new();
        }
        if self.shuffled.is_empty() {
            self.reshuffle();
        }

        let Some(item) = self.shuffled.pop_front() else {
            return String::new();
        };
        self.usage.record(&self.name, &item);
        item
    }

    /// Upcoming values without consuming them.
    ///
    /// Reads the rest of the current cycle, then continues along the current
    /// rotation. Repeated calls with no `get_next` in between are identical.
    pub fn get_preview(&self, count: usize) -> Vec<String> {
        if self.items.is_empty() {
            return Vec::new();
        }

        self.shuffled
            .iter()
            .chain(self.items.iter().cycle().skip(self.index))
            .take(count)
            .cloned()
            .collect()
    }

    /// Start a new cycle immediately, discarding what was left of the current one.
    pub fn reset(&mut self) {
        self.reshuffle();
    }

    pub fn get_usage_stats(&self) -> UsageCounts {
        self.usage.counts(&self.name)
    }

    pub fn get_usage_percentage(&self, item: &str) -> f64 {
        let stats = self.get_usage_stats();
        let total: u64 = stats.values().sum();
        if total == 0 {
            return 0.0;
        }
        let count = stats.get(item).copied().unwrap_or(0);
        count as f64 / total as f64 * 100.0
    }

    /// Distinct values ranked by ascending use, never-used values first.
    pub fn get_least_used_items(&self, n: usize) -> Vec<(String, u64)> {
        let stats = self.get_usage_stats();
        let mut ranked: Vec<(String, u64)> = Vec::with_capacity(self.items.len());
        for item in &self.items {
            if ranked.iter().any(|(seen, _)| seen == item) {
                continue;
            }
            ranked.push((item.clone(), stats.get(item).copied().unwrap_or(0)));
        }

        // Stable sort keeps file order among equal counts.
        ranked.sort_by_key(|(_, count)| *count);
        ranked.truncate(n);
        ranked
    }

    pub fn reset_usage_stats(&self) {
        self.usage.reset(&self.name);
    }

    fn reshuffle(&mut self) {
        if self.items.is_empty() {
            self.index = 0;
            self.shuffled.clear();
            return;
        }

        self.index = self.rng.gen_range(0..self.items.len());
        self.shuffled = self.items[self.index..]
            .iter()
            .chain(self.items[..self.index].iter())
            .cloned()
            .collect();
        debug!(wildcard = %self.name, start = self.index, "Reshuffled wildcard");
    }
}

pub(crate) fn wildcard_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn load_items(path: &Path) -> Vec<String> {
    match fs::read_to_string(path) {
        Ok(content) => content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect(),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Wildcard file unavailable, using no values");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn write_wildcard(dir: &TempDir, name: &str, items: &[&str]) -> PathBuf {
        let path = dir.path().join(format!("{}.txt", name));
        fs::write(&path, items.join("\n")).unwrap();
        path
    }

    fn manager(path: &Path, seed: u64) -> WildcardManager {
        WildcardManager::with_rng(
            path,
            Arc::new(UsageStore::in_memory()),
            StdRng::seed_from_u64(seed),
        )
    }

    /// Successor of `value` in file order, wrapping around.
    fn successor<'a>(items: &'a [&str], value: &str) -> &'a str {
        let pos = items.iter().position(|i| *i == value).unwrap();
        items[(pos + 1) % items.len()]
    }

    #[test]
    fn one_cycle_emits_every_item_once() {
        let dir = TempDir::new().unwrap();
        let items = ["a", "b", "c", "d", "e"];
        let path = write_wildcard(&dir, "letters", &items);

        for seed in 0..10 {
            let mut m = manager(&path, seed);
            let drawn: Vec<String> = (0..items.len()).map(|_| m.get_next()).collect();
            let unique: HashSet<&str> = drawn.iter().map(String::as_str).collect();
            assert_eq!(unique, items.iter().copied().collect::<HashSet<_>>());
        }
    }

    #[test]
    fn cycles_are_rotations_of_file_order() {
        let dir = TempDir::new().unwrap();
        let items = ["a", "b", "c", "d"];
        let path = write_wildcard(&dir, "letters", &items);
        let mut m = manager(&path, 3);

        for _ in 0..5 {
            let cycle: Vec<String> = (0..items.len()).map(|_| m.get_next()).collect();
            for pair in cycle.windows(2) {
                assert_eq!(successor(&items, &pair[0]), pair[1]);
            }
        }
    }

    #[test]
    fn preview_is_repeatable_and_does_not_consume() {
        let dir = TempDir::new().unwrap();
        let path = write_wildcard(&dir, "style", &["realistic", "anime", "cyberpunk"]);
        let mut previewed = manager(&path, 11);
        let mut untouched = manager(&path, 11);

        let first = previewed.get_preview(5);
        let second = previewed.get_preview(5);
        assert_eq!(first, second);
        assert_eq!(first.len(), 5);
        assert!(previewed.get_usage_stats().is_empty());

        for _ in 0..7 {
            assert_eq!(previewed.get_next(), untouched.get_next());
        }
    }

    #[test]
    fn preview_starts_with_next_value() {
        let dir = TempDir::new().unwrap();
        let path = write_wildcard(&dir, "style", &["realistic", "anime", "cyberpunk"]);
        let mut m = manager(&path, 5);

        m.get_next();
        let preview = m.get_preview(2);
        assert_eq!(m.get_next(), preview[0]);
        assert_eq!(m.get_next(), preview[1]);
    }

    #[test]
    fn missing_file_yields_empty_values() {
        let dir = TempDir::new().unwrap();
        let mut m = manager(&dir.path().join("nope.txt"), 1);

        assert!(m.items().is_empty());
        assert_eq!(m.get_next(), "");
        assert!(m.get_preview(3).is_empty());
        assert!(m.get_usage_stats().is_empty());
    }

    #[test]
    fn blank_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("style.txt");
        fs::write(&path, "realistic\n\n  anime  \n\n").unwrap();

        let m = manager(&path, 1);
        assert_eq!(m.items(), &["realistic".to_string(), "anime".to_string()]);
    }

    #[test]
    fn usage_sums_to_draw_count() {
        let dir = TempDir::new().unwrap();
        let path = write_wildcard(&dir, "style", &["realistic", "anime", "cyberpunk"]);
        let mut m = manager(&path, 9);

        let draws = 7;
        for _ in 0..draws {
            m.get_next();
        }

        let stats = m.get_usage_stats();
        assert_eq!(stats.values().sum::<u64>(), draws);
        for (item, count) in &stats {
            let expected = 100.0 * *count as f64 / draws as f64;
            assert!((m.get_usage_percentage(item) - expected).abs() < 1e-9);
        }
        assert_eq!(m.get_usage_percentage("never-drawn"), 0.0);
    }

    #[test]
    fn least_used_prefers_unused_items() {
        let dir = TempDir::new().unwrap();
        let path = write_wildcard(&dir, "style", &["realistic", "anime", "cyberpunk"]);
        let usage = Arc::new(UsageStore::in_memory());
        usage.record("style", "realistic");
        usage.record("style", "realistic");
        usage.record("style", "cyberpunk");
        let m = WildcardManager::with_rng(&path, usage, StdRng::seed_from_u64(0));

        let least = m.get_least_used_items(2);
        assert_eq!(
            least,
            vec![("anime".to_string(), 0), ("cyberpunk".to_string(), 1)]
        );
    }

    #[test]
    fn reset_usage_clears_counts() {
        let dir = TempDir::new().unwrap();
        let path = write_wildcard(&dir, "style", &["realistic", "anime"]);
        let mut m = manager(&path, 2);
        m.get_next();
        m.reset_usage_stats();
        assert!(m.get_usage_stats().is_empty());
    }

    #[test]
    fn reset_starts_a_fresh_full_cycle() {
        let dir = TempDir::new().unwrap();
        let items = ["a", "b", "c"];
        let path = write_wildcard(&dir, "letters", &items);
        let mut m = manager(&path, 4);

        m.get_next();
        m.reset();
        let cycle: HashSet<String> = (0..items.len()).map(|_| m.get_next()).collect();
        assert_eq!(cycle.len(), items.len());
    }
}
