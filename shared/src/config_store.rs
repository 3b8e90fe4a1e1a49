//! Durable map of strategy id -> `StrategyConfig`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{error, info};

use crate::error::{Result, SupervisorError};
use crate::fs_util;
use crate::models::StrategyConfig;

/// In-memory cache backed by a JSON file that is rewritten atomically on
/// every `save`. The file is the source of truth at boot.
pub struct ConfigStore {
    path: PathBuf,
    configs: Mutex<BTreeMap<String, StrategyConfig>>,
}

impl ConfigStore {
    /// Load `path`, or start empty if it does not exist. An unparsable file is
    /// moved aside and the store starts empty.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let configs = if path.exists() {
            let raw = std::fs::read(&path)?;
            match serde_json::from_slice::<BTreeMap<String, StrategyConfig>>(&raw) {
                Ok(configs) => {
                    info!("Loaded {} strategy configurations", configs.len());
                    configs
                }
                Err(e) => {
                    error!("Failed to parse {}: {}", path.display(), e);
                    fs_util::quarantine(&path, &chrono::Utc::now().timestamp().to_string());
                    BTreeMap::new()
                }
            }
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            configs: Mutex::new(configs),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, StrategyConfig>> {
        self.configs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, id: &str) -> Option<StrategyConfig> {
        self.lock().get(id).cloned()
    }

    pub fn require(&self, id: &str) -> Result<StrategyConfig> {
        self.get(id).ok_or_else(|| SupervisorError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn all(&self) -> Vec<StrategyConfig> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn insert(&self, config: StrategyConfig) {
        self.lock().insert(config.id.clone(), config);
    }

    /// Claim the first free id among `base`, `base_2`, `base_3`, ... and
    /// store the config `make` builds for it, all under one lock.
    pub fn insert_unique<F>(&self, base: &str, make: F) -> StrategyConfig
    where
        F: FnOnce(&str) -> StrategyConfig,
    {
        let mut configs = self.lock();
        let mut id = base.to_string();
        let mut suffix = 2;
        while configs.contains_key(&id) {
            id = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        let mut config = make(&id);
        config.id = id.clone();
        configs.insert(id, config.clone());
        config
    }

    pub fn remove(&self, id: &str) -> Option<StrategyConfig> {
        self.lock().remove(id)
    }

    /// Apply `f` to the stored config and return the updated copy.
    pub fn update<F>(&self, id: &str, f: F) -> Result<StrategyConfig>
    where
        F: FnOnce(&mut StrategyConfig),
    {
        let mut configs = self.lock();
        let config = configs
            .get_mut(id)
            .ok_or_else(|| SupervisorError::NotFound(id.to_string()))?;
        f(config);
        Ok(config.clone())
    }

    /// Serialize the current snapshot and atomically replace the file.
    /// The lock is held through the write so concurrent saves land in order.
    pub fn save(&self) -> Result<()> {
        let configs = self.lock();
        let json = serde_json::to_vec_pretty(&*configs)?;
        fs_util::write_atomic(&self.path, &json)?;
        tracing::debug!("Saved {} strategy configurations", configs.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    fn config(id: &str) -> StrategyConfig {
        let ts = FixedOffset::east_opt(19800)
            .unwrap()
            .with_ymd_and_hms(2025, 1, 6, 9, 0, 0)
            .unwrap();
        StrategyConfig::new(id, id.to_uppercase(), format!("/tmp/{}.py", id), ts)
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strategy_configs.json");

        let store = ConfigStore::load(&path).unwrap();
        assert!(store.is_empty());
        store.insert(config("alpha"));
        store.insert(config("beta"));
        store
            .update("alpha", |c| c.mark_running(1234, c.created_at))
            .unwrap();
        store.save().unwrap();

        let reloaded = ConfigStore::load(&path).unwrap();
        assert_eq!(reloaded.len(), 2);
        let alpha = reloaded.get("alpha").unwrap();
        assert!(alpha.is_running);
        assert_eq!(alpha.pid, Some(1234));
    }

    #[test]
    fn test_insert_unique_under_contention() {
        use std::sync::{Arc, Barrier};

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(ConfigStore::load(dir.path().join("c.json")).unwrap());
        let barrier = Arc::new(Barrier::new(8));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    store.insert_unique("dup_20250106091600", config).id
                })
            })
            .collect();
        let mut ids: Vec<String> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        ids.sort();
        ids.dedup();

        assert_eq!(ids.len(), 8);
        assert_eq!(store.len(), 8);
        assert!(store.contains("dup_20250106091600"));
        assert!(store.contains("dup_20250106091600_8"));
    }

    #[test]
    fn test_update_unknown_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("c.json")).unwrap();
        let err = store.update("ghost", |_| {}).unwrap_err();
        assert!(matches!(err, SupervisorError::NotFound(_)));
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strategy_configs.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let store = ConfigStore::load(&path).unwrap();
        assert!(store.is_empty());
        assert!(!path.exists());
    }
}
