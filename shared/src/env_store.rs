//! Plain (non-secret) environment variables per strategy, stored in clear.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use tracing::error;

use crate::error::Result;
use crate::fs_util;

type EnvMap = BTreeMap<String, BTreeMap<String, String>>;

pub struct EnvStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl EnvStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn read_all(&self) -> EnvMap {
        if !self.path.exists() {
            return EnvMap::new();
        }
        match std::fs::read(&self.path).map(|raw| serde_json::from_slice::<EnvMap>(&raw)) {
            Ok(Ok(all)) => all,
            Ok(Err(e)) => {
                error!("Failed to parse env variables file {}: {}", self.path.display(), e);
                EnvMap::new()
            }
            Err(e) => {
                error!("Failed to load env variables: {}", e);
                EnvMap::new()
            }
        }
    }

    fn write_all(&self, all: &EnvMap) -> Result<()> {
        let json = serde_json::to_vec_pretty(all)?;
        fs_util::write_atomic(&self.path, &json)?;
        Ok(())
    }

    pub fn regular(&self, strategy_id: &str) -> BTreeMap<String, String> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.read_all().remove(strategy_id).unwrap_or_default()
    }

    /// Replace the whole plain set of `strategy_id`.
    pub fn replace(&self, strategy_id: &str, vars: BTreeMap<String, String>) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all = self.read_all();
        all.insert(strategy_id.to_string(), vars);
        self.write_all(&all)
    }

    pub fn remove(&self, strategy_id: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all = self.read_all();
        if all.remove(strategy_id).is_some() {
            self.write_all(&all)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_is_per_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let store = EnvStore::new(dir.path().join("strategy_env.json"));

        store
            .replace("a", BTreeMap::from([("SYMBOL".to_string(), "NIFTY".to_string())]))
            .unwrap();
        store
            .replace("b", BTreeMap::from([("QTY".to_string(), "50".to_string())]))
            .unwrap();
        store
            .replace("a", BTreeMap::from([("EXCHANGE".to_string(), "NSE".to_string())]))
            .unwrap();

        let a = store.regular("a");
        assert_eq!(a.len(), 1);
        assert_eq!(a.get("EXCHANGE").map(String::as_str), Some("NSE"));
        assert_eq!(store.regular("b").get("QTY").map(String::as_str), Some("50"));

        store.remove("a").unwrap();
        assert!(store.regular("a").is_empty());
        assert_eq!(store.regular("b").len(), 1);
    }
}
