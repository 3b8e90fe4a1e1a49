use std::collections::{BTreeMap, HashMap};

use tracing::info;

use shared::{EnvVarSet, Result, SupervisorError};

use crate::facade::Supervisor;

impl Supervisor {
    /// Plain variables and secure key names. Secure values are never returned.
    pub fn get_env(&self, id: &str) -> Result<EnvVarSet> {
        let config = self.inner.configs.require(id)?;
        Ok(EnvVarSet {
            regular: self.inner.env.regular(id),
            secure_keys: self.inner.secrets.keys(id),
            read_only: config.is_running || self.inner.registry.is_busy(id),
        })
    }

    /// Replace the plain variables and merge `secure` into the stored
    /// secrets. Blank keys are dropped; a blank secure value keeps the
    /// stored one.
    pub fn set_env(
        &self,
        id: &str,
        regular: BTreeMap<String, String>,
        secure: HashMap<String, String>,
    ) -> Result<()> {
        let config = self.inner.configs.require(id)?;
        if config.is_running || self.inner.registry.is_busy(id) {
            return Err(SupervisorError::InvalidState(
                "Cannot modify environment variables while strategy is running. Stop it first".to_string(),
            ));
        }

        let regular: BTreeMap<String, String> = regular
            .into_iter()
            .map(|(k, v)| (k.trim().to_string(), v))
            .filter(|(k, _)| !k.is_empty())
            .collect();
        let secure: HashMap<String, String> = secure
            .into_iter()
            .map(|(k, v)| (k.trim().to_string(), v))
            .filter(|(k, v)| !k.is_empty() && !v.is_empty())
            .collect();

        let regular_count = regular.len();
        let secure_count = secure.len();
        self.inner.env.replace(id, regular)?;
        if !secure.is_empty() {
            self.inner.secrets.merge_save(id, secure)?;
        }
        info!(
            "Saved environment for strategy {}: {} regular, {} secure updated",
            id, regular_count, secure_count
        );
        Ok(())
    }
}
