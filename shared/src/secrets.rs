//! Encrypted-at-rest storage for secure strategy environment variables.
//!
//! The blob is `base64(nonce || AES-256-GCM ciphertext)` of a JSON map
//! `strategy_id -> { key -> value }`. The 256-bit key lives in its own file,
//! generated on first use and restricted to the owner where POSIX
//! permissions exist.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use tracing::{error, info, warn};

use crate::error::{Result, SupervisorError};
use crate::fs_util;

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

type SecretMap = BTreeMap<String, BTreeMap<String, String>>;

/// Storage for secret env vars. Callers never learn values except through
/// `load`, which is reserved for building a child's environment.
pub trait SecretStore: Send + Sync {
    /// Decrypted secrets of one strategy. Empty when the store is unreadable.
    fn load(&self, strategy_id: &str) -> HashMap<String, String>;

    /// Add or overwrite the given keys; other keys and strategies are kept.
    fn merge_save(&self, strategy_id: &str, updates: HashMap<String, String>) -> Result<()>;

    /// Key names only, sorted.
    fn keys(&self, strategy_id: &str) -> Vec<String>;

    fn remove(&self, strategy_id: &str) -> Result<()>;
}

pub struct EncryptedFileSecretStore {
    blob_path: PathBuf,
    cipher: Aes256Gcm,
    lock: Mutex<()>,
}

impl EncryptedFileSecretStore {
    /// Open the store, creating the key file on first use.
    pub fn open(blob_path: impl Into<PathBuf>, key_path: impl AsRef<Path>) -> Result<Self> {
        let key = load_or_create_key(key_path.as_ref())?;
        Ok(Self {
            blob_path: blob_path.into(),
            cipher: Aes256Gcm::new(&key),
            lock: Mutex::new(()),
        })
    }

    fn decrypt_all(&self) -> Result<SecretMap> {
        if !self.blob_path.exists() {
            return Ok(SecretMap::new());
        }
        let encoded = fs::read_to_string(&self.blob_path)?;
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|e| SupervisorError::CorruptSecretStore(format!("invalid encoding: {}", e)))?;
        if raw.len() <= NONCE_SIZE {
            return Err(SupervisorError::CorruptSecretStore("blob too short".to_string()));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SupervisorError::CorruptSecretStore("authentication failed".to_string()))?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| SupervisorError::CorruptSecretStore(format!("invalid payload: {}", e)))
    }

    fn encrypt_all(&self, all: &SecretMap) -> Result<()> {
        let plaintext = serde_json::to_vec(all)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_ref())
            .map_err(|_| SupervisorError::CorruptSecretStore("encryption failed".to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);

        fs_util::write_private(&self.blob_path, STANDARD.encode(blob).as_bytes())?;
        Ok(())
    }

    /// Read for a mutation. A blob we cannot decrypt is moved aside rather
    /// than overwritten, then the mutation starts from an empty map.
    fn read_for_write(&self) -> SecretMap {
        match self.decrypt_all() {
            Ok(all) => all,
            Err(e) => {
                error!("Secure env store unreadable, starting empty: {}", e);
                if let Some(moved) =
                    fs_util::quarantine(&self.blob_path, &chrono::Utc::now().timestamp().to_string())
                {
                    warn!("Unreadable secure env store preserved at {}", moved.display());
                }
                SecretMap::new()
            }
        }
    }
}

impl SecretStore for EncryptedFileSecretStore {
    fn load(&self, strategy_id: &str) -> HashMap<String, String> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        match self.decrypt_all() {
            Ok(mut all) => all
                .remove(strategy_id)
                .map(|m| m.into_iter().collect())
                .unwrap_or_default(),
            Err(e) => {
                error!("Failed to load secure env variables for {}: {}", strategy_id, e);
                HashMap::new()
            }
        }
    }

    fn merge_save(&self, strategy_id: &str, updates: HashMap<String, String>) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all = self.read_for_write();
        let entry = all.entry(strategy_id.to_string()).or_default();
        let count = updates.len();
        entry.extend(updates);
        self.encrypt_all(&all)?;
        info!("Updated {} secure env variables for strategy {}", count, strategy_id);
        Ok(())
    }

    fn keys(&self, strategy_id: &str) -> Vec<String> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        match self.decrypt_all() {
            Ok(all) => all
                .get(strategy_id)
                .map(|m| m.keys().cloned().collect())
                .unwrap_or_default(),
            Err(e) => {
                error!("Failed to load secure env keys for {}: {}", strategy_id, e);
                Vec::new()
            }
        }
    }

    fn remove(&self, strategy_id: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all = self.read_for_write();
        if all.remove(strategy_id).is_some() {
            self.encrypt_all(&all)?;
        }
        Ok(())
    }
}

fn load_or_create_key(path: &Path) -> Result<Key<Aes256Gcm>> {
    if path.exists() {
        let encoded = fs::read_to_string(path)?;
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|e| SupervisorError::Config(format!("Invalid encryption key file: {}", e)))?;
        if raw.len() != KEY_SIZE {
            return Err(SupervisorError::Config(format!(
                "Encryption key must be {} bytes, found {}",
                KEY_SIZE,
                raw.len()
            )));
        }
        return Ok(*Key::<Aes256Gcm>::from_slice(&raw));
    }

    let key = Aes256Gcm::generate_key(OsRng);
    fs_util::write_private(path, STANDARD.encode(key).as_bytes())?;
    info!("Generated new encryption key at {}", path.display());
    Ok(key)
}
