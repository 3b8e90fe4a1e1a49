pub mod clock;
pub mod config;
pub mod config_store;
pub mod env_store;
pub mod error;
pub mod fs_util;
pub mod models;
pub mod secrets;

pub use clock::SupervisorClock;
pub use config::Config;
pub use config_store::ConfigStore;
pub use env_store::EnvStore;
pub use error::{Result, SpawnFailureKind, SupervisorError};
pub use models::*;
pub use secrets::{EncryptedFileSecretStore, SecretStore};
