//! Credential Storage Module
//!
//! Key-value persistence for the auth token and user profile.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::auth::{Credentials, UserProfile};

const TOKEN_KEY: &str = "token";
const USER_KEY: &str = "user";

/// Async key-value store for small secrets
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;
    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;
    async fn delete_item(&self, key: &str) -> Result<(), StorageError>;
}

/// File-backed store, one file per key
pub struct FileCredentialStore {
    storage_path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        let storage_path = storage_path.into();
        debug!("Credential storage at: {:?}", storage_path);
        Self { storage_path }
    }

    pub fn path(&self) -> &Path {
        &self.storage_path
    }

    fn file_for(&self, key: &str) -> PathBuf {
        self.storage_path.join(format!("{}.dat", key))
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        match tokio::fs::read_to_string(self.file_for(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e.to_string())),
        }
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.storage_path)
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;
        tokio::fs::write(self.file_for(key), value)
            .await
            .map_err(|e| StorageError::Io(e.to_string()))?;
        debug!("Stored value for key: {}", key);
        Ok(())
    }

    async fn delete_item(&self, key: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.file_for(key)).await {
            Ok(()) => {
                debug!("Deleted stored value for key: {}", key);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e.to_string())),
        }
    }
}

/// Process-local store
#[derive(Default)]
pub struct MemoryCredentialStore {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.items.lock().get(key).cloned())
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.items.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_item(&self, key: &str) -> Result<(), StorageError> {
        self.items.lock().remove(key);
        Ok(())
    }
}

/// Token and profile as persisted between launches
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSession {
    pub token: String,
    pub user: UserProfile,
}

impl StoredSession {
    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.token.clone(), self.user.id)
    }

    /// Load the stored session. Missing or partial data yields `None`.
    pub async fn load(store: &dyn CredentialStore) -> Result<Option<Self>, StorageError> {
        let Some(token) = store.get_item(TOKEN_KEY).await? else {
            return Ok(None);
        };
        let Some(user) = store.get_item(USER_KEY).await? else {
            return Ok(None);
        };

        let user: UserProfile = serde_json::from_str(&user)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(Some(Self { token, user }))
    }

    pub async fn save(&self, store: &dyn CredentialStore) -> Result<(), StorageError> {
        let user = serde_json::to_string(&self.user)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        store.set_item(TOKEN_KEY, &self.token).await?;
        store.set_item(USER_KEY, &user).await?;
        info!(user_id = %self.user.id, "Saved session");
        Ok(())
    }

    pub async fn clear(store: &dyn CredentialStore) -> Result<(), StorageError> {
        store.delete_item(TOKEN_KEY).await?;
        store.delete_item(USER_KEY).await?;
        info!("Cleared stored session");
        Ok(())
    }
}

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}
