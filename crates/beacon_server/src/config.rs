//! Key → file configuration store.
//!
//! A `mapping.toml` in the store directory maps logical keys to TOML files in
//! the same directory. Extensions look their configuration up by key and can
//! ask for a fresh read at any time; the authentication gate reloads its key
//! table before every check so keys can be rotated without a restart.
//!
//! This is configuration, meant to be edited by an operator. Nothing here is
//! runtime state.

use crate::error::ConfigError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const MAPPING_FILE: &str = "mapping.toml";

/// The configuration store. Cheap to share behind an `Arc`.
pub struct ConfigStore {
    root: PathBuf,
    files: RwLock<HashMap<String, toml::Value>>,
}

impl ConfigStore {
    /// Creates a store rooted at `root`. Nothing is read until [`load`] is
    /// called.
    ///
    /// [`load`]: ConfigStore::load
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            files: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Loads every mapped configuration file into memory.
    ///
    /// A missing mapping file is not an error; the store starts empty and
    /// extensions create their own mappings on first setup.
    pub async fn load(&self) -> Result<(), ConfigError> {
        let mappings = self.read_mappings().await?;
        let mut files = self.files.write().await;
        files.clear();

        for (key, path) in mappings {
            match self.read_value(&path).await {
                Ok(data) => {
                    info!("Loaded configuration: '{key}'");
                    files.insert(key, data);
                }
                Err(e) => warn!("Unable to load configuration '{key}' from {path}: {e}"),
            }
        }
        Ok(())
    }

    /// Returns the cached configuration for `key`, if any.
    pub async fn get(&self, key: &str) -> Option<toml::Value> {
        self.files.read().await.get(key).cloned()
    }

    /// Returns the file name mapped to `key`, read fresh from disk.
    pub async fn get_mapping(&self, key: &str) -> Result<Option<String>, ConfigError> {
        Ok(self.read_mappings().await?.remove(key))
    }

    /// Maps `key` to `filename`, creating or overwriting the entry in
    /// `mapping.toml`. Callers check for an existing mapping themselves.
    pub async fn save_mapping(&self, key: &str, filename: &str) -> Result<(), ConfigError> {
        debug!("Saving mapping: {key} ({filename})");
        let mut mappings = self.read_mappings().await.unwrap_or_default();
        mappings.insert(key.to_string(), sanitize(filename));

        let mut table = toml::value::Table::new();
        for (k, v) in mappings {
            table.insert(k, toml::Value::String(v));
        }
        self.write_value(MAPPING_FILE, &toml::Value::Table(table))
            .await
    }

    /// Writes `value` to `filename` inside the store directory.
    pub async fn save_file(&self, filename: &str, value: &toml::Value) -> Result<(), ConfigError> {
        self.write_value(&sanitize(filename), value).await
    }

    /// Re-reads the mapping file and every mapped configuration.
    pub async fn reload(&self) -> Result<(), ConfigError> {
        info!("Reloading configuration..");
        self.load().await
    }

    /// Re-reads a single key from disk, consulting the mapping file fresh so
    /// newly added mappings are picked up too.
    pub async fn reload_key(&self, key: &str) -> Result<(), ConfigError> {
        let Some(path) = self.read_mappings().await?.remove(key) else {
            self.files.write().await.remove(key);
            return Ok(());
        };
        let data = self.read_value(&path).await?;
        self.files.write().await.insert(key.to_string(), data);
        Ok(())
    }

    async fn read_mappings(&self) -> Result<HashMap<String, String>, ConfigError> {
        let path = self.root.join(MAPPING_FILE);
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let raw = tokio::fs::read_to_string(&path).await?;
        let value: toml::Value = toml::from_str(&raw)?;
        let mut mappings = HashMap::new();
        if let Some(table) = value.as_table() {
            for (key, entry) in table {
                if let Some(filename) = entry.as_str() {
                    mappings.insert(key.clone(), filename.to_string());
                }
            }
        }
        Ok(mappings)
    }

    async fn read_value(&self, filename: &str) -> Result<toml::Value, ConfigError> {
        let raw = tokio::fs::read_to_string(self.root.join(sanitize(filename))).await?;
        Ok(toml::from_str(&raw)?)
    }

    async fn write_value(&self, filename: &str, value: &toml::Value) -> Result<(), ConfigError> {
        let path = self.root.join(filename);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let raw = toml::to_string_pretty(value)?;
        tokio::fs::write(&path, raw).await?;
        Ok(())
    }
}

/// Keeps mapped file names inside the store directory.
fn sanitize(filename: &str) -> String {
    filename.replace('\\', "/").replace("../", "")
}
