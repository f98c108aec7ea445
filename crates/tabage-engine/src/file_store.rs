//! Key-value store backed by one JSON file.
//!
//! Every `set` rewrites the whole object through a temp file and a rename, so
//! a reader never sees a half-written file.

use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tabage_core::{Error, KeyValueStore, Result};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub struct FileStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles.
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Store at `<dir>/state.json`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join("state.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Map<String, Value>> {
        let data = match fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(Error::storage(format!("read {}: {e}", self.path.display()))),
        };
        match serde_json::from_str(&data) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) | Err(_) => {
                warn!("{} is not a JSON object, treating as empty", self.path.display());
                Ok(Map::new())
            }
        }
    }

    async fn write_all(&self, map: &Map<String, Value>) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::storage(format!("mkdir {}: {e}", dir.display())))?;
        }
        let json = serde_json::to_string_pretty(map)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)
            .await
            .map_err(|e| Error::storage(format!("write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Error::storage(format!("rename to {}: {e}", self.path.display())))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_all().await?.remove(key))
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut map = self.read_all().await?;
        map.insert(key.to_string(), value);
        self.write_all(&map).await?;
        debug!(key, path = %self.path.display(), "State written");
        Ok(())
    }
}
