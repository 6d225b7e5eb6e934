//! Durable JSON snapshot store
//!
//! Backs the thread registry and the content relay. The whole keyed map is
//! written as one JSON document, via a temp file and rename so a crash never
//! leaves a half-written snapshot behind. Without a path the store is purely
//! in-memory and every write is a no-op.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::core::error::{RelayError, Result};

pub struct JsonStore {
    path: Option<PathBuf>,
    /// One writer per file at a time
    write_lock: Mutex<()>,
}

impl JsonStore {
    /// File-backed store at `path`
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            write_lock: Mutex::new(()),
        }
    }

    pub fn from_option(path: Option<PathBuf>) -> Self {
        match path {
            Some(path) => Self::open(path),
            None => Self::in_memory(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Read the last snapshot; a missing file is an empty store
    pub async fn load<T>(&self) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        let Some(path) = &self.path else {
            return Ok(None);
        };

        match tokio::fs::read_to_string(path).await {
            Ok(content) if content.trim().is_empty() => Ok(None),
            Ok(content) => serde_json::from_str(&content).map(Some).map_err(|e| {
                RelayError::storage(format!("Corrupt snapshot {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist `value` as the new snapshot.
    ///
    /// Callers build the snapshot with their pending change applied and
    /// commit it in memory only after this returns `Ok`.
    pub async fn save<T>(&self, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let _guard = self.write_lock.lock().await;

        let Some(path) = &self.path else {
            return Ok(());
        };

        let json = serde_json::to_string_pretty(value)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path().join("nested").join("state.json"));

        let mut map = BTreeMap::new();
        map.insert("a".to_string(), 1u32);
        store.save(&map).await.unwrap();

        let reopened = JsonStore::open(dir.path().join("nested").join("state.json"));
        let loaded: Option<BTreeMap<String, u32>> = reopened.load().await.unwrap();
        assert_eq!(loaded, Some(map));
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path().join("absent.json"));
        let loaded: Option<BTreeMap<String, u32>> = store.load().await.unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = JsonStore::open(&path);
        let err = store.load::<BTreeMap<String, u32>>().await.unwrap_err();
        assert!(matches!(err, RelayError::Storage(_)));
    }

    #[tokio::test]
    async fn test_in_memory_is_noop() {
        let store = JsonStore::in_memory();
        store.save(&vec![1, 2, 3]).await.unwrap();
        let loaded: Option<Vec<u32>> = store.load().await.unwrap();
        assert!(loaded.is_none());
        assert!(store.path().is_none());
    }

    #[tokio::test]
    async fn test_blocked_write_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::create_dir(dir.path().join("state.json.tmp")).unwrap();

        let store = JsonStore::open(&path);
        assert!(store.save(&vec![1u32]).await.is_err());
        assert!(!path.exists());
    }
}
