//! Source-URL sidecar: hash → download URL metadata.
//!
//! Lives as `.model_sources.json` at the Lake root so every installation
//! pointed at the same Lake shares it. Keys are content hashes, or
//! `"relpath:" + relpath` for files that have not been hashed yet. The file
//! is rewritten atomically (temp + rename) and tolerated as absent on read.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::paths::RelPath;

/// One source entry, keyed externally by hash or relpath key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub url: String,
    pub added_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename_hint: Option<String>,
}

/// The `"relpath:"`-prefixed fallback key for unhashed files.
pub fn relpath_key(relpath: &RelPath) -> String {
    format!("relpath:{relpath}")
}

/// Sidecar-backed source store with an in-memory cache.
pub struct SourceStore {
    path: PathBuf,
    cache: RwLock<Option<BTreeMap<String, SourceEntry>>>,
}

impl SourceStore {
    pub fn new(path: PathBuf) -> SourceStore {
        SourceStore {
            path,
            cache: RwLock::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the sidecar if it has not been read yet. A missing file reads as
    /// empty; a malformed one is logged and treated as empty rather than
    /// blocking the app.
    fn ensure_loaded(&self) -> Result<(), CoreError> {
        {
            let guard = match self.cache.read() {
                Ok(g) => g,
                Err(p) => p.into_inner(),
            };
            if guard.is_some() {
                return Ok(());
            }
        }
        let loaded = match std::fs::read_to_string(&self.path) {
            Ok(contents) => match serde_json::from_str::<BTreeMap<String, SourceEntry>>(&contents) {
                Ok(map) => map,
                Err(e) => {
                    log::error!("source sidecar {} is malformed: {e}", self.path.display());
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(CoreError::from(e).with_path(&self.path)),
        };
        let mut guard = match self.cache.write() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        guard.get_or_insert(loaded);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<SourceEntry>, CoreError> {
        self.ensure_loaded()?;
        let guard = match self.cache.read() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        Ok(guard.as_ref().and_then(|map| map.get(key).cloned()))
    }

    pub fn all(&self) -> Result<BTreeMap<String, SourceEntry>, CoreError> {
        self.ensure_loaded()?;
        let guard = match self.cache.read() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        Ok(guard.clone().unwrap_or_default())
    }

    pub fn set(&self, key: &str, entry: SourceEntry) -> Result<(), CoreError> {
        self.mutate(|map| {
            map.insert(key.to_string(), entry);
        })
    }

    /// Remove a key; returns whether it existed.
    pub fn remove(&self, key: &str) -> Result<bool, CoreError> {
        let mut existed = false;
        self.mutate(|map| {
            existed = map.remove(key).is_some();
        })?;
        Ok(existed)
    }

    /// Move an entry from the relpath fallback key to its hash key once the
    /// digest is known. Keeps an existing hash entry if one is present.
    pub fn rekey_to_hash(&self, relpath: &RelPath, hash: &str) -> Result<bool, CoreError> {
        let mut moved = false;
        self.mutate(|map| {
            let from = relpath_key(relpath);
            if let Some(entry) = map.remove(&from) {
                map.entry(hash.to_string()).or_insert(entry);
                moved = true;
            }
        })?;
        Ok(moved)
    }

    fn mutate(&self, f: impl FnOnce(&mut BTreeMap<String, SourceEntry>)) -> Result<(), CoreError> {
        self.ensure_loaded()?;
        let mut guard = match self.cache.write() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        let map = guard.get_or_insert_with(BTreeMap::new);
        f(map);
        self.save(map)
    }

    /// Atomic rewrite: serialize to a temp file next to the sidecar, then
    /// rename over it. Concurrent readers on other hosts see old or new,
    /// never a torn write.
    fn save(&self, map: &BTreeMap<String, SourceEntry>) -> Result<(), CoreError> {
        let json = serde_json::to_string_pretty(map)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| CoreError::from(e).with_path(&tmp))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            CoreError::from(e).with_path(&self.path)
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (SourceStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SourceStore::new(dir.path().join(".model_sources.json"));
        (store, dir)
    }

    fn entry(url: &str) -> SourceEntry {
        SourceEntry {
            url: url.into(),
            added_at: chrono::Utc::now().to_rfc3339(),
            notes: None,
            filename_hint: None,
        }
    }

    #[test]
    fn absent_sidecar_reads_as_empty() {
        let (store, _dir) = store();
        assert_eq!(store.get("abc123").unwrap(), None);
        assert!(store.all().unwrap().is_empty());
    }

    #[test]
    fn set_get_remove_round_trip() {
        let (store, _dir) = store();
        store.set("abc123", entry("https://example.com/model.safetensors")).unwrap();
        assert_eq!(
            store.get("abc123").unwrap().unwrap().url,
            "https://example.com/model.safetensors"
        );
        assert!(store.remove("abc123").unwrap());
        assert!(!store.remove("abc123").unwrap());
        assert_eq!(store.get("abc123").unwrap(), None);
    }

    #[test]
    fn writes_are_visible_to_a_fresh_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".model_sources.json");
        {
            let store = SourceStore::new(path.clone());
            store.set("deadbeef", entry("https://host/a")).unwrap();
        }
        let store = SourceStore::new(path);
        assert_eq!(store.get("deadbeef").unwrap().unwrap().url, "https://host/a");
    }

    #[test]
    fn save_leaves_no_temp_file() {
        let (store, dir) = store();
        store.set("k", entry("https://host/x")).unwrap();
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec![".model_sources.json".to_string()]);
    }

    #[test]
    fn malformed_sidecar_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".model_sources.json");
        std::fs::write(&path, b"{ not json").unwrap();
        let store = SourceStore::new(path);
        assert!(store.all().unwrap().is_empty());
    }

    #[test]
    fn relpath_key_format_and_rekey() {
        let (store, _dir) = store();
        let rel = RelPath::new("checkpoints/a.bin").unwrap();
        assert_eq!(relpath_key(&rel), "relpath:checkpoints/a.bin");

        store.set(&relpath_key(&rel), entry("https://host/a")).unwrap();
        assert!(store.rekey_to_hash(&rel, "cafebabe").unwrap());
        assert_eq!(store.get(&relpath_key(&rel)).unwrap(), None);
        assert_eq!(store.get("cafebabe").unwrap().unwrap().url, "https://host/a");

        // Nothing left under the relpath key: rekey is a no-op.
        assert!(!store.rekey_to_hash(&rel, "cafebabe").unwrap());
    }
}
