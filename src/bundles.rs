//! Bundle store: named ordered sets of library files, one JSON file per
//! bundle under `<app_data_dir>/bundles/`. Referenced by external
//! provisioning flows; the core only does CRUD.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::paths::RelPath;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleAsset {
    pub relpath: RelPath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url_override: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub assets: Vec<BundleAsset>,
}

/// Listing row: bundle header without the asset bodies.
#[derive(Debug, Clone, Serialize)]
pub struct BundleSummary {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub asset_count: usize,
}

/// Directory-of-JSON-files bundle store.
pub struct BundleStore {
    dir: PathBuf,
}

/// Bundle names become file names; keep them to one safe path component.
fn validate_name(name: &str) -> Result<(), CoreError> {
    if name.trim().is_empty() {
        return Err(CoreError::Invalid {
            message: "bundle name cannot be empty".into(),
        });
    }
    if name.len() >= 255 {
        return Err(CoreError::Invalid {
            message: format!("bundle name too long ({} bytes)", name.len()),
        });
    }
    if name.starts_with('.') || name.chars().any(|c| c == '/' || c == '\\' || c == '\0') {
        return Err(CoreError::Invalid {
            message: format!("bundle name contains disallowed characters: {name:?}"),
        });
    }
    Ok(())
}

impl BundleStore {
    pub fn new(dir: PathBuf) -> BundleStore {
        BundleStore { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn bundle_path(&self, name: &str) -> Result<PathBuf, CoreError> {
        validate_name(name)?;
        Ok(self.dir.join(format!("{name}.json")))
    }

    pub fn list(&self) -> Result<Vec<BundleSummary>, CoreError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CoreError::from(e).with_path(&self.dir)),
        };
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_bundle_file(&path) {
                Ok(bundle) => out.push(BundleSummary {
                    asset_count: bundle.assets.len(),
                    name: bundle.name,
                    description: bundle.description,
                    created_at: bundle.created_at,
                    updated_at: bundle.updated_at,
                }),
                Err(e) => log::warn!("skipping unreadable bundle file {}: {e}", path.display()),
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    pub fn get(&self, name: &str) -> Result<Option<Bundle>, CoreError> {
        let path = self.bundle_path(name)?;
        match read_bundle_file(&path) {
            Ok(bundle) => Ok(Some(bundle)),
            Err(CoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn create(&self, name: &str, description: Option<String>) -> Result<Bundle, CoreError> {
        let path = self.bundle_path(name)?;
        if path.exists() {
            return Err(CoreError::Invalid {
                message: format!("bundle {name:?} already exists"),
            });
        }
        let now = Utc::now().to_rfc3339();
        let bundle = Bundle {
            name: name.to_string(),
            description,
            created_at: now.clone(),
            updated_at: now,
            assets: Vec::new(),
        };
        self.write(&bundle)?;
        Ok(bundle)
    }

    /// Replace a bundle's asset list, preserving creation time.
    pub fn update_assets(&self, name: &str, assets: Vec<BundleAsset>) -> Result<Bundle, CoreError> {
        let mut bundle = self.get(name)?.ok_or_else(|| CoreError::NotFound {
            path: format!("bundle {name}"),
        })?;
        bundle.assets = assets;
        bundle.updated_at = Utc::now().to_rfc3339();
        self.write(&bundle)?;
        Ok(bundle)
    }

    /// Append one asset, replacing any existing entry with the same relpath.
    pub fn add_asset(&self, name: &str, asset: BundleAsset) -> Result<Bundle, CoreError> {
        let mut bundle = self.get(name)?.ok_or_else(|| CoreError::NotFound {
            path: format!("bundle {name}"),
        })?;
        match bundle.assets.iter_mut().find(|a| a.relpath == asset.relpath) {
            Some(existing) => *existing = asset,
            None => bundle.assets.push(asset),
        }
        bundle.updated_at = Utc::now().to_rfc3339();
        self.write(&bundle)?;
        Ok(bundle)
    }

    /// Drop one asset by relpath.
    pub fn remove_asset(&self, name: &str, relpath: &RelPath) -> Result<Bundle, CoreError> {
        let mut bundle = self.get(name)?.ok_or_else(|| CoreError::NotFound {
            path: format!("bundle {name}"),
        })?;
        let before = bundle.assets.len();
        bundle.assets.retain(|a| &a.relpath != relpath);
        if bundle.assets.len() == before {
            return Err(CoreError::NotFound {
                path: format!("asset {relpath} in bundle {name}"),
            });
        }
        bundle.updated_at = Utc::now().to_rfc3339();
        self.write(&bundle)?;
        Ok(bundle)
    }

    /// Append many assets, skipping relpaths already in the bundle (folder
    /// bulk-add). Returns the bundle and how many were actually added.
    pub fn add_assets(&self, name: &str, assets: Vec<BundleAsset>) -> Result<(Bundle, usize), CoreError> {
        let mut bundle = self.get(name)?.ok_or_else(|| CoreError::NotFound {
            path: format!("bundle {name}"),
        })?;
        let mut added = 0;
        for asset in assets {
            if bundle.assets.iter().any(|a| a.relpath == asset.relpath) {
                continue;
            }
            bundle.assets.push(asset);
            added += 1;
        }
        if added > 0 {
            bundle.updated_at = Utc::now().to_rfc3339();
            self.write(&bundle)?;
        }
        Ok((bundle, added))
    }

    pub fn delete(&self, name: &str) -> Result<bool, CoreError> {
        let path = self.bundle_path(name)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CoreError::from(e).with_path(&path)),
        }
    }

    fn write(&self, bundle: &Bundle) -> Result<(), CoreError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| CoreError::from(e).with_path(&self.dir))?;
        let path = self.bundle_path(&bundle.name)?;
        let json = serde_json::to_string_pretty(bundle)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| CoreError::from(e).with_path(&tmp))?;
        std::fs::rename(&tmp, &path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp);
            CoreError::from(e).with_path(&path)
        })?;
        Ok(())
    }
}

fn read_bundle_file(path: &Path) -> Result<Bundle, CoreError> {
    let contents = std::fs::read_to_string(path).map_err(|e| CoreError::from(e).with_path(path))?;
    serde_json::from_str(&contents).map_err(|e| CoreError::Storage {
        message: format!("bundle file {}: {e}", path.display()),
    })
}
