//! Canonical relative-path type and the root-join traversal guard.
//!
//! Every path-bearing input crosses through `RelPath::new` before it touches
//! the filesystem; higher components rely on this for path safety.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::CoreError;

/// A normalized, forward-slash-separated path relative to a side's root.
///
/// Invariants: non-empty, no leading or trailing separator, no empty
/// segments, no `.` or `..` components. The relpath is the canonical
/// cross-side identity of a file.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct RelPath(String);

impl RelPath {
    /// Normalize and validate an input string into a `RelPath`.
    ///
    /// Backslashes are accepted as separators (the library may have lived on
    /// Windows before); redundant slashes are collapsed.
    pub fn new(input: &str) -> Result<RelPath, CoreError> {
        let normalized = input.replace('\\', "/");
        let trimmed = normalized.trim_matches('/');
        if trimmed.is_empty() {
            return Err(CoreError::PathEscape {
                path: input.to_string(),
            });
        }
        let mut segments = Vec::new();
        for segment in trimmed.split('/') {
            match segment {
                "" => continue,
                "." | ".." => {
                    return Err(CoreError::PathEscape {
                        path: input.to_string(),
                    });
                }
                s if s.contains('\0') => {
                    return Err(CoreError::PathEscape {
                        path: input.to_string(),
                    });
                }
                s => segments.push(s),
            }
        }
        if segments.is_empty() {
            return Err(CoreError::PathEscape {
                path: input.to_string(),
            });
        }
        Ok(RelPath(segments.join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Final path component.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Parent relpath, or `None` for a top-level entry.
    pub fn parent(&self) -> Option<RelPath> {
        self.0.rfind('/').map(|idx| RelPath(self.0[..idx].to_string()))
    }

    /// Whether this relpath sits under `folder` (a normalized folder prefix).
    /// An empty folder matches everything.
    pub fn is_under(&self, folder: &str) -> bool {
        let folder = folder.trim_matches('/');
        if folder.is_empty() {
            return true;
        }
        self.0
            .strip_prefix(folder)
            .is_some_and(|rest| rest.starts_with('/'))
    }

    /// The remainder after stripping `folder/`, if this entry is under it.
    pub fn strip_folder(&self, folder: &str) -> Option<&str> {
        let folder = folder.trim_matches('/');
        if folder.is_empty() {
            return Some(&self.0);
        }
        self.0
            .strip_prefix(folder)
            .and_then(|rest| rest.strip_prefix('/'))
    }

    /// Prepend a folder prefix, producing a new relpath.
    pub fn prefixed(folder: &str, suffix: &str) -> Result<RelPath, CoreError> {
        let folder = folder.trim_matches('/');
        if folder.is_empty() {
            RelPath::new(suffix)
        } else {
            RelPath::new(&format!("{folder}/{suffix}"))
        }
    }
}

impl std::fmt::Display for RelPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RelPath {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        RelPath::new(&raw).map_err(serde::de::Error::custom)
    }
}

/// Join a root with a relpath, verifying the result stays lexically inside
/// the root.
///
/// `RelPath` construction already rejects traversal components, so this is a
/// final check on the composed absolute path.
pub fn join_guarded(root: &Path, relpath: &RelPath) -> Result<PathBuf, CoreError> {
    let mut joined = root.to_path_buf();
    for segment in relpath.segments() {
        joined.push(segment);
    }
    // Component-wise containment: the joined path must extend the root with
    // normal components only.
    let root_components: Vec<Component> = root.components().collect();
    let joined_components: Vec<Component> = joined.components().collect();
    if joined_components.len() <= root_components.len()
        || joined_components[..root_components.len()] != root_components[..]
        || joined_components[root_components.len()..]
            .iter()
            .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(CoreError::PathEscape {
            path: joined.display().to_string(),
        });
    }
    Ok(joined)
}

/// Derive the relpath of `absolute` under `root`, or fail with `PathEscape`.
pub fn to_relpath(root: &Path, absolute: &Path) -> Result<RelPath, CoreError> {
    let stripped = absolute
        .strip_prefix(root)
        .map_err(|_| CoreError::PathEscape {
            path: absolute.display().to_string(),
        })?;
    let mut segments = Vec::new();
    for component in stripped.components() {
        match component {
            Component::Normal(os) => match os.to_str() {
                Some(s) => segments.push(s.to_string()),
                None => {
                    return Err(CoreError::PathEscape {
                        path: absolute.display().to_string(),
                    });
                }
            },
            _ => {
                return Err(CoreError::PathEscape {
                    path: absolute.display().to_string(),
                });
            }
        }
    }
    RelPath::new(&segments.join("/"))
}
