//! Workspace path identity.
//!
//! Editors report paths in whatever form they opened the file with: relative
//! to their working directory, through a symlinked checkout, or with `.`/`..`
//! components. The semantic index, the buffer store and the cache all key on
//! one canonical form produced here:
//!
//! - relative paths are resolved against the workspace root;
//! - existing paths are canonicalized (symlinks resolved);
//! - paths that no longer exist keep their canonicalized parent directory,
//!   so a delete notification still maps to the key the file was indexed
//!   under;
//! - anything else is cleaned lexically.

use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone)]
pub struct PathNormalizer {
    root: PathBuf,
}

impl PathNormalizer {
    pub fn new(root: &Path) -> Self {
        let absolute = if root.is_absolute() {
            root.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(root))
                .unwrap_or_else(|_| root.to_path_buf())
        };
        let root = std::fs::canonicalize(&absolute).unwrap_or_else(|_| clean(&absolute));
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn normalize(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };
        if let Ok(canonical) = std::fs::canonicalize(&joined) {
            return canonical;
        }
        let cleaned = clean(&joined);
        match (cleaned.parent(), cleaned.file_name()) {
            (Some(parent), Some(name)) => match std::fs::canonicalize(parent) {
                Ok(parent) => parent.join(name),
                Err(_) => cleaned,
            },
            _ => cleaned,
        }
    }

    /// Normalized path as the string key used by the index and cache.
    pub fn key(&self, path: impl AsRef<Path>) -> String {
        self.normalize(path).to_string_lossy().to_string()
    }
}

/// Drop `.` components and fold `..` without touching the filesystem.
fn clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}
