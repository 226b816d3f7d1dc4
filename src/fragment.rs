//! Read-only library of reusable instruction fragments.
//!
//! Fragments are plain text snippets referenced by path from station
//! templates and concatenated verbatim into compiled plans. The store is
//! loaded once and never mutated by a running orchestration.

use crate::errors::{CompileError, RefKind};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Default, Clone)]
pub struct FragmentStore {
    fragments: HashMap<String, String>,
}

impl FragmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every file under a directory, keyed by its path relative to
    /// the root (forward slashes regardless of platform).
    pub fn from_dir(root: &Path) -> Result<Self> {
        let mut store = Self::new();
        store.load_dir(root, root)?;
        Ok(store)
    }

    fn load_dir(&mut self, root: &Path, dir: &Path) -> Result<()> {
        let entries =
            std::fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                self.load_dir(root, &path)?;
            } else {
                let key = path
                    .strip_prefix(root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .replace('\\', "/");
                let body = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read fragment {}", path.display()))?;
                self.fragments.insert(key, body);
            }
        }
        Ok(())
    }

    /// Register a fragment directly (tests, in-memory catalogs).
    pub fn insert(&mut self, path: &str, body: &str) {
        self.fragments.insert(path.to_string(), body.to_string());
    }

    /// Fetch one fragment body.
    pub fn get(&self, path: &str) -> Result<&str, CompileError> {
        self.fragments
            .get(path)
            .map(String::as_str)
            .ok_or_else(|| CompileError::UnknownReference {
                kind: RefKind::Fragment,
                reference: path.to_string(),
            })
    }

    /// Fetch several fragments, preserving order. Any missing path fails
    /// the whole resolution.
    pub fn resolve_all(&self, paths: &[String]) -> Result<Vec<&str>, CompileError> {
        paths.iter().map(|p| self.get(p)).collect()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.fragments.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}
