//! On-disk workflow template library.
//!
//! Each ratio kind named in a prompt file maps to `<dir>/<kind>.json`.
//! Templates are read from disk on every [`WorkflowLibrary::load`] call so
//! that no two generations ever share a parsed document.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::CoreError;

/// File extension of workflow templates.
pub const WORKFLOW_EXTENSION: &str = "json";

/// Maximum length of a workflow kind name.
const MAX_KIND_LEN: usize = 128;

/// Kind names map directly to file names, so only a conservative character
/// set is accepted: alphanumeric, hyphen, underscore, dot. A leading dot is
/// rejected to rule out `..` and hidden files.
pub fn is_valid_kind(kind: &str) -> bool {
    !kind.is_empty()
        && kind.len() <= MAX_KIND_LEN
        && !kind.starts_with('.')
        && kind
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// Resolves ratio kinds to workflow templates in a directory.
#[derive(Debug, Clone)]
pub struct WorkflowLibrary {
    dir: PathBuf,
}

impl WorkflowLibrary {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the template for `kind`.
    pub fn path_for(&self, kind: &str) -> Result<PathBuf, CoreError> {
        if !is_valid_kind(kind) {
            return Err(CoreError::Validation(format!(
                "Invalid workflow kind '{kind}'. Allowed: letters, digits, '-', '_', '.'"
            )));
        }
        Ok(self.dir.join(format!("{kind}.{WORKFLOW_EXTENSION}")))
    }

    /// Load a fresh copy of the template for `kind`.
    ///
    /// Returns [`CoreError::NotFound`] when no template file exists and
    /// [`CoreError::Json`] when the file is not valid JSON.
    pub fn load(&self, kind: &str) -> Result<Value, CoreError> {
        let path = self.path_for(kind)?;

        let content = std::fs::read_to_string(&path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                CoreError::NotFound {
                    entity: "Workflow",
                    name: format!("{kind} ({})", path.display()),
                }
            } else {
                CoreError::Io {
                    path: path.clone(),
                    source,
                }
            }
        })?;

        serde_json::from_str(&content).map_err(|source| CoreError::Json { path, source })
    }

    /// Kinds with a template in the library directory, sorted.
    pub fn kinds(&self) -> Result<Vec<String>, CoreError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|source| CoreError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut kinds = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|source| CoreError::Io {
                    path: self.dir.clone(),
                    source,
                })?
                .path();

            if path.extension().and_then(|e| e.to_str()) != Some(WORKFLOW_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if is_valid_kind(stem) {
                    kinds.push(stem.to_string());
                }
            }
        }

        kinds.sort();
        Ok(kinds)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
