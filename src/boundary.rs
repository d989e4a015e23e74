//! Filesystem boundary validation.
//!
//! Every user-supplied path enters the server through exactly two doors: a
//! route body/query parameter or an MCP tool argument. Both call sites route
//! through [`BoundaryGuard::validate`] before touching the filesystem.

use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::error::{DomainError, ErrorCode};

#[derive(Error, Debug)]
pub enum BoundaryError {
    #[error("path escapes the boundary root: {path}")]
    Violation { path: PathBuf },
    #[error("boundary root is invalid: {0}")]
    BadRoot(#[from] io::Error),
}

impl From<BoundaryError> for DomainError {
    fn from(err: BoundaryError) -> Self {
        match err {
            BoundaryError::Violation { path } => {
                DomainError::new(ErrorCode::BoundaryViolation, "path outside the boundary root")
                    .with_details(serde_json::json!({ "path": path }))
            }
            BoundaryError::BadRoot(e) => DomainError::internal(e.to_string()),
        }
    }
}

/// Validates paths against a single configured root.
pub struct BoundaryGuard {
    root: PathBuf,
}

impl BoundaryGuard {
    /// The root itself must exist; it is canonicalized once so symlinked
    /// roots compare consistently.
    pub fn new(root: &Path) -> Result<Self, BoundaryError> {
        let root = root.canonicalize()?;
        Ok(Self { root })
    }

    #[allow(dead_code)] // API completeness
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `path` (relative paths resolve against the root) and require
    /// containment after symlink resolution. Returns the resolved path.
    pub fn validate(&self, path: &Path) -> Result<PathBuf, BoundaryError> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        };

        let resolved = resolve(&absolute).ok_or_else(|| BoundaryError::Violation {
            path: path.to_path_buf(),
        })?;

        if resolved.starts_with(&self.root) {
            Ok(resolved)
        } else {
            Err(BoundaryError::Violation {
                path: path.to_path_buf(),
            })
        }
    }
}

/// Canonicalize as much of the path as exists, then append the remaining
/// components lexically. `..` in the non-existent tail is rejected (returns
/// None) since it cannot be resolved against real directory structure.
fn resolve(path: &Path) -> Option<PathBuf> {
    if let Ok(canonical) = path.canonicalize() {
        return Some(canonical);
    }

    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            let mut resolved = canonical;
            for part in tail.iter().rev() {
                resolved.push(part);
            }
            return Some(resolved);
        }
        let name = existing.file_name()?.to_os_string();
        tail.push(name);
        if !existing.pop() {
            return None;
        }
    }
}
