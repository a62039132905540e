//! Path resolution and managed-root membership
//!
//! Every staging decision is made on a fully resolved path: `~` expanded,
//! absolute, and free of symlinks and `.`/`..` components. Membership is
//! recomputed on each call since roots change when a context is
//! re-initialized.

use std::ffi::{CString, OsString};
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::constants::MAX_PATH_LENGTH;
use crate::error::UsageError;

/// Expand a leading `~` to the current user's home directory
pub fn expand_user(path: &Path) -> PathBuf {
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(first)) if first == "~" => match dirs::home_dir() {
            Some(home) => home.join(components.as_path()),
            None => path.to_path_buf(),
        },
        _ => path.to_path_buf(),
    }
}

/// Resolve `path` to an absolute, symlink-free form
///
/// The path does not need to exist: the longest existing prefix is
/// canonicalized and the remaining components are normalized lexically, so a
/// file about to be created resolves the same way it will once it exists.
pub fn resolve_path(path: &Path) -> io::Result<PathBuf> {
    let expanded = expand_user(path);
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()?.join(expanded)
    };

    let mut existing = absolute;
    // Components stripped from the end, innermost last
    let mut tail: Vec<Option<OsString>> = Vec::new();

    let base = loop {
        match std::fs::canonicalize(&existing) {
            Ok(canonical) => break canonical,
            Err(_) => match existing.components().next_back() {
                Some(Component::Normal(name)) => {
                    tail.push(Some(name.to_os_string()));
                    existing.pop();
                }
                Some(Component::ParentDir) => {
                    tail.push(None);
                    existing.pop();
                }
                Some(Component::CurDir) => {
                    existing.pop();
                }
                // Root or prefix that cannot be canonicalized
                _ => break existing,
            },
        }
    };

    let mut resolved = base;
    for component in tail.into_iter().rev() {
        match component {
            Some(name) => resolved.push(name),
            None => {
                resolved.pop();
            }
        }
    }
    Ok(resolved)
}

/// Whether `root` is a proper ancestor directory of `path`
///
/// Comparison is component-wise: `/stage/out` contains `/stage/out/a` but
/// neither `/stage/out` itself nor `/stage/out2/a`.
pub fn is_proper_ancestor(root: &Path, path: &Path) -> bool {
    path != root && path.starts_with(root)
}

/// Managed roots of a context, as resolved absolute paths
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagedRoots {
    pub producer: Option<PathBuf>,
    pub consumer: Option<PathBuf>,
}

impl ManagedRoots {
    pub fn new(producer: Option<PathBuf>, consumer: Option<PathBuf>) -> Self {
        Self { producer, consumer }
    }

    /// No roots: nothing is ever routed
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.producer.is_none() && self.consumer.is_none()
    }

    /// `resolved` lies strictly inside the producer root
    pub fn is_producer_managed(&self, resolved: &Path) -> bool {
        self.producer
            .as_deref()
            .is_some_and(|root| is_proper_ancestor(root, resolved))
    }

    /// `resolved` lies strictly inside the consumer root
    pub fn is_consumer_managed(&self, resolved: &Path) -> bool {
        self.consumer
            .as_deref()
            .is_some_and(|root| is_proper_ancestor(root, resolved))
    }
}

/// Convert a path into the NUL-terminated form passed to the service
pub fn path_to_cstring(path: &Path) -> Result<CString, UsageError> {
    #[cfg(unix)]
    let bytes = {
        use std::os::unix::ffi::OsStrExt;
        path.as_os_str().as_bytes().to_vec()
    };
    #[cfg(not(unix))]
    let bytes = path.to_string_lossy().into_owned().into_bytes();

    if bytes.len() >= MAX_PATH_LENGTH {
        return Err(UsageError::PathTooLong {
            len: bytes.len(),
            max: MAX_PATH_LENGTH - 1,
        });
    }

    CString::new(bytes).map_err(|_| UsageError::NulInPath(path.display().to_string()))
}
