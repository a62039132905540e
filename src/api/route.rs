//! Routing decision for a single open
//!
//! Given a path, the open flags, and a context's managed roots, decide whether
//! the open is a consume, a produce on close, or plain local I/O.

use std::io;
use std::path::{Path, PathBuf};

use super::path::{ManagedRoots, resolve_path};
use super::types::{OpenFlags, Route};

/// Outcome of [`route`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    /// Absolute, symlink-free form of the opened path
    pub resolved: PathBuf,
    pub route: Route,
}

/// Pure routing rule on an already resolved path
///
/// `is_dir` tells whether `resolved` is an existing directory; directories
/// are never consumed.
pub fn decide(resolved: &Path, flags: &OpenFlags, roots: &ManagedRoots, is_dir: bool) -> Route {
    if flags.is_read_like() && !is_dir && roots.is_consumer_managed(resolved) {
        Route::Consume
    } else if flags.is_write_like() && roots.is_producer_managed(resolved) {
        Route::ProduceOnClose
    } else {
        Route::Unmanaged
    }
}

/// Resolve `path` and decide its route against `roots`
pub fn route(path: &Path, flags: &OpenFlags, roots: &ManagedRoots) -> io::Result<RouteDecision> {
    let resolved = resolve_path(path)?;
    // Empty roots route nothing; skip the stat.
    let route = if roots.is_empty() {
        Route::Unmanaged
    } else {
        decide(&resolved, flags, roots, resolved.is_dir())
    };
    Ok(RouteDecision { resolved, route })
}
