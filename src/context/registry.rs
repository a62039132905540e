//! Process-wide default context
//!
//! Scoped file operations that are not given a [`Context`] fall back to the
//! default registered here, created lazily from the service's environment
//! configuration on first use.
//!
//! The slot is a single process global. Swapping it is atomic, but two
//! threads that register different contexts race on which one later calls
//! observe. Pass contexts explicitly when that matters.

use std::sync::{Mutex, MutexGuard};

use super::Context;
use crate::error::StageResult;

static DEFAULT: Mutex<Option<Context>> = Mutex::new(None);

fn slot() -> MutexGuard<'static, Option<Context>> {
    DEFAULT.lock().unwrap_or_else(|e| e.into_inner())
}

/// The default context, created on first use
///
/// Creation loads the library from the default locations and initializes from
/// the environment. If that fails the error is returned and nothing is
/// registered, so the next call tries again.
pub fn default_context() -> StageResult<Context> {
    default_context_with(Context::new)
}

/// [`default_context`] with a caller-supplied constructor
///
/// `create` runs only when no default is registered. The context it returns
/// is initialized from the environment before it is registered.
pub fn default_context_with<F>(create: F) -> StageResult<Context>
where
    F: FnOnce() -> StageResult<Context>,
{
    let mut slot = slot();
    if let Some(ctx) = slot.as_ref() {
        return Ok(ctx.clone());
    }

    tracing::debug!("Creating default staging context");
    let ctx = create()?;
    ctx.init_from_environment()?;
    *slot = Some(ctx.clone());
    Ok(ctx)
}

/// Make `ctx` the process default, returning the previous one
///
/// Every later call that relies on the default uses `ctx`, including calls
/// from other threads.
pub fn register_default(ctx: Context) -> Option<Context> {
    slot().replace(ctx)
}

/// Remove the process default
///
/// The removed context is finalized once its last clone is dropped.
pub fn clear_default() -> Option<Context> {
    slot().take()
}

/// Pick the context for one operation
///
/// An explicit context wins and, with `register`, also becomes the default.
/// Without one the default is used.
pub fn resolve_context(explicit: Option<&Context>, register: bool) -> StageResult<Context> {
    match explicit {
        Some(ctx) => {
            if register {
                register_default(ctx.clone());
            }
            Ok(ctx.clone())
        }
        None => default_context(),
    }
}
