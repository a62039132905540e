//! Staging for structured container files
//!
//! Container formats (HDF5-like files, archives, ...) have their own open and
//! close calls. [`StagedContainer`] brackets those calls the same way
//! [`super::StagedFile`] brackets plain files, for any type implementing
//! [`ContainerFile`].

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use crate::api::route::route;
use crate::api::types::{OpenFlags, Route};
use crate::context::Context;
use crate::error::StageResult;
use crate::metadata::MetadataHandle;

/// A file format with explicit open and close
pub trait ContainerFile: Sized {
    fn open(path: &Path, flags: &OpenFlags) -> io::Result<Self>;

    /// Flush and close; errors here mean the file may be incomplete
    fn close(self) -> io::Result<()>;
}

impl ContainerFile for File {
    fn open(path: &Path, flags: &OpenFlags) -> io::Result<Self> {
        flags.to_open_options().open(path)
    }

    fn close(self) -> io::Result<()> {
        self.sync_all()
    }
}

/// Container opened through a staging context
///
/// Unlike [`super::StagedFile`] there is no default context: the caller
/// always names one.
pub struct StagedContainer<C: ContainerFile> {
    inner: Option<C>,
    path: PathBuf,
    route: Route,
    ctx: Context,
}

impl<C: ContainerFile> std::fmt::Debug for StagedContainer<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagedContainer")
            .field("path", &self.path)
            .field("route", &self.route)
            .field("open", &self.inner.is_some())
            .finish()
    }
}

impl<C: ContainerFile> StagedContainer<C> {
    /// Consume `path` if needed, then open it as `C`
    pub fn open(
        path: impl AsRef<Path>,
        mode: &str,
        ctx: &Context,
        metadata: Option<&MetadataHandle>,
    ) -> StageResult<Self> {
        let path = path.as_ref();
        let flags = OpenFlags::from_mode(mode)?;
        let decision = route(path, &flags, &ctx.roots())?;

        if decision.route == Route::Consume {
            match metadata {
                Some(metadata) => ctx.consume_with_metadata(&decision.resolved, metadata)?,
                None => ctx.consume(&decision.resolved)?,
            }
        }

        let inner = C::open(path, &flags)?;
        tracing::debug!(
            "opened container {} ({:?})",
            decision.resolved.display(),
            decision.route
        );

        Ok(Self {
            inner: Some(inner),
            path: decision.resolved,
            route: decision.route,
            ctx: ctx.clone(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn route(&self) -> Route {
        self.route
    }

    /// The open container
    pub fn get(&self) -> &C {
        self.inner_ref()
    }

    pub fn get_mut(&mut self) -> &mut C {
        match self.inner.as_mut() {
            Some(inner) => inner,
            None => unreachable!("container accessed after close"),
        }
    }

    fn inner_ref(&self) -> &C {
        match self.inner.as_ref() {
            Some(inner) => inner,
            None => unreachable!("container accessed after close"),
        }
    }

    /// Close the container, then produce it if it is producer-managed
    pub fn close(mut self) -> StageResult<()> {
        self.finish()
    }

    fn finish(&mut self) -> StageResult<()> {
        let Some(inner) = self.inner.take() else {
            return Ok(());
        };
        inner.close()?;

        if self.route == Route::ProduceOnClose {
            self.ctx.produce(&self.path)?;
        }
        Ok(())
    }
}

impl<C: ContainerFile> Drop for StagedContainer<C> {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            tracing::error!("Failed to close container {}: {}", self.path.display(), e);
        }
    }
}
