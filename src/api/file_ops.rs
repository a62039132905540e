/// Staged file operations
///
/// A [`StagedFile`] is a local file whose open and close are bracketed by
/// transfer-service calls when its path lies under a managed root:
///
/// - reads under the consumer root consume the file before it is opened
/// - truncating writes under the producer root produce it after it is closed
/// - everything else is plain local I/O with no service calls at all

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use crate::api::route::route;
use crate::api::types::{FileState, OpenFlags, Route};
use crate::context::{Context, resolve_context};
use crate::error::{StageError, StageResult, UsageError};
use crate::metadata::MetadataHandle;

#[derive(Debug, Clone)]
enum ModeSpec {
    Text(String),
    Flags(OpenFlags),
}

/// Builder for [`StagedFile`]
///
/// Without [`StagedOpenOptions::context`] the process default context is
/// used, created on first use.
#[derive(Debug, Clone, Default)]
pub struct StagedOpenOptions<'a> {
    mode: Option<ModeSpec>,
    context: Option<&'a Context>,
    register_context: bool,
    metadata: Option<&'a MetadataHandle>,
}

impl<'a> StagedOpenOptions<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// stdio-style mode string (`"r"`, `"wb"`, `"a+"`, ...)
    pub fn mode(mut self, mode: &str) -> Self {
        self.mode = Some(ModeSpec::Text(mode.to_string()));
        self
    }

    /// Already parsed flags, e.g. from [`OpenFlags::from_posix`]
    pub fn flags(mut self, flags: OpenFlags) -> Self {
        self.mode = Some(ModeSpec::Flags(flags));
        self
    }

    pub fn context(mut self, ctx: &'a Context) -> Self {
        self.context = Some(ctx);
        self
    }

    /// Also make the explicit context the process default
    pub fn register_context(mut self, register: bool) -> Self {
        self.register_context = register;
        self
    }

    /// Metadata record used for the consume, if one is needed
    pub fn metadata(mut self, metadata: &'a MetadataHandle) -> Self {
        self.metadata = Some(metadata);
        self
    }

    fn open_flags(&self) -> Result<OpenFlags, UsageError> {
        match &self.mode {
            None => Err(UsageError::MissingMode),
            Some(ModeSpec::Text(mode)) => OpenFlags::from_mode(mode),
            Some(ModeSpec::Flags(flags)) => Ok(*flags),
        }
    }

    /// Open `path`, consuming it first when it is consumer-managed
    pub fn open(&self, path: impl AsRef<Path>) -> StageResult<StagedFile> {
        let path = path.as_ref();
        let flags = self.open_flags()?;
        let ctx = resolve_context(self.context, self.register_context)?;

        let decision = route(path, &flags, &ctx.roots())?;
        tracing::debug!(
            "open {} as {:?}: {:?}",
            decision.resolved.display(),
            flags,
            decision.route
        );

        if decision.route == Route::Consume {
            match self.metadata {
                Some(metadata) => ctx.consume_with_metadata(&decision.resolved, metadata)?,
                None => ctx.consume(&decision.resolved)?,
            }
        }

        let file = flags.to_open_options().open(path)?;

        Ok(StagedFile {
            file: Some(file),
            path: decision.resolved,
            route: decision.route,
            state: FileState::opened_with(&flags),
            ctx: (decision.route == Route::ProduceOnClose).then_some(ctx),
            _not_send: PhantomData,
        })
    }
}

/// Local file with staging attached to its open and close
#[derive(Debug)]
pub struct StagedFile {
    file: Option<File>,
    path: PathBuf,
    route: Route,
    state: FileState,
    // Kept only when a produce is pending
    ctx: Option<Context>,
    _not_send: PhantomData<*const ()>,
}

impl StagedFile {
    /// Open with a mode string and the process default context
    pub fn open(path: impl AsRef<Path>, mode: &str) -> StageResult<Self> {
        StagedOpenOptions::new().mode(mode).open(path)
    }

    pub fn state(&self) -> FileState {
        self.state
    }

    /// Resolved path of the file
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn route(&self) -> Route {
        self.route
    }

    /// Underlying file, while open
    pub fn get_ref(&self) -> Option<&File> {
        self.file.as_ref()
    }

    fn file_mut(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other(UsageError::FileClosed(self.path.display().to_string())))
    }

    /// Close the file, then produce it if it was written under the producer
    /// root
    ///
    /// A failed close skips the produce. Either way the file is closed
    /// afterwards.
    pub fn close(&mut self) -> StageResult<()> {
        let file = self
            .file
            .take()
            .ok_or_else(|| UsageError::FileClosed(self.path.display().to_string()))?;
        self.state = FileState::Closed;

        close_file(file)?;

        if let Some(ctx) = self.ctx.take() {
            tracing::debug!("produce {} after close", self.path.display());
            ctx.produce(&self.path)?;
        }
        Ok(())
    }
}

/// Close `file`, reporting errors `File`'s own drop would swallow
fn close_file(file: File) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::IntoRawFd;

        let fd = file.into_raw_fd();
        // SAFETY: `fd` was just released by `file` and is closed exactly once
        if unsafe { libc::close(fd) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        drop(file);
        Ok(())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.file.is_some() {
            if let Err(e) = self.close() {
                tracing::error!("Failed to close {} on drop: {}", self.path.display(), e);
            }
        }
    }
}

impl Read for StagedFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file_mut()?.read(buf)
    }
}

impl Write for StagedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file_mut()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file_mut()?.flush()
    }
}

impl Seek for StagedFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file_mut()?.seek(pos)
    }
}

/// Run `body` on a staged file, closing it on every exit path
///
/// The close (and any produce) also runs when `body` fails. In that case the
/// body's error is returned and a close error is only logged.
pub fn with_staged_file<R, F>(
    path: impl AsRef<Path>,
    options: &StagedOpenOptions<'_>,
    body: F,
) -> StageResult<R>
where
    F: FnOnce(&mut StagedFile) -> StageResult<R>,
{
    let mut file = options.open(path)?;
    let result = body(&mut file);

    let closed = if file.state().is_open() {
        file.close()
    } else {
        Ok(())
    };

    match (result, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close_err)) => {
            tracing::error!(
                "Failed to close {} after error: {}",
                file.path().display(),
                close_err
            );
            Err(e)
        }
    }
}

/// Unwrap an I/O error raised on a closed [`StagedFile`] back into its
/// usage error
pub fn into_stage_error(err: io::Error) -> StageError {
    match err.downcast::<UsageError>() {
        Ok(usage) => StageError::Usage(usage),
        Err(err) => StageError::Io(err),
    }
}
