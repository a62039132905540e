//! Staging context
//!
//! A [`Context`] owns one connection to the transfer service together with
//! the managed roots the service reported for it. It is a cheap, cloneable
//! handle: every clone refers to the same connection, and the connection is
//! finalized when the last clone goes away.
//!
//! A context whose service library could not be found is *unavailable*:
//! every operation logs a warning and does nothing, so applications run
//! unchanged (without staging) on machines where DYAD is not installed.
//!
//! # Example
//!
//! ```rust,no_run
//! use dyadio::config::StageOptions;
//! use dyadio::Context;
//!
//! # fn example() -> dyadio::error::StageResult<()> {
//! let ctx = Context::new()?;
//! ctx.init(&StageOptions::default().producer("/stage/out"))?;
//!
//! std::fs::write("/stage/out/a.bin", b"payload")?;
//! ctx.produce("/stage/out/a.bin")?;
//!
//! ctx.finalize()?;
//! # Ok(())
//! # }
//! ```

pub mod registry;

use std::ffi::CString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::api::path::{ManagedRoots, expand_user, path_to_cstring, resolve_path};
use crate::config::{DtlCommMode, LibraryConfig, StageConfig, StageOptions};
use crate::error::{Operation, StageError, StageResult, UsageError};
use crate::ffi::{
    ConnectionHandle, InitArgs, NativeService, ServiceApi, check_init_status, check_status,
};
use crate::metadata::{MetadataHandle, RawMetadata};

pub use registry::{
    clear_default, default_context, default_context_with, register_default, resolve_context,
};

/// Connection state guarded by the context lock
#[derive(Debug, Default)]
pub(crate) struct ConnectionState {
    conn: Option<ConnectionHandle>,
    roots: ManagedRoots,
}

impl ConnectionState {
    pub(crate) fn is_connected(&self) -> bool {
        self.conn.is_some()
    }
}

/// State shared by all clones of a [`Context`]
pub(crate) struct Shared {
    /// `None` when the service library is unavailable
    service: Option<Arc<dyn ServiceApi>>,
    state: Mutex<ConnectionState>,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        let (Some(service), Some(conn)) = (self.service.as_ref(), state.conn.take()) else {
            return;
        };

        tracing::debug!("Finalizing transfer-service connection on drop");
        let rc = service.finalize(conn);
        if rc != 0 {
            tracing::error!("transfer-service finalize on drop returned status {}", rc);
        }
    }
}

/// Handle to one transfer-service connection
#[derive(Clone)]
pub struct Context {
    shared: Arc<Shared>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("Context")
            .field(
                "service",
                &self.shared.service.as_ref().map(|s| s.describe()),
            )
            .field("initialized", &state.conn.is_some())
            .field("roots", &state.roots)
            .finish()
    }
}

impl Context {
    /// Load the service library from the default locations
    ///
    /// A missing library yields an unavailable context rather than an error;
    /// an incompatible one is an error.
    pub fn new() -> StageResult<Self> {
        Self::with_library(&LibraryConfig::default())
    }

    /// Load the service library as described by `config`
    pub fn with_library(config: &LibraryConfig) -> StageResult<Self> {
        match NativeService::connect(config) {
            Ok(service) => Ok(Self::with_service(Arc::new(service))),
            Err(StageError::LibraryNotFound { name, reason }) => {
                tracing::warn!(
                    "{} not found, staging is disabled for this context ({})",
                    name,
                    reason
                );
                Ok(Self::unavailable())
            }
            Err(e) => Err(e),
        }
    }

    /// Load the library and initialize with the options of a config file
    pub fn from_config(config: &StageConfig) -> StageResult<Self> {
        let ctx = Self::with_library(&config.library)?;
        ctx.init(&config.options)?;
        Ok(ctx)
    }

    /// Context backed by an explicit service implementation
    pub fn with_service(service: Arc<dyn ServiceApi>) -> Self {
        tracing::debug!("Creating context over {}", service.describe());
        Self::from_parts(Some(service))
    }

    /// Context with no service; every operation is a logged no-op
    pub fn unavailable() -> Self {
        Self::from_parts(None)
    }

    fn from_parts(service: Option<Arc<dyn ServiceApi>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                service,
                state: Mutex::new(ConnectionState::default()),
            }),
        }
    }

    /// Whether a service library backs this context
    pub fn is_available(&self) -> bool {
        self.shared.service.is_some()
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.lock().conn.is_some()
    }

    /// Whether both handles refer to the same connection
    pub fn same_as(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Resolved producer root, if producing is enabled
    pub fn producer_root(&self) -> Option<PathBuf> {
        self.shared.lock().roots.producer.clone()
    }

    /// Resolved consumer root, if consuming is enabled
    pub fn consumer_root(&self) -> Option<PathBuf> {
        self.shared.lock().roots.consumer.clone()
    }

    /// Snapshot of both managed roots
    pub fn roots(&self) -> ManagedRoots {
        self.shared.lock().roots.clone()
    }

    /// Whether `path` lies strictly inside the producer root
    pub fn is_producer_managed(&self, path: impl AsRef<Path>) -> bool {
        resolve_path(path.as_ref())
            .map(|resolved| self.shared.lock().roots.is_producer_managed(&resolved))
            .unwrap_or(false)
    }

    /// Whether `path` lies strictly inside the consumer root
    pub fn is_consumer_managed(&self, path: impl AsRef<Path>) -> bool {
        resolve_path(path.as_ref())
            .map(|resolved| self.shared.lock().roots.is_consumer_managed(&resolved))
            .unwrap_or(false)
    }

    /// Initialize the connection with explicit options
    ///
    /// # Errors
    ///
    /// - [`UsageError::AlreadyInitialized`] if initialized and `reinit` is unset
    /// - [`StageError::InitFailed`] if the service rejects the options
    pub fn init(&self, options: &StageOptions) -> StageResult<()> {
        let Some(service) = self.shared.service.as_ref() else {
            tracing::warn!("Trying to initialize DYAD when the service library was not found");
            return Ok(());
        };

        let kvs_namespace = options
            .kvs_namespace
            .as_deref()
            .map(|ns| {
                CString::new(ns)
                    .map_err(|_| UsageError::InvalidOption(format!("kvs_namespace {:?}", ns)))
            })
            .transpose()?;
        let producer_path = options
            .producer_path
            .as_deref()
            .map(|p| path_to_cstring(&expand_user(p)))
            .transpose()?;
        let consumer_path = options
            .consumer_path
            .as_deref()
            .map(|p| path_to_cstring(&expand_user(p)))
            .transpose()?;

        let mut state = self.shared.lock();
        if state.conn.is_some() {
            if !options.reinit {
                return Err(UsageError::AlreadyInitialized.into());
            }
            release_connection(service.as_ref(), &mut state, "re-initialization");
        }

        tracing::debug!(
            "dyad_init producer={:?} consumer={:?} dtl={:?}/{:?}",
            options.producer_path,
            options.consumer_path,
            options.dtl_mode,
            options.dtl_comm_mode
        );
        let args = InitArgs {
            options,
            kvs_namespace: kvs_namespace.as_deref(),
            producer_path: producer_path.as_deref(),
            consumer_path: consumer_path.as_deref(),
        };
        let (rc, conn) = service.init(&args);
        attach_connection(&mut state, rc, conn)
    }

    /// Initialize from the service's own environment configuration
    ///
    /// The service reads its settings (managed paths, namespace, transport)
    /// itself; this crate never inspects those variables.
    pub fn init_from_environment(&self) -> StageResult<()> {
        let Some(service) = self.shared.service.as_ref() else {
            tracing::warn!("Trying to initialize DYAD when the service library was not found");
            return Ok(());
        };

        let mut state = self.shared.lock();
        if state.conn.is_some() {
            return Err(UsageError::AlreadyInitialized.into());
        }

        tracing::debug!("dyad_init_env");
        let (rc, conn) = service.init_env(DtlCommMode::Recv, None);
        attach_connection(&mut state, rc, conn)
    }

    /// Publish a locally written file to consumers
    pub fn produce(&self, path: impl AsRef<Path>) -> StageResult<()> {
        self.path_operation(Operation::Produce, path.as_ref(), |service, conn, c_path| {
            service.produce(conn, c_path)
        })
    }

    /// Make a file locally available before it is read
    pub fn consume(&self, path: impl AsRef<Path>) -> StageResult<()> {
        self.path_operation(Operation::Consume, path.as_ref(), |service, conn, c_path| {
            service.consume(conn, c_path)
        })
    }

    /// [`Context::consume`] with a metadata record fetched earlier
    ///
    /// # Errors
    ///
    /// - [`UsageError::ForeignMetadata`] if `metadata` came from another context
    /// - [`UsageError::MetadataReleased`] if `metadata` was released
    pub fn consume_with_metadata(
        &self,
        path: impl AsRef<Path>,
        metadata: &MetadataHandle,
    ) -> StageResult<()> {
        if !metadata.is_owned_by(&self.shared) {
            return Err(UsageError::ForeignMetadata.into());
        }
        let record = metadata.record().ok_or(UsageError::MetadataReleased)?;

        self.path_operation(
            Operation::ConsumeWithMetadata,
            path.as_ref(),
            |service, conn, c_path| service.consume_with_metadata(conn, c_path, record),
        )
    }

    /// Fetch the metadata record of `path`, released automatically on drop
    ///
    /// Returns `Ok(None)` when the record does not exist and `should_wait` is
    /// unset. With `should_wait` the service blocks until the record appears,
    /// so a failure is reported as an error.
    pub fn get_metadata(
        &self,
        path: impl AsRef<Path>,
        should_wait: bool,
    ) -> StageResult<Option<MetadataHandle>> {
        Ok(self.fetch_metadata(path.as_ref(), should_wait)?.map(|(service, record)| {
            MetadataHandle::new(record, Arc::downgrade(&self.shared), service)
        }))
    }

    /// [`Context::get_metadata`] without automatic release
    ///
    /// The record must be handed back to [`Context::free_metadata`].
    pub fn get_metadata_raw(
        &self,
        path: impl AsRef<Path>,
        should_wait: bool,
    ) -> StageResult<Option<RawMetadata>> {
        Ok(self
            .fetch_metadata(path.as_ref(), should_wait)?
            .map(|(_, record)| RawMetadata::new(record, Arc::downgrade(&self.shared))))
    }

    /// Release a record obtained from [`Context::get_metadata_raw`]
    pub fn free_metadata(&self, metadata: RawMetadata) -> StageResult<()> {
        if !metadata.is_owned_by(&self.shared) {
            tracing::warn!("Refusing to free a metadata record owned by another context");
            return Err(UsageError::ForeignMetadata.into());
        }
        let Some(service) = self.shared.service.as_ref() else {
            return Ok(());
        };

        let _state = self.shared.lock();
        let rc = service.free_metadata(metadata.into_record());
        check_status(Operation::FreeMetadata, rc)
    }

    /// Release the connection
    ///
    /// Idempotent: only the first call reaches the service. The connection is
    /// considered released even when the service reports a failure.
    pub fn finalize(&self) -> StageResult<()> {
        let Some(service) = self.shared.service.as_ref() else {
            tracing::warn!("Trying to finalize when the service library was not found");
            return Ok(());
        };

        let mut state = self.shared.lock();
        let Some(conn) = state.conn.take() else {
            return Ok(());
        };
        state.roots = ManagedRoots::none();

        tracing::debug!("dyad_finalize");
        check_status(Operation::Finalize, service.finalize(conn))
    }

    fn path_operation<F>(&self, op: Operation, path: &Path, call: F) -> StageResult<()>
    where
        F: FnOnce(&dyn ServiceApi, ConnectionHandle, &std::ffi::CStr) -> i32,
    {
        let Some(service) = self.shared.service.as_ref() else {
            tracing::warn!(
                "Trying to {} {} when the service library was not found",
                op,
                path.display()
            );
            return Ok(());
        };

        let resolved = resolve_path(path)?;
        let c_path = path_to_cstring(&resolved)?;

        let state = self.shared.lock();
        let Some(conn) = state.conn else {
            tracing::warn!(
                "Trying to {} {} before DYAD is initialized",
                op,
                resolved.display()
            );
            return Ok(());
        };

        tracing::debug!("dyad_{} {}", op, resolved.display());
        check_status(op, call(service.as_ref(), conn, &c_path))
    }

    fn fetch_metadata(
        &self,
        path: &Path,
        should_wait: bool,
    ) -> StageResult<Option<(Arc<dyn ServiceApi>, crate::ffi::MetadataRecord)>> {
        let Some(service) = self.shared.service.as_ref() else {
            tracing::warn!(
                "Trying to get metadata for {} when the service library was not found",
                path.display()
            );
            return Ok(None);
        };

        let resolved = resolve_path(path)?;
        let c_path = path_to_cstring(&resolved)?;

        let state = self.shared.lock();
        let Some(conn) = state.conn else {
            tracing::warn!(
                "Trying to get metadata for {} before DYAD is initialized",
                resolved.display()
            );
            return Ok(None);
        };

        tracing::debug!(
            "dyad_get_metadata {} should_wait={}",
            resolved.display(),
            should_wait
        );
        let (rc, record) = service.get_metadata(conn, &c_path, should_wait);
        if rc != 0 {
            if should_wait {
                check_status(Operation::GetMetadata, rc)?;
            }
            tracing::debug!(
                "No metadata for {} (status {})",
                resolved.display(),
                rc
            );
            return Ok(None);
        }

        Ok(record.map(|record| (Arc::clone(service), record)))
    }
}

/// Finalize the current connection ahead of a new init, logging failures
fn release_connection(service: &dyn ServiceApi, state: &mut ConnectionState, reason: &str) {
    if let Some(conn) = state.conn.take() {
        tracing::debug!("dyad_finalize before {}", reason);
        let rc = service.finalize(conn);
        if rc != 0 {
            tracing::warn!("finalize before {} returned status {}", reason, rc);
        }
    }
    state.roots = ManagedRoots::none();
}

/// Store a freshly initialized connection and its resolved roots
fn attach_connection(
    state: &mut ConnectionState,
    rc: i32,
    conn: Option<ConnectionHandle>,
) -> StageResult<()> {
    check_init_status(rc)?;
    let conn = conn.ok_or_else(|| {
        tracing::error!("transfer-service init succeeded without a context record");
        StageError::InitFailed { status: rc }
    })?;

    // SAFETY: the record was just returned by a successful init
    let (producer, consumer) = unsafe { conn.managed_paths() };
    let roots = ManagedRoots::new(producer.map(resolve_root), consumer.map(resolve_root));

    tracing::info!(
        "DYAD initialized: producer root {:?}, consumer root {:?}",
        roots.producer,
        roots.consumer
    );
    state.conn = Some(conn);
    state.roots = roots;
    Ok(())
}

/// Resolve a root reported by the service, keeping it as given on failure
fn resolve_root(root: PathBuf) -> PathBuf {
    match resolve_path(&root) {
        Ok(resolved) => resolved,
        Err(e) => {
            tracing::warn!("Cannot resolve managed root {}: {}", root.display(), e);
            root
        }
    }
}
