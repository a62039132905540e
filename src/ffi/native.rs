// Native transfer-service binding
//
// Loads libdyad_core.so with libloading, resolves the versioned call
// contract and validates the optional ABI markers before anything is called.

use std::ffi::{CStr, c_uint};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use libloading::Library;

use super::abi::{
    AbiVersionFn, ConsumeWithMetadataFn, CtxSizeFn, FinalizeFn, FreeMetadataFn, GetMetadataFn,
    InitEnvFn, InitFn, PathOpFn, dyad_ctx_t, dyad_metadata_t, dyad_rc_t,
};
use super::service::{ConnectionHandle, InitArgs, MetadataRecord, ServiceApi};
use crate::config::{DtlCommMode, ExternalHandle, LibraryConfig};
use crate::constants::{DYAD_ABI_VERSION, library_file_name, symbols};
use crate::error::{StageError, StageResult};

/// Resolved entry points
#[derive(Clone, Copy)]
struct NativeFns {
    init: InitFn,
    init_env: InitEnvFn,
    produce: PathOpFn,
    consume: PathOpFn,
    consume_w_metadata: ConsumeWithMetadataFn,
    get_metadata: GetMetadataFn,
    free_metadata: FreeMetadataFn,
    finalize: FinalizeFn,
}

/// The dynamically loaded DYAD client library
pub struct NativeService {
    fns: NativeFns,
    path: PathBuf,
    // Keeps the entry points in `fns` mapped.
    _library: Library,
}

impl std::fmt::Debug for NativeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeService")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Resolve a required symbol as a plain function pointer
///
/// # Safety
///
/// `T` must be the exact C signature of the symbol.
unsafe fn required<T: Copy>(library: &Library, name: &[u8]) -> StageResult<T> {
    match unsafe { library.get::<T>(name) } {
        Ok(sym) => Ok(*sym),
        Err(e) => Err(StageError::AbiMismatch(format!(
            "missing symbol {}: {}",
            symbol_name(name),
            e
        ))),
    }
}

/// # Safety
///
/// `T` must be the exact C signature of the symbol.
unsafe fn optional<T: Copy>(library: &Library, name: &[u8]) -> Option<T> {
    unsafe { library.get::<T>(name) }.ok().map(|sym| *sym)
}

fn symbol_name(name: &[u8]) -> &str {
    std::str::from_utf8(name.strip_suffix(b"\0").unwrap_or(name)).unwrap_or("<non-utf8>")
}

impl NativeService {
    /// Locate and load the library, then validate its ABI
    ///
    /// # Errors
    ///
    /// - [`StageError::LibraryNotFound`] if no candidate could be loaded
    /// - [`StageError::AbiMismatch`] if a required symbol is missing or an
    ///   exported ABI marker disagrees with this crate's record layouts
    pub fn connect(config: &LibraryConfig) -> StageResult<Self> {
        let mut reasons = String::new();

        for candidate in config.candidates() {
            // SAFETY: loading runs the library's initializers; libdyad_core has
            // no initializers with preconditions beyond a sane process state.
            match unsafe { Library::new(&candidate) } {
                Ok(library) => {
                    tracing::info!("Loaded transfer-service library from {}", candidate.display());
                    return Self::from_library(library, candidate, config.require_abi_marker);
                }
                Err(e) => {
                    tracing::debug!("Failed to load {}: {}", candidate.display(), e);
                    let _ = write!(reasons, "{}: {}; ", candidate.display(), e);
                }
            }
        }

        Err(StageError::LibraryNotFound {
            name: library_file_name(),
            reason: reasons.trim_end_matches("; ").to_string(),
        })
    }

    /// Load from an explicit path
    pub fn open(path: &Path) -> StageResult<Self> {
        Self::connect(&LibraryConfig {
            library_path: Some(path.to_path_buf()),
            ..Default::default()
        })
    }

    fn from_library(library: Library, path: PathBuf, require_marker: bool) -> StageResult<Self> {
        // SAFETY: the signatures in `abi` are the versioned contract; a library
        // that exports these names with other signatures is caught below by
        // the markers when it exports them.
        let fns = unsafe {
            NativeFns {
                init: required(&library, symbols::INIT)?,
                init_env: required(&library, symbols::INIT_ENV)?,
                produce: required(&library, symbols::PRODUCE)?,
                consume: required(&library, symbols::CONSUME)?,
                consume_w_metadata: required(&library, symbols::CONSUME_W_METADATA)?,
                get_metadata: required(&library, symbols::GET_METADATA)?,
                free_metadata: required(&library, symbols::FREE_METADATA)?,
                finalize: required(&library, symbols::FINALIZE)?,
            }
        };

        let abi_version = unsafe { optional::<AbiVersionFn>(&library, symbols::ABI_VERSION) }
            .map(|f| unsafe { f() });
        let ctx_size =
            unsafe { optional::<CtxSizeFn>(&library, symbols::CTX_SIZE) }.map(|f| unsafe { f() });

        validate_markers(abi_version, ctx_size, require_marker)?;

        Ok(Self {
            fns,
            path,
            _library: library,
        })
    }

    /// Path the library was loaded from
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Compare the library's exported markers against our record layouts
fn validate_markers(
    abi_version: Option<c_uint>,
    ctx_size: Option<usize>,
    require_marker: bool,
) -> StageResult<()> {
    if let Some(version) = abi_version {
        if version != DYAD_ABI_VERSION {
            return Err(StageError::AbiMismatch(format!(
                "library ABI version {} does not match expected {}",
                version, DYAD_ABI_VERSION
            )));
        }
    }

    if let Some(size) = ctx_size {
        let expected = std::mem::size_of::<dyad_ctx_t>();
        if size != expected {
            return Err(StageError::AbiMismatch(format!(
                "library dyad_ctx is {} bytes, expected {}",
                size, expected
            )));
        }
    }

    match (abi_version, ctx_size) {
        (None, None) if require_marker => Err(StageError::AbiMismatch(
            "library exports no ABI marker and require_abi_marker is set".to_string(),
        )),
        (None, None) => {
            tracing::debug!("Library exports no ABI marker; assuming ABI version {}", DYAD_ABI_VERSION);
            Ok(())
        }
        _ => Ok(()),
    }
}

fn opt_ptr(s: Option<&CStr>) -> *const std::ffi::c_char {
    s.map_or(std::ptr::null(), CStr::as_ptr)
}

impl ServiceApi for NativeService {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn init(&self, args: &InitArgs<'_>) -> (dyad_rc_t, Option<ConnectionHandle>) {
        let opts = args.options;
        let mut ctx: *mut dyad_ctx_t = std::ptr::null_mut();
        let external = opts
            .external_connection
            .map_or(std::ptr::null_mut(), |h| h.as_ptr());

        // SAFETY: all strings are NUL-terminated and outlive the call; `ctx`
        // is a valid out-parameter.
        let rc = unsafe {
            (self.fns.init)(
                opts.debug,
                opts.check,
                opts.shared_storage,
                opts.reinit,
                opts.async_publish,
                opts.fsync_write,
                opts.key_depth,
                opts.key_bins,
                opts.service_mux,
                opt_ptr(args.kvs_namespace),
                opt_ptr(args.producer_path),
                opt_ptr(args.consumer_path),
                opts.relative_to_managed_path,
                opts.dtl_mode.as_c_str().as_ptr(),
                opts.dtl_comm_mode.as_raw(),
                external,
                &mut ctx,
            )
        };

        (rc, unsafe { ConnectionHandle::from_raw(ctx) })
    }

    fn init_env(
        &self,
        comm_mode: DtlCommMode,
        external: Option<ExternalHandle>,
    ) -> (dyad_rc_t, Option<ConnectionHandle>) {
        let mut ctx: *mut dyad_ctx_t = std::ptr::null_mut();
        let external = external.map_or(std::ptr::null_mut(), |h| h.as_ptr());

        // SAFETY: `ctx` is a valid out-parameter
        let rc = unsafe { (self.fns.init_env)(comm_mode.as_raw(), external, &mut ctx) };

        (rc, unsafe { ConnectionHandle::from_raw(ctx) })
    }

    fn produce(&self, conn: ConnectionHandle, path: &CStr) -> dyad_rc_t {
        // SAFETY: live connection, NUL-terminated path
        unsafe { (self.fns.produce)(conn.as_ptr(), path.as_ptr()) }
    }

    fn consume(&self, conn: ConnectionHandle, path: &CStr) -> dyad_rc_t {
        // SAFETY: live connection, NUL-terminated path
        unsafe { (self.fns.consume)(conn.as_ptr(), path.as_ptr()) }
    }

    fn consume_with_metadata(
        &self,
        conn: ConnectionHandle,
        path: &CStr,
        record: &MetadataRecord,
    ) -> dyad_rc_t {
        // SAFETY: live connection and record, NUL-terminated path
        unsafe {
            (self.fns.consume_w_metadata)(conn.as_ptr(), path.as_ptr(), record.as_ptr().cast_const())
        }
    }

    fn get_metadata(
        &self,
        conn: ConnectionHandle,
        path: &CStr,
        should_wait: bool,
    ) -> (dyad_rc_t, Option<MetadataRecord>) {
        let mut mdata: *mut dyad_metadata_t = std::ptr::null_mut();

        // SAFETY: live connection, NUL-terminated path, valid out-parameter
        let rc = unsafe {
            (self.fns.get_metadata)(conn.as_ptr(), path.as_ptr(), should_wait, &mut mdata)
        };

        // A record allocated alongside a failure status is still ours to free.
        let record = unsafe { MetadataRecord::from_raw(mdata) };
        if rc != 0 {
            if let Some(record) = record {
                self.discard_metadata(record);
            }
            return (rc, None);
        }
        (rc, record)
    }

    fn free_metadata(&self, record: MetadataRecord) -> dyad_rc_t {
        let mut mdata = record.as_ptr();
        // SAFETY: the record came from get_metadata and is consumed here
        unsafe { (self.fns.free_metadata)(&mut mdata) }
    }

    fn finalize(&self, conn: ConnectionHandle) -> dyad_rc_t {
        let mut ctx = conn.as_ptr();
        // SAFETY: the connection is consumed here
        unsafe { (self.fns.finalize)(&mut ctx) }
    }
}
