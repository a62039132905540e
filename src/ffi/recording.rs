//! In-process stand-in for the transfer service
//!
//! [`RecordingService`] implements [`ServiceApi`] without any native library:
//! it allocates real `dyad_ctx_t` / `dyad_metadata_t` records, remembers every
//! call in order, and can be scripted to report managed roots, known metadata
//! records and failing status codes. It backs dry runs (staging decisions are
//! logged, nothing is transferred) and the crate's tests.

use std::collections::{HashMap, HashSet};
use std::ffi::{CStr, CString, c_char};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::abi::{dyad_ctx_t, dyad_metadata_t, dyad_rc_t, path_from_c};
use super::service::{ConnectionHandle, InitArgs, MetadataRecord, ServiceApi};
use crate::config::{DtlCommMode, ExternalHandle};

/// Status returned for unknown metadata records
pub const RECORDING_NOT_FOUND: dyad_rc_t = -5;

/// Status returned when a record or connection is released twice
pub const RECORDING_DOUBLE_RELEASE: dyad_rc_t = -24;

/// Kinds of calls, used to script failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Init,
    InitEnv,
    Produce,
    Consume,
    ConsumeWithMetadata,
    GetMetadata,
    FreeMetadata,
    Finalize,
}

/// One recorded call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceCall {
    Init {
        producer: Option<PathBuf>,
        consumer: Option<PathBuf>,
        reinit: bool,
    },
    InitEnv {
        comm_mode: DtlCommMode,
    },
    Produce(PathBuf),
    Consume(PathBuf),
    ConsumeWithMetadata {
        path: PathBuf,
        owner_rank: u32,
    },
    GetMetadata {
        path: PathBuf,
        should_wait: bool,
    },
    FreeMetadata {
        path: Option<PathBuf>,
    },
    Finalize,
}

impl ServiceCall {
    pub fn kind(&self) -> CallKind {
        match self {
            ServiceCall::Init { .. } => CallKind::Init,
            ServiceCall::InitEnv { .. } => CallKind::InitEnv,
            ServiceCall::Produce(_) => CallKind::Produce,
            ServiceCall::Consume(_) => CallKind::Consume,
            ServiceCall::ConsumeWithMetadata { .. } => CallKind::ConsumeWithMetadata,
            ServiceCall::GetMetadata { .. } => CallKind::GetMetadata,
            ServiceCall::FreeMetadata { .. } => CallKind::FreeMetadata,
            ServiceCall::Finalize => CallKind::Finalize,
        }
    }
}

#[derive(Default)]
struct RecordingState {
    calls: Vec<ServiceCall>,
    failures: HashMap<CallKind, dyad_rc_t>,
    env_producer: Option<PathBuf>,
    env_consumer: Option<PathBuf>,
    known_records: HashMap<PathBuf, u32>,
    // Addresses of records handed out and not yet released
    live_connections: HashSet<usize>,
    live_records: HashSet<usize>,
    double_releases: usize,
}

/// Scriptable, call-recording implementation of [`ServiceApi`]
#[derive(Default)]
pub struct RecordingService {
    state: Mutex<RecordingState>,
}

impl std::fmt::Debug for RecordingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingService").finish_non_exhaustive()
    }
}

fn c_string_from_path(path: &Path) -> *mut c_char {
    #[cfg(unix)]
    let bytes = {
        use std::os::unix::ffi::OsStrExt;
        path.as_os_str().as_bytes().to_vec()
    };
    #[cfg(not(unix))]
    let bytes = path.to_string_lossy().into_owned().into_bytes();

    match CString::new(bytes) {
        Ok(s) => s.into_raw(),
        Err(_) => std::ptr::null_mut(),
    }
}

/// # Safety
///
/// `ptr` must be null or come from [`c_string_from_path`] and not be freed yet.
unsafe fn free_c_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(unsafe { CString::from_raw(ptr) });
    }
}

fn cstr_to_path(s: &CStr) -> PathBuf {
    // SAFETY: a &CStr is always NUL-terminated
    unsafe { path_from_c(s.as_ptr()) }.unwrap_or_default()
}

impl RecordingService {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RecordingState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Managed roots the service "discovers" for `init_env`
    pub fn with_env_roots(self, producer: Option<&Path>, consumer: Option<&Path>) -> Self {
        {
            let mut state = self.state();
            state.env_producer = producer.map(Path::to_path_buf);
            state.env_consumer = consumer.map(Path::to_path_buf);
        }
        self
    }

    /// Make every call of `kind` return `status`
    pub fn fail(&self, kind: CallKind, status: dyad_rc_t) {
        self.state().failures.insert(kind, status);
    }

    /// Stop failing calls of `kind`
    pub fn succeed(&self, kind: CallKind) {
        self.state().failures.remove(&kind);
    }

    /// Register a metadata record returned by `get_metadata` for `path`
    pub fn add_metadata(&self, path: impl Into<PathBuf>, owner_rank: u32) {
        self.state().known_records.insert(path.into(), owner_rank);
    }

    /// All calls so far, in order
    pub fn calls(&self) -> Vec<ServiceCall> {
        self.state().calls.clone()
    }

    /// Calls of one kind
    pub fn calls_of(&self, kind: CallKind) -> Vec<ServiceCall> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn count(&self, kind: CallKind) -> usize {
        self.state().calls.iter().filter(|c| c.kind() == kind).count()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Metadata records handed out and not yet freed
    pub fn live_records(&self) -> usize {
        self.state().live_records.len()
    }

    /// Connections initialized and not yet finalized
    pub fn live_connections(&self) -> usize {
        self.state().live_connections.len()
    }

    /// Records or connections released more than once
    pub fn double_releases(&self) -> usize {
        self.state().double_releases
    }

    fn record(&self, call: ServiceCall) -> dyad_rc_t {
        tracing::debug!("recording service: {:?}", call);
        let mut state = self.state();
        let status = state.failures.get(&call.kind()).copied().unwrap_or(0);
        state.calls.push(call);
        status
    }

    fn open_connection(
        &self,
        producer: Option<&Path>,
        consumer: Option<&Path>,
    ) -> Option<ConnectionHandle> {
        let mut record = Box::new(dyad_ctx_t::zeroed());
        record.initialized = true;
        record.reenter = true;
        record.prod_managed_path = producer.map_or(std::ptr::null_mut(), c_string_from_path);
        record.cons_managed_path = consumer.map_or(std::ptr::null_mut(), c_string_from_path);

        let ptr = Box::into_raw(record);
        self.state().live_connections.insert(ptr as usize);
        // SAFETY: freshly allocated record
        unsafe { ConnectionHandle::from_raw(ptr) }
    }
}

impl Drop for RecordingService {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        for addr in state.live_records.drain() {
            let ptr = addr as *mut dyad_metadata_t;
            // SAFETY: still-live records allocated by this service
            unsafe {
                free_c_string((*ptr).fpath);
                drop(Box::from_raw(ptr));
            }
        }
        for addr in state.live_connections.drain() {
            let ptr = addr as *mut dyad_ctx_t;
            // SAFETY: still-live connections allocated by this service
            unsafe {
                free_c_string((*ptr).prod_managed_path);
                free_c_string((*ptr).cons_managed_path);
                drop(Box::from_raw(ptr));
            }
        }
    }
}

impl ServiceApi for RecordingService {
    fn describe(&self) -> String {
        "recording".to_string()
    }

    fn init(&self, args: &InitArgs<'_>) -> (dyad_rc_t, Option<ConnectionHandle>) {
        let producer = args.producer_path.map(cstr_to_path);
        let consumer = args.consumer_path.map(cstr_to_path);

        let status = self.record(ServiceCall::Init {
            producer: producer.clone(),
            consumer: consumer.clone(),
            reinit: args.options.reinit,
        });
        if status != 0 {
            return (status, None);
        }

        (
            0,
            self.open_connection(producer.as_deref(), consumer.as_deref()),
        )
    }

    fn init_env(
        &self,
        comm_mode: DtlCommMode,
        _external: Option<ExternalHandle>,
    ) -> (dyad_rc_t, Option<ConnectionHandle>) {
        let status = self.record(ServiceCall::InitEnv { comm_mode });
        if status != 0 {
            return (status, None);
        }

        let (producer, consumer) = {
            let state = self.state();
            (state.env_producer.clone(), state.env_consumer.clone())
        };
        (
            0,
            self.open_connection(producer.as_deref(), consumer.as_deref()),
        )
    }

    fn produce(&self, _conn: ConnectionHandle, path: &CStr) -> dyad_rc_t {
        self.record(ServiceCall::Produce(cstr_to_path(path)))
    }

    fn consume(&self, _conn: ConnectionHandle, path: &CStr) -> dyad_rc_t {
        self.record(ServiceCall::Consume(cstr_to_path(path)))
    }

    fn consume_with_metadata(
        &self,
        _conn: ConnectionHandle,
        path: &CStr,
        record: &MetadataRecord,
    ) -> dyad_rc_t {
        // SAFETY: the caller passes a record that has not been freed
        let owner_rank = unsafe { record.owner_rank() };
        self.record(ServiceCall::ConsumeWithMetadata {
            path: cstr_to_path(path),
            owner_rank,
        })
    }

    fn get_metadata(
        &self,
        _conn: ConnectionHandle,
        path: &CStr,
        should_wait: bool,
    ) -> (dyad_rc_t, Option<MetadataRecord>) {
        let path = cstr_to_path(path);
        let status = self.record(ServiceCall::GetMetadata {
            path: path.clone(),
            should_wait,
        });
        if status != 0 {
            return (status, None);
        }

        let owner_rank = match self.state().known_records.get(&path) {
            Some(rank) => *rank,
            None => return (RECORDING_NOT_FOUND, None),
        };

        let ptr = Box::into_raw(Box::new(dyad_metadata_t {
            fpath: c_string_from_path(&path),
            owner_rank,
        }));
        self.state().live_records.insert(ptr as usize);
        // SAFETY: freshly allocated record
        (0, unsafe { MetadataRecord::from_raw(ptr) })
    }

    fn free_metadata(&self, record: MetadataRecord) -> dyad_rc_t {
        let ptr = record.as_ptr();
        let live = self.state().live_records.remove(&(ptr as usize));
        if !live {
            self.state().double_releases += 1;
            self.record(ServiceCall::FreeMetadata { path: None });
            return RECORDING_DOUBLE_RELEASE;
        }

        // SAFETY: live record allocated by this service
        let path = unsafe { record.file_path() };
        let status = self.record(ServiceCall::FreeMetadata { path });
        unsafe {
            free_c_string((*ptr).fpath);
            drop(Box::from_raw(ptr));
        }
        status
    }

    fn finalize(&self, conn: ConnectionHandle) -> dyad_rc_t {
        let ptr = conn.as_ptr();
        let live = self.state().live_connections.remove(&(ptr as usize));
        let status = self.record(ServiceCall::Finalize);
        if !live {
            self.state().double_releases += 1;
            return RECORDING_DOUBLE_RELEASE;
        }

        // SAFETY: live connection allocated by this service
        unsafe {
            free_c_string((*ptr).prod_managed_path);
            free_c_string((*ptr).cons_managed_path);
            drop(Box::from_raw(ptr));
        }
        status
    }
}
