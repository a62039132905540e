//! The call contract of the transfer service
//!
//! [`ServiceApi`] is the seam between the staging layer and whatever
//! implements the DYAD client calls: the dynamically loaded native library
//! ([`super::NativeService`]) or the in-process [`super::RecordingService`].
//! Implementations deal only in C values; conversions happen in the caller.

use std::ffi::CStr;
use std::path::PathBuf;
use std::ptr::NonNull;

use super::abi::{dyad_ctx_t, dyad_metadata_t, dyad_rc_t, path_from_c};
use crate::config::{DtlCommMode, ExternalHandle, StageOptions};

/// A live `dyad_ctx_t*` returned by a successful init
///
/// Only the service that produced it may receive it back, and only until
/// it has been passed to [`ServiceApi::finalize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionHandle(NonNull<dyad_ctx_t>);

// SAFETY: the record is owned by the foreign service and only dereferenced
// while the owning Context holds its connection lock.
unsafe impl Send for ConnectionHandle {}

impl ConnectionHandle {
    /// # Safety
    ///
    /// `ptr` must be a context record returned by the service's init call.
    pub unsafe fn from_raw(ptr: *mut dyad_ctx_t) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub fn as_ptr(&self) -> *mut dyad_ctx_t {
        self.0.as_ptr()
    }

    /// Producer and consumer managed paths reported in the record
    ///
    /// # Safety
    ///
    /// The handle must not have been finalized.
    pub unsafe fn managed_paths(&self) -> (Option<PathBuf>, Option<PathBuf>) {
        // SAFETY: live record per the caller's contract
        let record = unsafe { self.0.as_ref() };
        unsafe {
            (
                path_from_c(record.prod_managed_path),
                path_from_c(record.cons_managed_path),
            )
        }
    }
}

/// A `dyad_metadata_t*` returned by a successful get-metadata call
///
/// Passing it to [`ServiceApi::free_metadata`] consumes it, so one value can
/// never be freed twice.
#[derive(Debug, PartialEq, Eq)]
pub struct MetadataRecord(NonNull<dyad_metadata_t>);

impl MetadataRecord {
    /// # Safety
    ///
    /// `ptr` must be a metadata record returned by the service and not yet
    /// freed, and no other `MetadataRecord` may wrap it.
    pub unsafe fn from_raw(ptr: *mut dyad_metadata_t) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub fn as_ptr(&self) -> *mut dyad_metadata_t {
        self.0.as_ptr()
    }

    /// `owner_rank` field
    ///
    /// # Safety
    ///
    /// The record must still be allocated.
    pub unsafe fn owner_rank(&self) -> u32 {
        unsafe { self.0.as_ref() }.owner_rank
    }

    /// `fpath` field
    ///
    /// # Safety
    ///
    /// The record must still be allocated.
    pub unsafe fn file_path(&self) -> Option<PathBuf> {
        unsafe { path_from_c(self.0.as_ref().fpath) }
    }
}

/// C-ready arguments of `dyad_init`
#[derive(Debug, Clone, Copy)]
pub struct InitArgs<'a> {
    pub options: &'a StageOptions,
    pub kvs_namespace: Option<&'a CStr>,
    pub producer_path: Option<&'a CStr>,
    pub consumer_path: Option<&'a CStr>,
}

/// The fixed call contract of the DYAD client library
///
/// Every method returns the raw status code (`0` on success); callers turn it
/// into a typed error without interpreting its value.
pub trait ServiceApi: Send + Sync {
    /// Human-readable origin of this implementation (library path, "recording")
    fn describe(&self) -> String;

    /// `dyad_init`
    fn init(&self, args: &InitArgs<'_>) -> (dyad_rc_t, Option<ConnectionHandle>);

    /// `dyad_init_env`; the service reads its own environment
    fn init_env(
        &self,
        comm_mode: DtlCommMode,
        external: Option<ExternalHandle>,
    ) -> (dyad_rc_t, Option<ConnectionHandle>);

    /// `dyad_produce`
    fn produce(&self, conn: ConnectionHandle, path: &CStr) -> dyad_rc_t;

    /// `dyad_consume`
    fn consume(&self, conn: ConnectionHandle, path: &CStr) -> dyad_rc_t;

    /// `dyad_consume_w_metadata`
    fn consume_with_metadata(
        &self,
        conn: ConnectionHandle,
        path: &CStr,
        record: &MetadataRecord,
    ) -> dyad_rc_t;

    /// `dyad_get_metadata`; blocks inside the service when `should_wait`
    fn get_metadata(
        &self,
        conn: ConnectionHandle,
        path: &CStr,
        should_wait: bool,
    ) -> (dyad_rc_t, Option<MetadataRecord>);

    /// `dyad_free_metadata`
    fn free_metadata(&self, record: MetadataRecord) -> dyad_rc_t;

    /// `dyad_finalize`
    fn finalize(&self, conn: ConnectionHandle) -> dyad_rc_t;

    /// Free a record nobody will receive, such as one allocated alongside a
    /// failed lookup. A failure is logged, never returned.
    fn discard_metadata(&self, record: MetadataRecord) {
        let ptr = record.as_ptr();
        let rc = self.free_metadata(record);
        if rc != 0 {
            tracing::warn!(
                "Freeing discarded metadata record {:p} returned status {}",
                ptr,
                rc
            );
        }
    }
}
