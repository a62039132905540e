//! Record layouts and call signatures of the native DYAD client library
//!
//! These definitions are a binary contract (version [`DYAD_ABI_VERSION`]):
//! field order and widths must match `struct dyad_ctx` and
//! `struct dyad_metadata` in the installed library exactly.
//!
//! [`DYAD_ABI_VERSION`]: crate::constants::DYAD_ABI_VERSION

#![allow(non_camel_case_types)]

use std::ffi::{CStr, c_char, c_int, c_uint, c_void};
use std::path::PathBuf;

/// Return code of every native call. `0` is success.
pub type dyad_rc_t = c_int;

pub const DYAD_RC_OK: dyad_rc_t = 0;

/// Opaque DTL handle
#[repr(C)]
pub struct dyad_dtl {
    _private: [u8; 0],
}

/// `struct dyad_ctx`
#[repr(C)]
#[derive(Debug)]
pub struct dyad_ctx_t {
    // Internal
    pub h: *mut c_void,
    pub dtl_handle: *mut dyad_dtl,
    pub fname: *const c_char,
    pub use_fs_locks: bool,
    pub prod_real_path: *mut c_char,
    pub cons_real_path: *mut c_char,
    pub prod_managed_len: u32,
    pub cons_managed_len: u32,
    pub prod_real_len: u32,
    pub cons_real_len: u32,
    pub prod_managed_hash: u32,
    pub cons_managed_hash: u32,
    pub prod_real_hash: u32,
    pub cons_real_hash: u32,
    pub delim_len: u32,
    // User facing
    pub debug: bool,
    pub check: bool,
    pub reenter: bool,
    pub initialized: bool,
    pub shared_storage: bool,
    pub async_publish: bool,
    pub fsync_write: bool,
    pub key_depth: c_uint,
    pub key_bins: c_uint,
    pub rank: u32,
    pub service_mux: u32,
    pub node_idx: u32,
    pub pid: c_int,
    pub kvs_namespace: *mut c_char,
    pub prod_managed_path: *mut c_char,
    pub cons_managed_path: *mut c_char,
    pub relative_to_managed_path: bool,
}

impl dyad_ctx_t {
    /// All-null record, the equivalent of `dyad_ctx_default`
    pub fn zeroed() -> Self {
        Self {
            h: std::ptr::null_mut(),
            dtl_handle: std::ptr::null_mut(),
            fname: std::ptr::null(),
            use_fs_locks: false,
            prod_real_path: std::ptr::null_mut(),
            cons_real_path: std::ptr::null_mut(),
            prod_managed_len: 0,
            cons_managed_len: 0,
            prod_real_len: 0,
            cons_real_len: 0,
            prod_managed_hash: 0,
            cons_managed_hash: 0,
            prod_real_hash: 0,
            cons_real_hash: 0,
            delim_len: 0,
            debug: false,
            check: false,
            reenter: false,
            initialized: false,
            shared_storage: false,
            async_publish: false,
            fsync_write: false,
            key_depth: 0,
            key_bins: 0,
            rank: 0,
            service_mux: 0,
            node_idx: 0,
            pid: 0,
            kvs_namespace: std::ptr::null_mut(),
            prod_managed_path: std::ptr::null_mut(),
            cons_managed_path: std::ptr::null_mut(),
            relative_to_managed_path: false,
        }
    }
}

/// `struct dyad_metadata`
#[repr(C)]
#[derive(Debug)]
pub struct dyad_metadata_t {
    pub fpath: *mut c_char,
    pub owner_rank: u32,
}

/// `dyad_init`
pub type InitFn = unsafe extern "C" fn(
    debug: bool,
    check: bool,
    shared_storage: bool,
    reinit: bool,
    async_publish: bool,
    fsync_write: bool,
    key_depth: c_uint,
    key_bins: c_uint,
    service_mux: c_uint,
    kvs_namespace: *const c_char,
    prod_managed_path: *const c_char,
    cons_managed_path: *const c_char,
    relative_to_managed_path: bool,
    dtl_mode: *const c_char,
    dtl_comm_mode: c_int,
    flux_handle: *mut c_void,
    ctx: *mut *mut dyad_ctx_t,
) -> dyad_rc_t;

/// `dyad_init_env`
pub type InitEnvFn = unsafe extern "C" fn(
    dtl_comm_mode: c_int,
    flux_handle: *mut c_void,
    ctx: *mut *mut dyad_ctx_t,
) -> dyad_rc_t;

/// `dyad_produce` / `dyad_consume`
pub type PathOpFn = unsafe extern "C" fn(ctx: *mut dyad_ctx_t, fname: *const c_char) -> dyad_rc_t;

/// `dyad_consume_w_metadata`
pub type ConsumeWithMetadataFn = unsafe extern "C" fn(
    ctx: *mut dyad_ctx_t,
    fname: *const c_char,
    mdata: *const dyad_metadata_t,
) -> dyad_rc_t;

/// `dyad_get_metadata`
pub type GetMetadataFn = unsafe extern "C" fn(
    ctx: *mut dyad_ctx_t,
    fname: *const c_char,
    should_wait: bool,
    mdata: *mut *mut dyad_metadata_t,
) -> dyad_rc_t;

/// `dyad_free_metadata`. Always takes the record by reference; the callee
/// nulls the pointer it frees.
pub type FreeMetadataFn = unsafe extern "C" fn(mdata: *mut *mut dyad_metadata_t) -> dyad_rc_t;

/// `dyad_finalize`
pub type FinalizeFn = unsafe extern "C" fn(ctx: *mut *mut dyad_ctx_t) -> dyad_rc_t;

/// Optional `dyad_abi_version`
pub type AbiVersionFn = unsafe extern "C" fn() -> c_uint;

/// Optional `dyad_ctx_size`
pub type CtxSizeFn = unsafe extern "C" fn() -> usize;

/// Read a nullable C string field as an owned path
///
/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string that stays valid
/// for the duration of the call.
pub unsafe fn path_from_c(ptr: *const c_char) -> Option<PathBuf> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: non-null and NUL-terminated per the caller's contract
    let bytes = unsafe { CStr::from_ptr(ptr) }.to_bytes();
    if bytes.is_empty() {
        return None;
    }
    Some(bytes_to_path(bytes))
}

#[cfg(unix)]
fn bytes_to_path(bytes: &[u8]) -> PathBuf {
    use std::os::unix::ffi::OsStrExt;
    PathBuf::from(std::ffi::OsStr::from_bytes(bytes))
}

#[cfg(not(unix))]
fn bytes_to_path(bytes: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
}
