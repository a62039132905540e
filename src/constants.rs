//! Global constants for dyadio
//!
//! Names of the native transfer-service library and its exported symbols live
//! here, together with the ABI version this crate's record layouts match.

/// Base name of the native DYAD client library (as passed to `find_library`)
pub const LIBRARY_BASE_NAME: &str = "dyad_core";

/// Versioned ABI of the `dyad_ctx` / `dyad_metadata` records and call
/// signatures mirrored in [`crate::ffi::abi`].
///
/// A library exporting `dyad_abi_version` must report exactly this value.
pub const DYAD_ABI_VERSION: u32 = 1;

/// Library directory baked in at build time from `DYAD_INSTALL_PREFIX`
pub const BUILD_LIB_DIR: Option<&str> = option_env!("DYADIO_BUILD_LIB_DIR");

/// Exported symbol names (NUL-terminated for `libloading`)
pub mod symbols {
    pub const INIT: &[u8] = b"dyad_init\0";
    pub const INIT_ENV: &[u8] = b"dyad_init_env\0";
    pub const PRODUCE: &[u8] = b"dyad_produce\0";
    pub const CONSUME: &[u8] = b"dyad_consume\0";
    pub const CONSUME_W_METADATA: &[u8] = b"dyad_consume_w_metadata\0";
    pub const GET_METADATA: &[u8] = b"dyad_get_metadata\0";
    pub const FREE_METADATA: &[u8] = b"dyad_free_metadata\0";
    pub const FINALIZE: &[u8] = b"dyad_finalize\0";

    /// Optional: `unsigned dyad_abi_version(void)`
    pub const ABI_VERSION: &[u8] = b"dyad_abi_version\0";

    /// Optional: `size_t dyad_ctx_size(void)`
    pub const CTX_SIZE: &[u8] = b"dyad_ctx_size\0";
}

/// Platform file name of the native library, e.g. `libdyad_core.so`
pub fn library_file_name() -> String {
    format!(
        "{}{}{}",
        std::env::consts::DLL_PREFIX,
        LIBRARY_BASE_NAME,
        std::env::consts::DLL_SUFFIX
    )
}

/// Maximum path length accepted for a staged file
///
/// Mirrors `PATH_MAX` on Linux; the native service copies paths into
/// fixed-size buffers of this size.
pub const MAX_PATH_LENGTH: usize = 4096;
