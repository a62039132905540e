//! Foreign service binding
//!
//! This module is the only place that talks to the native DYAD client library
//! (`libdyad_core.so`). It handles:
//!
//! - **Loading**: the library is opened at run time with `libloading`, so a
//!   missing library degrades staging to logged no-ops instead of failing to
//!   link or start
//! - **ABI contract**: `#[repr(C)]` records and call signatures that mirror
//!   the library exactly, validated against its optional version/size markers
//! - **Status codes**: mapping nonzero `dyad_rc_t` values to typed errors
//! - **Ownership**: connection and metadata records are wrapped in handles
//!   that can only be released by value, so nothing is freed twice
//!
//! # Architecture
//!
//! - [`abi`]: record layouts and function pointer types
//! - [`service`]: the [`ServiceApi`] call contract
//! - [`native`]: [`NativeService`], the loaded library
//! - [`recording`]: [`RecordingService`], an in-process implementation for
//!   dry runs and tests
//! - [`error`]: status code conversion
//!
//! # Ownership convention
//!
//! `dyad_free_metadata` and `dyad_finalize` always receive the record by
//! reference (`T**`). On the Rust side the corresponding [`ServiceApi`]
//! methods take [`MetadataRecord`] / [`ConnectionHandle`] by value, so a
//! released record cannot be passed again.

pub mod abi;
pub mod error;
pub mod native;
pub mod recording;
pub mod service;

pub use error::{check_init_status, check_status, is_error};
pub use native::NativeService;
pub use recording::{CallKind, RecordingService, ServiceCall};
pub use service::{ConnectionHandle, InitArgs, MetadataRecord, ServiceApi};
