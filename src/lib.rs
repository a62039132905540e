//! dyadio - Path-scoped data staging over the DYAD transfer service
//!
//! dyadio connects ordinary file I/O to DYAD, a service that moves files from
//! the processes that produce them to the processes that consume them. Files
//! under a *producer root* are published when closed after writing; files
//! under a *consumer root* are fetched (blocking if needed) before they are
//! opened for reading. Everything else is untouched local I/O.
//!
//! - **Dynamic binding** ([`ffi`]): the native `libdyad_core.so` is loaded at
//!   run time and checked against a versioned ABI. Without it, staging
//!   degrades to logged no-ops.
//! - **Contexts** ([`context`]): one connection with its managed roots,
//!   finalized deterministically, plus an optional process default
//! - **Metadata** ([`metadata`]): owner records of staged files, released
//!   exactly once
//! - **Staged I/O** ([`api`]): `std::io` files and pluggable container formats
//!   whose open/close trigger consume/produce
//!
//! # Example
//!
//! ```rust,no_run
//! use std::io::Write;
//! use dyadio::api::{StagedOpenOptions, with_staged_file};
//! use dyadio::Context;
//!
//! # fn example() -> dyadio::error::StageResult<()> {
//! let ctx = Context::new()?;
//! ctx.init_from_environment()?;
//!
//! let options = StagedOpenOptions::new().mode("wb").context(&ctx);
//! with_staged_file("/stage/out/a.bin", &options, |file| {
//!     file.write_all(b"payload")?;
//!     Ok(())
//! })?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod constants;
pub mod context;
pub mod error;
pub mod ffi;
pub mod logging;
pub mod metadata;

pub use context::Context;
pub use error::{StageError, StageResult, UsageError};
pub use metadata::{MetadataHandle, RawMetadata};
