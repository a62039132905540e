//! dyadio configuration
//!
//! [`StageOptions`] mirrors the options accepted by the native `dyad_init`
//! exactly. [`StageConfig`] wraps them together with the library location and
//! log level so a whole deployment can be described in one TOML file.

use serde::{Deserialize, Serialize};
use std::ffi::{CStr, c_int, c_void};
use std::path::PathBuf;
use std::ptr::NonNull;

/// Default configuration constants
///
/// Values follow the defaults of the DYAD service itself so that a config
/// file only needs to name what differs.
pub mod defaults {
    /// Depth of the key hierarchy used by the service's KVS
    pub const KEY_DEPTH: u32 = 3;

    /// Number of bins used in key hashing
    pub const KEY_BINS: u32 = 1024;

    /// Number of brokers sharing node-local storage
    pub const SERVICE_MUX: u32 = 1;

    /// Fail when the library exports no ABI marker
    pub const REQUIRE_ABI_MARKER: bool = false;

    // Log level
    /// Default log level
    pub const fn default_log_level() -> &'static str {
        "info"
    }
}

/// Transport strategy used inside the transfer service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DtlMode {
    /// Direct transport (UCX)
    Ucx,
    /// RPC over the service mesh (Flux RPC)
    #[default]
    FluxRpc,
}

impl DtlMode {
    /// Name understood by the native `dyad_init`
    pub fn as_c_str(&self) -> &'static CStr {
        match self {
            DtlMode::Ucx => c"UCX",
            DtlMode::FluxRpc => c"FLUX_RPC",
        }
    }
}

/// Communication role of this process in the transfer layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DtlCommMode {
    None,
    #[default]
    Recv,
    Send,
    Bidirectional,
}

impl DtlCommMode {
    /// Value of `dyad_dtl_comm_mode_t`
    pub fn as_raw(&self) -> c_int {
        match self {
            DtlCommMode::None => 0,
            DtlCommMode::Recv => 1,
            DtlCommMode::Send => 2,
            // Released headers stop at DYAD_COMM_END = 3; this value needs a
            // library revision that defines a bidirectional mode.
            DtlCommMode::Bidirectional => 3,
        }
    }
}

/// Connection handle owned by someone else (a `flux_t*`), shared across
/// contexts so they reuse one underlying service connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalHandle(NonNull<c_void>);

impl ExternalHandle {
    /// Wrap a foreign connection pointer. Returns `None` for null.
    ///
    /// # Safety
    ///
    /// `ptr` must stay valid for as long as any context initialized with it
    /// is alive.
    pub unsafe fn from_raw(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.0.as_ptr()
    }
}

/// Options passed to the native `dyad_init`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageOptions {
    /// Enable debug logging inside the service
    pub debug: bool,

    /// Enable integrity checks inside the service
    pub check: bool,

    /// Managed paths live on storage shared by producer and consumer
    pub shared_storage: bool,

    /// Allow initializing an already initialized context again
    pub reinit: bool,

    /// Publish produced files asynchronously
    pub async_publish: bool,

    /// fsync after every produced write
    pub fsync_write: bool,

    pub key_depth: u32,
    pub key_bins: u32,

    /// Number of service brokers sharing node-local storage
    pub service_mux: u32,

    /// KVS namespace; the service picks one when absent
    pub kvs_namespace: Option<String>,

    /// Producer-managed directory
    pub producer_path: Option<PathBuf>,

    /// Consumer-managed directory
    pub consumer_path: Option<PathBuf>,

    /// Relative paths are relative to the managed path
    pub relative_to_managed_path: bool,

    pub dtl_mode: DtlMode,
    pub dtl_comm_mode: DtlCommMode,

    /// Existing service connection to share
    #[serde(skip)]
    pub external_connection: Option<ExternalHandle>,
}

impl Default for StageOptions {
    fn default() -> Self {
        Self {
            debug: false,
            check: false,
            shared_storage: false,
            reinit: false,
            async_publish: false,
            fsync_write: false,
            key_depth: defaults::KEY_DEPTH,
            key_bins: defaults::KEY_BINS,
            service_mux: defaults::SERVICE_MUX,
            kvs_namespace: None,
            producer_path: None,
            consumer_path: None,
            relative_to_managed_path: false,
            dtl_mode: DtlMode::default(),
            dtl_comm_mode: DtlCommMode::default(),
            external_connection: None,
        }
    }
}

impl StageOptions {
    pub fn producer(mut self, path: impl Into<PathBuf>) -> Self {
        self.producer_path = Some(path.into());
        self
    }

    pub fn consumer(mut self, path: impl Into<PathBuf>) -> Self {
        self.consumer_path = Some(path.into());
        self
    }

    pub fn reinit(mut self, reinit: bool) -> Self {
        self.reinit = reinit;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.key_depth == 0 {
            return Err(ConfigError::ValidationError(
                "key_depth must be at least 1".to_string(),
            ));
        }
        if self.key_bins == 0 {
            return Err(ConfigError::ValidationError(
                "key_bins must be at least 1".to_string(),
            ));
        }
        if self.service_mux == 0 {
            return Err(ConfigError::ValidationError(
                "service_mux must be at least 1".to_string(),
            ));
        }
        if matches!(self.kvs_namespace.as_deref(), Some("")) {
            return Err(ConfigError::ValidationError(
                "kvs_namespace cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where to find the native library
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// Exact path to `libdyad_core.so`; skips the search when set
    pub library_path: Option<PathBuf>,

    /// Directories searched in order before falling back to the system loader
    pub search_dirs: Vec<PathBuf>,

    /// Treat a library without `dyad_abi_version` as incompatible
    pub require_abi_marker: bool,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            library_path: None,
            search_dirs: Vec::new(),
            require_abi_marker: defaults::REQUIRE_ABI_MARKER,
        }
    }
}

impl LibraryConfig {
    /// Candidate paths in search order.
    ///
    /// The last candidate is always the bare file name, resolved by the
    /// system loader (`LD_LIBRARY_PATH`, ld cache).
    pub fn candidates(&self) -> Vec<PathBuf> {
        if let Some(path) = &self.library_path {
            return vec![path.clone()];
        }

        let file_name = crate::constants::library_file_name();
        let mut candidates: Vec<PathBuf> =
            self.search_dirs.iter().map(|d| d.join(&file_name)).collect();
        if let Some(dir) = crate::constants::BUILD_LIB_DIR {
            candidates.push(PathBuf::from(dir).join(&file_name));
        }
        candidates.push(PathBuf::from(file_name));
        candidates
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    defaults::default_log_level().to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Complete staging configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    #[serde(default)]
    pub library: LibraryConfig,

    #[serde(default)]
    pub options: StageOptions,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl StageConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&contents)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: StageConfig = toml::from_str(contents)
            .map_err(|e| ConfigError::ParseError(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file(&self, path: &str) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self).map_err(|e| {
            ConfigError::SerializeError(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path, contents)
            .map_err(|e| ConfigError::WriteError(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Validate configuration
    fn validate(&self) -> Result<(), ConfigError> {
        self.options.validate()?;

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )));
            }
        }

        if let Some(path) = &self.library.library_path {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::ValidationError(
                    "library_path cannot be empty".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config: {0}")]
    WriteError(String),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}
