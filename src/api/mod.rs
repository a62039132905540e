//! Path-scoped staging API
//!
//! Opens and closes of local files are routed to the transfer service based
//! on where the file lives and how it is opened. Paths outside the managed
//! roots behave exactly like `std::fs::File`.

pub mod container;
pub mod file_ops;
pub mod path;
pub mod route;
pub mod types;

// Re-export main types
pub use container::{ContainerFile, StagedContainer};
pub use file_ops::*;
pub use path::{ManagedRoots, resolve_path};
pub use route::{RouteDecision, decide, route};
pub use types::*;
