//! # layervfs - Layered SQLite VFS adapter
//!
//! `layervfs` lets ordinary Rust types serve as SQLite virtual file systems.
//! Implement [`Vfs`] and [`VfsFile`], register the implementation, and every
//! file SQLite opens through it is dispatched to your code:
//!
//! - **Delegation**: unoverridden methods fall through to a base VFS, so a
//!   derived VFS only implements what it changes
//! - **Error translation**: failures become SQLite status codes on the way
//!   out, and native status codes become [`VfsError`]s on the way in
//! - **Unraisable failures**: anything SQLite has no channel for is delivered
//!   to an excepthook instead of being lost
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use layervfs::{MemoryVfs, Result, VfsRegistration};
//!
//! # fn main() -> Result<()> {
//! let vfs = VfsRegistration::new("memdb").register(MemoryVfs::new())?;
//!
//! let conn = vfs.open_connection("app.db")?;
//! conn.execute_batch("CREATE TABLE kv (k TEXT PRIMARY KEY, v BLOB)")?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Inheriting from another VFS
//!
//! ```rust,no_run
//! use layervfs::{BaseVfs, Result, Vfs, VfsRegistration};
//!
//! struct NoDelete {
//!     base: BaseVfs,
//! }
//!
//! impl Vfs for NoDelete {
//!     fn base(&self) -> Option<&BaseVfs> {
//!         Some(&self.base)
//!     }
//!
//!     fn delete(&self, name: &str, _sync_dir: bool) -> Result<()> {
//!         tracing::info!("keeping {}", name);
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> Result<()> {
//! let base = VfsRegistration::new("store").register(layervfs::MemoryVfs::new())?;
//! let _vfs = VfsRegistration::new("no-delete").register(NoDelete { base: base.as_base() })?;
//! # Ok(())
//! # }
//! ```

pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use crate::core::{config, error, memory, transform, vfs};

pub use crate::core::{
    config::VfsConfig,
    error::{check, Result, VfsError},
    memory::{MemoryFile, MemoryVfs},
    transform::{Transform, TransformFile, TransformVfs, XorTransform},
    vfs::{
        clear_excepthook, defer, report, set_excepthook, AccessKind, BaseFile, BaseVfs,
        DlHandle, DlSymbol, Failure, LockLevel, OpenFlags, RegisteredVfs, SyncFlags, Vfs,
        VfsFile, VfsRegistration, DEFAULT_MAX_PATHNAME, DEFAULT_SECTOR_SIZE, SUPPORTED_VERSION,
    },
};

#[cfg(any(test, feature = "fault-injection"))]
pub use crate::core::vfs::fault;
