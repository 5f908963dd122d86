//! SQLite VFS adapter
//!
//! Lets implementations of [`Vfs`] and [`VfsFile`] stand in for SQLite's
//! native `sqlite3_vfs` / `sqlite3_io_methods` tables. Each engine entry point
//! is a trampoline that dispatches to the trait object, translates failures
//! into status codes and reports what the engine cannot see through the
//! excepthook.
//!
//! Unoverridden methods fall through to [`Vfs::base`] / [`VfsFile::base`], so
//! a derived VFS only has to implement the operations it changes.

use crate::error::{Result, VfsError};
use libsqlite3_sys as ffi;
use std::os::raw::{c_int, c_void};
use std::time::Duration;

/// Evaluates `$normal`, or `$fault` when the named fault point is armed.
macro_rules! fault_inject {
    ($point:ident, $normal:expr, $fault:expr) => {{
        #[cfg(any(test, feature = "fault-injection"))]
        let fired = $crate::core::vfs::fault::fires($crate::core::vfs::fault::FaultPoint::$point);
        #[cfg(not(any(test, feature = "fault-injection")))]
        let fired = false;
        if fired {
            $fault
        } else {
            $normal
        }
    }};
}

mod base;
#[cfg(any(test, feature = "fault-injection"))]
pub mod fault;
mod file;
mod frame;
mod hook;
#[allow(clippy::module_inception)]
mod vfs;


pub use base::{BaseFile, BaseVfs};
pub(crate) use base::resolve_name;
pub use frame::defer;
pub use hook::{clear_excepthook, report, set_excepthook, Failure};
pub use vfs::{RegisteredVfs, VfsRegistration, DEFAULT_MAX_PATHNAME};

/// The one version of the VFS and io-methods tables this adapter speaks.
pub const SUPPORTED_VERSION: c_int = 1;

/// Sector size substituted when `xSectorSize` fails.
pub const DEFAULT_SECTOR_SIZE: u32 = 512;

/// Input and output open flags.
///
/// `input` is what SQLite asked for; `output` is what the implementation
/// actually granted and is handed back to SQLite after a successful open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    pub input: c_int,
    pub output: c_int,
}

impl OpenFlags {
    pub fn new(input: c_int) -> Self {
        Self { input, output: 0 }
    }

    pub fn contains(&self, flag: c_int) -> bool {
        self.input & flag == flag
    }

    pub fn is_create(&self) -> bool {
        self.contains(ffi::SQLITE_OPEN_CREATE)
    }

    pub fn is_readonly(&self) -> bool {
        self.contains(ffi::SQLITE_OPEN_READONLY)
    }

    pub fn is_exclusive(&self) -> bool {
        self.contains(ffi::SQLITE_OPEN_EXCLUSIVE)
    }

    pub fn is_delete_on_close(&self) -> bool {
        self.contains(ffi::SQLITE_OPEN_DELETEONCLOSE)
    }
}

/// Question asked by `xAccess`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Exists,
    ReadWrite,
    Read,
}

impl AccessKind {
    pub fn from_raw(flags: c_int) -> Option<Self> {
        match flags {
            ffi::SQLITE_ACCESS_EXISTS => Some(AccessKind::Exists),
            ffi::SQLITE_ACCESS_READWRITE => Some(AccessKind::ReadWrite),
            ffi::SQLITE_ACCESS_READ => Some(AccessKind::Read),
            _ => None,
        }
    }

    pub fn to_raw(self) -> c_int {
        match self {
            AccessKind::Exists => ffi::SQLITE_ACCESS_EXISTS,
            AccessKind::ReadWrite => ffi::SQLITE_ACCESS_READWRITE,
            AccessKind::Read => ffi::SQLITE_ACCESS_READ,
        }
    }
}

/// File lock levels, ordered from weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockLevel {
    None,
    Shared,
    Reserved,
    Pending,
    Exclusive,
}

impl LockLevel {
    pub fn from_raw(level: c_int) -> Option<Self> {
        match level {
            ffi::SQLITE_LOCK_NONE => Some(LockLevel::None),
            ffi::SQLITE_LOCK_SHARED => Some(LockLevel::Shared),
            ffi::SQLITE_LOCK_RESERVED => Some(LockLevel::Reserved),
            ffi::SQLITE_LOCK_PENDING => Some(LockLevel::Pending),
            ffi::SQLITE_LOCK_EXCLUSIVE => Some(LockLevel::Exclusive),
            _ => None,
        }
    }

    pub fn to_raw(self) -> c_int {
        match self {
            LockLevel::None => ffi::SQLITE_LOCK_NONE,
            LockLevel::Shared => ffi::SQLITE_LOCK_SHARED,
            LockLevel::Reserved => ffi::SQLITE_LOCK_RESERVED,
            LockLevel::Pending => ffi::SQLITE_LOCK_PENDING,
            LockLevel::Exclusive => ffi::SQLITE_LOCK_EXCLUSIVE,
        }
    }
}

/// Flags passed to `xSync`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncFlags(c_int);

impl SyncFlags {
    pub fn from_raw(flags: c_int) -> Self {
        SyncFlags(flags)
    }

    pub fn to_raw(self) -> c_int {
        self.0
    }

    pub fn is_full(self) -> bool {
        self.0 & 0x0f == ffi::SQLITE_SYNC_FULL
    }

    pub fn is_data_only(self) -> bool {
        self.0 & ffi::SQLITE_SYNC_DATAONLY != 0
    }
}

impl Default for SyncFlags {
    fn default() -> Self {
        SyncFlags(ffi::SQLITE_SYNC_NORMAL)
    }
}

/// Opaque handle returned by `xDlOpen`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DlHandle(pub *mut c_void);

/// Opaque symbol address returned by `xDlSym`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DlSymbol(pub *mut c_void);

// Both are plain addresses owned by the dynamic loader.
unsafe impl Send for DlHandle {}
unsafe impl Sync for DlHandle {}
unsafe impl Send for DlSymbol {}
unsafe impl Sync for DlSymbol {}

impl DlHandle {
    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }
}

impl DlSymbol {
    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }
}

/// A VFS implementation.
///
/// Method names mirror SQLite's entry points (`delete` is `xDelete` and so on).
/// Every method has a default that forwards to [`Vfs::base`]; without a base
/// the default fails with [`VfsError::NotImplemented`].
pub trait Vfs: Send + Sync + 'static {
    /// The VFS this one inherits from, if any.
    fn base(&self) -> Option<&BaseVfs> {
        None
    }

    fn delete(&self, name: &str, sync_dir: bool) -> Result<()> {
        base_of(self.base(), "xDelete")?.delete(name, sync_dir)
    }

    fn access(&self, name: &str, kind: AccessKind) -> Result<bool> {
        base_of(self.base(), "xAccess")?.access(name, kind)
    }

    fn full_pathname(&self, name: &str) -> Result<String> {
        base_of(self.base(), "xFullPathname")?.full_pathname(name)
    }

    /// Opens a file. `name` is `None` for temporary files.
    ///
    /// `flags.output` should be updated to describe how the file was actually
    /// opened (for example `SQLITE_OPEN_READONLY`).
    fn open(&self, name: Option<&str>, flags: &mut OpenFlags) -> Result<Box<dyn VfsFile>> {
        let file = base_of(self.base(), "xOpen")?.open(name, flags)?;
        Ok(Box::new(file))
    }

    fn dl_open(&self, path: &str) -> Result<DlHandle> {
        base_of(self.base(), "xDlOpen")?.dl_open(path)
    }

    fn dl_sym(&self, handle: DlHandle, symbol: &str) -> Result<DlSymbol> {
        base_of(self.base(), "xDlSym")?.dl_sym(handle, symbol)
    }

    fn dl_close(&self, handle: DlHandle) -> Result<()> {
        base_of(self.base(), "xDlClose")?.dl_close(handle)
    }

    fn dl_error(&self) -> Result<Option<String>> {
        base_of(self.base(), "xDlError")?.dl_error()
    }

    fn randomness(&self, amount: usize) -> Result<Vec<u8>> {
        base_of(self.base(), "xRandomness")?.randomness(amount)
    }

    /// Pauses for at least `duration` and returns the time actually slept.
    fn sleep(&self, duration: Duration) -> Result<Duration> {
        base_of(self.base(), "xSleep")?.sleep(duration)
    }

    /// Current time as a Julian day number.
    fn current_time(&self) -> Result<f64> {
        base_of(self.base(), "xCurrentTime")?.current_time()
    }

    fn get_last_error(&self) -> Result<Option<String>> {
        base_of(self.base(), "xGetLastError")?.get_last_error()
    }

    /// Receives failures SQLite has no channel for.
    fn excepthook(&self, failure: &Failure) {
        report(failure)
    }
}

/// An open file handed out by [`Vfs::open`].
///
/// Defaults forward to [`VfsFile::base`] the same way [`Vfs`] does.
pub trait VfsFile: Send {
    fn base(&mut self) -> Option<&mut BaseFile> {
        None
    }

    /// Reads up to `amount` bytes at `offset`.
    ///
    /// Returning fewer bytes than requested is a short read: SQLite sees
    /// `SQLITE_IOERR_SHORT_READ` and the rest of its buffer is zero-filled.
    fn read(&mut self, amount: usize, offset: u64) -> Result<Vec<u8>> {
        file_base_of(self.base(), "xRead")?.read(amount, offset)
    }

    /// Writes all of `data` at `offset`. Partial writes must be reported as
    /// errors; the adapter never retries.
    fn write(&mut self, data: &[u8], offset: u64) -> Result<()> {
        file_base_of(self.base(), "xWrite")?.write(data, offset)
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        file_base_of(self.base(), "xTruncate")?.truncate(size)
    }

    fn sync(&mut self, flags: SyncFlags) -> Result<()> {
        file_base_of(self.base(), "xSync")?.sync(flags)
    }

    fn file_size(&mut self) -> Result<u64> {
        file_base_of(self.base(), "xFileSize")?.file_size()
    }

    fn lock(&mut self, level: LockLevel) -> Result<()> {
        file_base_of(self.base(), "xLock")?.lock(level)
    }

    fn unlock(&mut self, level: LockLevel) -> Result<()> {
        file_base_of(self.base(), "xUnlock")?.unlock(level)
    }

    fn check_reserved_lock(&mut self) -> Result<bool> {
        file_base_of(self.base(), "xCheckReservedLock")?.check_reserved_lock()
    }

    /// Handles `sqlite3_file_control`. `arg` is passed through untouched;
    /// unknown opcodes should fail with `SQLITE_NOTFOUND`.
    fn file_control(&mut self, op: c_int, arg: *mut c_void) -> Result<()> {
        file_base_of(self.base(), "xFileControl")?.file_control(op, arg)
    }

    fn sector_size(&mut self) -> Result<u32> {
        file_base_of(self.base(), "xSectorSize")?.sector_size()
    }

    fn device_characteristics(&mut self) -> Result<c_int> {
        file_base_of(self.base(), "xDeviceCharacteristics")?.device_characteristics()
    }

    fn close(&mut self) -> Result<()> {
        file_base_of(self.base(), "xClose")?.close()
    }

    fn excepthook(&self, failure: &Failure) {
        report(failure)
    }
}

fn base_of<'a>(base: Option<&'a BaseVfs>, method: &'static str) -> Result<&'a BaseVfs> {
    base.ok_or_else(|| VfsError::not_implemented(method))
}

fn file_base_of<'a>(
    base: Option<&'a mut BaseFile>,
    method: &'static str,
) -> Result<&'a mut BaseFile> {
    base.ok_or_else(|| VfsError::file_not_implemented(method))
}
