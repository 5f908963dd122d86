//! Delegation to an already registered VFS
//!
//! [`BaseVfs`] and [`BaseFile`] call straight into another VFS's native
//! entry points. They are what the default [`Vfs`] / [`VfsFile`] methods fall
//! through to, and they implement those traits themselves so a base can be
//! registered again under a new name unchanged.

use super::frame::defer;
use super::hook::Failure;
use super::vfs::Descriptor;
use super::{
    AccessKind, DlHandle, DlSymbol, LockLevel, OpenFlags, SyncFlags, Vfs, VfsFile,
    SUPPORTED_VERSION,
};
use crate::error::{check, Result, VfsError};
use libsqlite3_sys as ffi;
use std::alloc::{self, Layout};
use std::ffi::{CStr, CString};
use std::fmt;
use std::mem;
use std::os::raw::{c_char, c_int, c_void};
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for the `xGetLastError` buffer
const MAX_LAST_ERROR: usize = 1 << 20;

/// Extra room SQLite's own loader reserves for `xDlError` messages
const DL_ERROR_EXTRA: usize = 512;

/// A registered VFS used as a base.
///
/// When the base was itself registered through this adapter, a strong
/// reference to its descriptor is held so unregistering it cannot pull the
/// native table out from under a derived VFS.
pub struct BaseVfs {
    raw: NonNull<ffi::sqlite3_vfs>,
    name: String,
    keepalive: Option<Arc<Descriptor>>,
}

// The native table is immutable after registration and SQLite VFS entry
// points are required to be thread-safe.
unsafe impl Send for BaseVfs {}
unsafe impl Sync for BaseVfs {}

impl BaseVfs {
    /// Looks up a registered VFS by name. An empty name means SQLite's
    /// current default VFS.
    ///
    /// # Errors
    ///
    /// - [`VfsError::BaseNotFound`] if nothing is registered under `name`
    /// - [`VfsError::BaseVersion`] if the VFS is not version
    ///   [`SUPPORTED_VERSION`]
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use layervfs::{BaseVfs, MemoryVfs, VfsRegistration};
    ///
    /// # fn main() -> layervfs::Result<()> {
    /// let _memory = VfsRegistration::new("mem-base").register(MemoryVfs::new())?;
    /// let base = BaseVfs::find("mem-base")?;
    /// assert_eq!(base.name(), "mem-base");
    /// # Ok(())
    /// # }
    /// ```
    pub fn find(name: &str) -> Result<Self> {
        let raw = lookup(name)?;
        let version = fault_inject!(BadBaseVersion, unsafe { raw.as_ref().iVersion }, -1);
        if version != SUPPORTED_VERSION {
            return Err(VfsError::BaseVersion {
                found: version,
                supported: SUPPORTED_VERSION,
            });
        }
        Ok(unsafe { Self::from_raw(raw) })
    }

    /// The current default VFS as a base.
    pub fn default_vfs() -> Result<Self> {
        Self::find("")
    }

    pub(crate) fn from_descriptor(descriptor: Arc<Descriptor>) -> Self {
        Self {
            raw: descriptor.as_non_null(),
            name: descriptor.name().to_string(),
            keepalive: Some(descriptor),
        }
    }

    unsafe fn from_raw(raw: NonNull<ffi::sqlite3_vfs>) -> Self {
        let keepalive = if Descriptor::is_adapter(raw.as_ptr()) {
            Descriptor::retain(raw.as_ptr())
        } else {
            None
        };
        Self {
            raw,
            name: vfs_name(raw),
            keepalive,
        }
    }

    fn vfs(&self) -> &ffi::sqlite3_vfs {
        unsafe { self.raw.as_ref() }
    }

    pub fn as_ptr(&self) -> *mut ffi::sqlite3_vfs {
        self.raw.as_ptr()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> c_int {
        self.vfs().iVersion
    }

    pub fn max_pathname(&self) -> u32 {
        u32::try_from(self.vfs().mxPathname).unwrap_or(0)
    }

    /// True if the base was registered through this adapter.
    pub fn is_adapter(&self) -> bool {
        self.keepalive.is_some()
    }

    pub fn delete(&self, name: &str, sync_dir: bool) -> Result<()> {
        let delete = self.vfs().xDelete.ok_or_else(|| VfsError::not_implemented("xDelete"))?;
        let name = c_string(name)?;
        check(unsafe { delete(self.as_ptr(), name.as_ptr(), sync_dir as c_int) })
    }

    pub fn access(&self, name: &str, kind: AccessKind) -> Result<bool> {
        let access = self.vfs().xAccess.ok_or_else(|| VfsError::not_implemented("xAccess"))?;
        let name = c_string(name)?;
        let mut res: c_int = 0;
        check(unsafe { access(self.as_ptr(), name.as_ptr(), kind.to_raw(), &mut res) })?;
        Ok(res != 0)
    }

    pub fn full_pathname(&self, name: &str) -> Result<String> {
        let full_pathname = self
            .vfs()
            .xFullPathname
            .ok_or_else(|| VfsError::not_implemented("xFullPathname"))?;
        let name = c_string(name)?;

        let n_out = self.vfs().mxPathname.max(0).saturating_add(1);
        let mut buf = zeroed_buffer(n_out as usize)?;
        check(unsafe {
            full_pathname(self.as_ptr(), name.as_ptr(), n_out, buf.as_mut_ptr() as *mut c_char)
        })?;

        fault_inject!(FullPathnameConversion, strict_text(&buf), None)
            .ok_or_else(|| VfsError::from_code(ffi::SQLITE_CANTOPEN))
    }

    /// Opens a file through the base. See [`BaseFile`].
    pub fn open(&self, name: Option<&str>, flags: &mut OpenFlags) -> Result<BaseFile> {
        BaseFile::open_raw(self.raw, self.keepalive.clone(), name, flags)
    }

    /// Loads a shared library. A null handle means the load failed; see
    /// [`BaseVfs::dl_error`].
    pub fn dl_open(&self, path: &str) -> Result<DlHandle> {
        let dl_open = self.vfs().xDlOpen.ok_or_else(|| VfsError::not_implemented("xDlOpen"))?;
        let path = c_string(path)?;
        Ok(DlHandle(unsafe { dl_open(self.as_ptr(), path.as_ptr()) }))
    }

    pub fn dl_sym(&self, handle: DlHandle, symbol: &str) -> Result<DlSymbol> {
        let dl_sym = self.vfs().xDlSym.ok_or_else(|| VfsError::not_implemented("xDlSym"))?;
        let symbol = c_string(symbol)?;
        let address = unsafe { dl_sym(self.as_ptr(), handle.0, symbol.as_ptr()) };
        Ok(DlSymbol(address.map_or(ptr::null_mut(), |f| f as *mut c_void)))
    }

    pub fn dl_close(&self, handle: DlHandle) -> Result<()> {
        let dl_close = self.vfs().xDlClose.ok_or_else(|| VfsError::not_implemented("xDlClose"))?;
        unsafe { dl_close(self.as_ptr(), handle.0) };
        Ok(())
    }

    pub fn dl_error(&self) -> Result<Option<String>> {
        let dl_error = self.vfs().xDlError.ok_or_else(|| VfsError::not_implemented("xDlError"))?;
        let size = DL_ERROR_EXTRA + self.max_pathname() as usize;
        let mut buf = fault_inject!(DlErrorAlloc, zeroed_buffer(size), Err(VfsError::NoMem))?;
        unsafe { dl_error(self.as_ptr(), size as c_int, buf.as_mut_ptr() as *mut c_char) };
        Ok(lossy_text(&buf))
    }

    /// Random bytes from the base, truncated to what it actually produced.
    pub fn randomness(&self, amount: usize) -> Result<Vec<u8>> {
        let randomness = self
            .vfs()
            .xRandomness
            .ok_or_else(|| VfsError::not_implemented("xRandomness"))?;
        let n_byte = c_int::try_from(amount).map_err(|_| {
            VfsError::protocol("xRandomness", format!("{} bytes is more than SQLite can supply", amount))
        })?;

        let mut buf = fault_inject!(RandomnessAlloc, zeroed_buffer(amount), Err(VfsError::NoMem))?;
        let produced =
            unsafe { randomness(self.as_ptr(), n_byte, buf.as_mut_ptr() as *mut c_char) };
        buf.truncate(usize::try_from(produced).unwrap_or(0).min(amount));
        Ok(buf)
    }

    pub fn sleep(&self, duration: Duration) -> Result<Duration> {
        let sleep = self.vfs().xSleep.ok_or_else(|| VfsError::not_implemented("xSleep"))?;
        let micros = c_int::try_from(duration.as_micros())
            .map_err(|_| VfsError::protocol("xSleep", format!("{:?} is too long", duration)))?;
        let slept = unsafe { sleep(self.as_ptr(), micros) };
        Ok(Duration::from_micros(u64::try_from(slept).unwrap_or(0)))
    }

    pub fn current_time(&self) -> Result<f64> {
        let current_time = self
            .vfs()
            .xCurrentTime
            .ok_or_else(|| VfsError::not_implemented("xCurrentTime"))?;
        let mut now = 0.0f64;
        let rc = fault_inject!(
            CurrentTimeFail,
            unsafe { current_time(self.as_ptr(), &mut now) },
            1
        );
        if rc != 0 {
            return Err(VfsError::from_code(ffi::SQLITE_ERROR));
        }
        Ok(now)
    }

    /// The base's last error message, growing the buffer until it fits.
    pub fn get_last_error(&self) -> Result<Option<String>> {
        let get_last_error = self
            .vfs()
            .xGetLastError
            .ok_or_else(|| VfsError::not_implemented("xGetLastError"))?;

        let mut size = 256usize;
        loop {
            let mut buf =
                fault_inject!(GetLastErrorAlloc, zeroed_buffer(size), Err(VfsError::NoMem))?;
            let too_small = unsafe {
                get_last_error(self.as_ptr(), size as c_int, buf.as_mut_ptr() as *mut c_char)
            };
            if too_small == 0 || size >= MAX_LAST_ERROR {
                return Ok(lossy_text(&buf));
            }
            size *= 2;
        }
    }
}

impl fmt::Debug for BaseVfs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseVfs")
            .field("name", &self.name)
            .field("version", &self.version())
            .field("max_pathname", &self.max_pathname())
            .field("adapter", &self.is_adapter())
            .finish()
    }
}

// The pass-through variant: a base registered as a VFS of its own.
impl Vfs for BaseVfs {
    fn delete(&self, name: &str, sync_dir: bool) -> Result<()> {
        BaseVfs::delete(self, name, sync_dir)
    }

    fn access(&self, name: &str, kind: AccessKind) -> Result<bool> {
        BaseVfs::access(self, name, kind)
    }

    fn full_pathname(&self, name: &str) -> Result<String> {
        BaseVfs::full_pathname(self, name)
    }

    fn open(&self, name: Option<&str>, flags: &mut OpenFlags) -> Result<Box<dyn VfsFile>> {
        Ok(Box::new(BaseVfs::open(self, name, flags)?))
    }

    fn dl_open(&self, path: &str) -> Result<DlHandle> {
        BaseVfs::dl_open(self, path)
    }

    fn dl_sym(&self, handle: DlHandle, symbol: &str) -> Result<DlSymbol> {
        BaseVfs::dl_sym(self, handle, symbol)
    }

    fn dl_close(&self, handle: DlHandle) -> Result<()> {
        BaseVfs::dl_close(self, handle)
    }

    fn dl_error(&self) -> Result<Option<String>> {
        BaseVfs::dl_error(self)
    }

    fn randomness(&self, amount: usize) -> Result<Vec<u8>> {
        BaseVfs::randomness(self, amount)
    }

    fn sleep(&self, duration: Duration) -> Result<Duration> {
        BaseVfs::sleep(self, duration)
    }

    fn current_time(&self) -> Result<f64> {
        BaseVfs::current_time(self)
    }

    fn get_last_error(&self) -> Result<Option<String>> {
        BaseVfs::get_last_error(self)
    }
}

/// A file opened through a base VFS's native `xOpen`.
///
/// Owns a zeroed block of the base's `szOsFile` bytes. Closing is idempotent;
/// dropping an open file closes it and defers any close failure.
pub struct BaseFile {
    raw: Option<NonNull<ffi::sqlite3_file>>,
    layout: Layout,
    /// Engine-format name from `sqlite3_create_filename`; must outlive the
    /// native file because VFSes keep the pointer.
    filename: *const c_char,
    name: String,
    _keepalive: Option<Arc<Descriptor>>,
}

// A native file handle may be used from any thread, one at a time.
unsafe impl Send for BaseFile {}

impl BaseFile {
    /// Opens `name` through the VFS registered as `vfs_name` (`""` for the
    /// default). Unlike [`BaseVfs::find`] this does not check the VFS version,
    /// since only version 1 io methods are called on the result.
    ///
    /// # Errors
    ///
    /// [`VfsError::BaseNotFound`] for an unknown VFS, otherwise whatever the
    /// native open reports.
    pub fn open(vfs_name: &str, name: Option<&str>, flags: &mut OpenFlags) -> Result<Self> {
        let raw = lookup(vfs_name)?;
        let keepalive = unsafe {
            if Descriptor::is_adapter(raw.as_ptr()) {
                Descriptor::retain(raw.as_ptr())
            } else {
                None
            }
        };
        Self::open_raw(raw, keepalive, name, flags)
    }

    fn open_raw(
        vfs: NonNull<ffi::sqlite3_vfs>,
        keepalive: Option<Arc<Descriptor>>,
        name: Option<&str>,
        flags: &mut OpenFlags,
    ) -> Result<Self> {
        let native = unsafe { vfs.as_ref() };
        let open = native.xOpen.ok_or_else(|| VfsError::not_implemented("xOpen"))?;

        let filename = match name {
            Some(name) => engine_filename(name)?,
            None => ptr::null(),
        };
        let size = usize::try_from(native.szOsFile)
            .unwrap_or(0)
            .max(mem::size_of::<ffi::sqlite3_file>());
        let layout = Layout::from_size_align(size, mem::align_of::<ffi::sqlite3_file>().max(8))
            .map_err(|_| VfsError::NoMem)?;
        let raw = NonNull::new(unsafe { alloc::alloc_zeroed(layout) } as *mut ffi::sqlite3_file);

        // Built before checking the allocation so the filename is freed on
        // every path.
        let mut file = BaseFile {
            raw,
            layout,
            filename,
            name: name.unwrap_or("<temp>").to_string(),
            _keepalive: keepalive,
        };
        let raw = file.raw.ok_or(VfsError::NoMem)?;

        let mut out_flags = flags.output;
        let rc = unsafe { open(vfs.as_ptr(), filename, raw.as_ptr(), flags.input, &mut out_flags) };
        if rc != ffi::SQLITE_OK {
            // A base that installed its methods before failing still gets
            // its xClose.
            if let Err(err) = file.close() {
                defer(Failure::new("xClose", err).with("file", &file.name));
            }
            return Err(VfsError::from_code(rc));
        }

        flags.output = out_flags;
        Ok(file)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.raw.is_some()
    }

    pub fn as_ptr(&self) -> *mut ffi::sqlite3_file {
        self.raw.map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    fn methods(&self) -> Result<(*mut ffi::sqlite3_file, &ffi::sqlite3_io_methods)> {
        let raw = self.raw.ok_or(VfsError::FileClosed)?;
        let methods = unsafe { (*raw.as_ptr()).pMethods.as_ref() }.ok_or(VfsError::FileClosed)?;
        Ok((raw.as_ptr(), methods))
    }

    /// Reads up to `amount` bytes at `offset`.
    ///
    /// On a short read the native layer only says "short", not how short, so
    /// trailing zero bytes are trimmed from the zero-filled buffer. Content
    /// that genuinely ends in zeros comes back shorter than it is.
    pub fn read(&mut self, amount: usize, offset: u64) -> Result<Vec<u8>> {
        let (file, methods) = self.methods()?;
        let read = methods.xRead.ok_or_else(|| VfsError::file_not_implemented("xRead"))?;
        let amt = c_int::try_from(amount)
            .map_err(|_| VfsError::protocol("xRead", format!("{} bytes is too many", amount)))?;
        let offset = native_offset("xRead", offset)?;

        let mut buf = fault_inject!(ReadBufferAlloc, zeroed_buffer(amount), Err(VfsError::NoMem))?;
        let rc = unsafe { read(file, buf.as_mut_ptr() as *mut c_void, amt, offset) };
        match rc {
            ffi::SQLITE_OK => Ok(buf),
            ffi::SQLITE_IOERR_SHORT_READ => {
                let end = buf.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
                buf.truncate(end);
                Ok(buf)
            }
            _ => Err(VfsError::from_code(rc)),
        }
    }

    pub fn write(&mut self, data: &[u8], offset: u64) -> Result<()> {
        let (file, methods) = self.methods()?;
        let write = methods.xWrite.ok_or_else(|| VfsError::file_not_implemented("xWrite"))?;
        let amt = c_int::try_from(data.len())
            .map_err(|_| VfsError::protocol("xWrite", format!("{} bytes is too many", data.len())))?;
        let offset = native_offset("xWrite", offset)?;
        check(unsafe { write(file, data.as_ptr() as *const c_void, amt, offset) })
    }

    pub fn truncate(&mut self, size: u64) -> Result<()> {
        let (file, methods) = self.methods()?;
        let truncate = methods
            .xTruncate
            .ok_or_else(|| VfsError::file_not_implemented("xTruncate"))?;
        check(unsafe { truncate(file, native_offset("xTruncate", size)?) })
    }

    pub fn sync(&mut self, flags: SyncFlags) -> Result<()> {
        let (file, methods) = self.methods()?;
        let sync = methods.xSync.ok_or_else(|| VfsError::file_not_implemented("xSync"))?;
        let rc = unsafe { sync(file, flags.to_raw()) };
        check(fault_inject!(SyncFails, rc, ffi::SQLITE_IOERR))
    }

    pub fn file_size(&mut self) -> Result<u64> {
        let (file, methods) = self.methods()?;
        let file_size = methods
            .xFileSize
            .ok_or_else(|| VfsError::file_not_implemented("xFileSize"))?;
        let mut size: ffi::sqlite3_int64 = 0;
        let rc = unsafe { file_size(file, &mut size) };
        check(fault_inject!(FileSizeFails, rc, ffi::SQLITE_IOERR))?;
        u64::try_from(size)
            .map_err(|_| VfsError::protocol("xFileSize", format!("negative size {}", size)))
    }

    pub fn lock(&mut self, level: LockLevel) -> Result<()> {
        let (file, methods) = self.methods()?;
        let lock = methods.xLock.ok_or_else(|| VfsError::file_not_implemented("xLock"))?;
        check(unsafe { lock(file, level.to_raw()) })
    }

    pub fn unlock(&mut self, level: LockLevel) -> Result<()> {
        let (file, methods) = self.methods()?;
        let unlock = methods.xUnlock.ok_or_else(|| VfsError::file_not_implemented("xUnlock"))?;
        let rc = unsafe { unlock(file, level.to_raw()) };
        check(fault_inject!(UnlockFails, rc, ffi::SQLITE_IOERR))
    }

    pub fn check_reserved_lock(&mut self) -> Result<bool> {
        let (file, methods) = self.methods()?;
        let check_reserved_lock = methods
            .xCheckReservedLock
            .ok_or_else(|| VfsError::file_not_implemented("xCheckReservedLock"))?;
        let mut reserved: c_int = 0;
        let rc = unsafe { check_reserved_lock(file, &mut reserved) };
        check(fault_inject!(CheckReservedLockFails, rc, ffi::SQLITE_IOERR))?;
        Ok(fault_inject!(CheckReservedLockIsTrue, reserved != 0, true))
    }

    pub fn file_control(&mut self, op: c_int, arg: *mut c_void) -> Result<()> {
        let (file, methods) = self.methods()?;
        let file_control = methods
            .xFileControl
            .ok_or_else(|| VfsError::file_not_implemented("xFileControl"))?;
        check(unsafe { file_control(file, op, arg) })
    }

    pub fn sector_size(&mut self) -> Result<u32> {
        let (file, methods) = self.methods()?;
        let sector_size = methods
            .xSectorSize
            .ok_or_else(|| VfsError::file_not_implemented("xSectorSize"))?;
        let size = unsafe { sector_size(file) };
        u32::try_from(size)
            .map_err(|_| VfsError::protocol("xSectorSize", format!("negative sector size {}", size)))
    }

    pub fn device_characteristics(&mut self) -> Result<c_int> {
        let (file, methods) = self.methods()?;
        let device_characteristics = methods
            .xDeviceCharacteristics
            .ok_or_else(|| VfsError::file_not_implemented("xDeviceCharacteristics"))?;
        Ok(unsafe { device_characteristics(file) })
    }

    /// Closes the native file and frees the handle. Later calls do nothing.
    pub fn close(&mut self) -> Result<()> {
        let rc = match self.raw.take() {
            Some(raw) => unsafe {
                let file = raw.as_ptr();
                let rc = match (*file).pMethods.as_ref().and_then(|methods| methods.xClose) {
                    Some(close) => close(file),
                    None => ffi::SQLITE_OK,
                };
                (*file).pMethods = ptr::null();
                alloc::dealloc(file as *mut u8, self.layout);
                fault_inject!(CloseFails, rc, ffi::SQLITE_IOERR)
            },
            None => ffi::SQLITE_OK,
        };
        if !self.filename.is_null() {
            unsafe { ffi::sqlite3_free_filename(self.filename) };
            self.filename = ptr::null();
        }
        check(rc)
    }
}

impl fmt::Debug for BaseFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseFile")
            .field("name", &self.name)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Drop for BaseFile {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            defer(Failure::new("xClose", err).with("file", &self.name));
        }
    }
}

impl VfsFile for BaseFile {
    fn read(&mut self, amount: usize, offset: u64) -> Result<Vec<u8>> {
        BaseFile::read(self, amount, offset)
    }

    fn write(&mut self, data: &[u8], offset: u64) -> Result<()> {
        BaseFile::write(self, data, offset)
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        BaseFile::truncate(self, size)
    }

    fn sync(&mut self, flags: SyncFlags) -> Result<()> {
        BaseFile::sync(self, flags)
    }

    fn file_size(&mut self) -> Result<u64> {
        BaseFile::file_size(self)
    }

    fn lock(&mut self, level: LockLevel) -> Result<()> {
        BaseFile::lock(self, level)
    }

    fn unlock(&mut self, level: LockLevel) -> Result<()> {
        BaseFile::unlock(self, level)
    }

    fn check_reserved_lock(&mut self) -> Result<bool> {
        BaseFile::check_reserved_lock(self)
    }

    fn file_control(&mut self, op: c_int, arg: *mut c_void) -> Result<()> {
        BaseFile::file_control(self, op, arg)
    }

    fn sector_size(&mut self) -> Result<u32> {
        BaseFile::sector_size(self)
    }

    fn device_characteristics(&mut self) -> Result<c_int> {
        BaseFile::device_characteristics(self)
    }

    fn close(&mut self) -> Result<()> {
        BaseFile::close(self)
    }
}

// Helpers

fn lookup(name: &str) -> Result<NonNull<ffi::sqlite3_vfs>> {
    let c_name = if name.is_empty() {
        None
    } else {
        Some(c_string(name)?)
    };
    let raw = unsafe { ffi::sqlite3_vfs_find(c_name.as_ref().map_or(ptr::null(), |n| n.as_ptr())) };
    NonNull::new(raw).ok_or_else(|| {
        VfsError::BaseNotFound(if name.is_empty() {
            String::from("<default>")
        } else {
            name.to_string()
        })
    })
}

/// Name SQLite resolves `name` to (`""` is the current default).
pub(crate) fn resolve_name(name: &str) -> Result<String> {
    lookup(name).map(vfs_name)
}

fn vfs_name(raw: NonNull<ffi::sqlite3_vfs>) -> String {
    let z_name = unsafe { raw.as_ref().zName };
    if z_name.is_null() {
        String::new()
    } else {
        unsafe { CStr::from_ptr(z_name) }.to_string_lossy().into_owned()
    }
}

fn c_string(value: &str) -> Result<CString> {
    CString::new(value).map_err(|e| VfsError::InvalidName(e.to_string()))
}

/// Builds the name layout SQLite passes to `xOpen`, which VFSes may probe for
/// URI parameters.
fn engine_filename(name: &str) -> Result<*const c_char> {
    let name = c_string(name)?;
    let empty = b"\0".as_ptr() as *const c_char;
    let filename =
        unsafe { ffi::sqlite3_create_filename(name.as_ptr(), empty, empty, 0, ptr::null_mut()) };
    if filename.is_null() {
        Err(VfsError::NoMem)
    } else {
        Ok(filename)
    }
}

fn native_offset(op: &'static str, offset: u64) -> Result<ffi::sqlite3_int64> {
    ffi::sqlite3_int64::try_from(offset)
        .map_err(|_| VfsError::protocol(op, format!("offset {} is too large", offset)))
}

fn zeroed_buffer(size: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(size).map_err(|_| VfsError::NoMem)?;
    buf.resize(size, 0);
    Ok(buf)
}

/// Text up to the first NUL, rejecting anything that is not UTF-8.
fn strict_text(buf: &[u8]) -> Option<String> {
    let text = CStr::from_bytes_until_nul(buf).ok()?;
    text.to_str().ok().map(str::to_string)
}

/// Text up to the first NUL (or the whole buffer); `None` when empty.
fn lossy_text(buf: &[u8]) -> Option<String> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    if end == 0 {
        None
    } else {
        Some(String::from_utf8_lossy(&buf[..end]).into_owned())
    }
}
