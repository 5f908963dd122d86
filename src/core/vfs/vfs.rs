//! VFS descriptor, registration and the VFS-level trampolines
//!
//! Builds the `sqlite3_vfs` record SQLite sees, registers it, and forwards
//! every VFS callback to the [`Vfs`] trait object behind `pAppData`.

use super::file::{self, FileHandle};
use super::frame::Frame;
use super::hook::{self, Failure};
use super::{AccessKind, BaseVfs, DlHandle, OpenFlags, Vfs, SUPPORTED_VERSION};
use crate::config::VfsConfig;
use crate::error::{Result, VfsError};
use libsqlite3_sys as ffi;
use std::cell::UnsafeCell;
use std::ffi::{CStr, CString};
use std::fmt;
use std::mem;
use std::os::raw::{c_char, c_int, c_void};
use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

/// `mxPathname` used when neither the registration nor a base says otherwise
pub const DEFAULT_MAX_PATHNAME: u32 = 1024;

type DlSymFn = unsafe extern "C" fn(*mut ffi::sqlite3_vfs, *mut c_void, *const c_char);

/// Engine-visible VFS record plus the implementation it dispatches to.
///
/// `pAppData` points back at this struct inside its `Arc`. The entry point
/// table is filled once in [`VfsRegistration::register`] and never touched
/// again except by SQLite linking it into its registry.
pub(crate) struct Descriptor {
    raw: UnsafeCell<ffi::sqlite3_vfs>,
    name: CString,
    registered: AtomicBool,
    pub(crate) vfs: Box<dyn Vfs>,
}

// SQLite serializes registry mutations; the rest of `raw` is read-only.
unsafe impl Send for Descriptor {}
unsafe impl Sync for Descriptor {}

impl Descriptor {
    pub(crate) fn as_raw(&self) -> *mut ffi::sqlite3_vfs {
        self.raw.get()
    }

    pub(crate) fn as_non_null(&self) -> NonNull<ffi::sqlite3_vfs> {
        // UnsafeCell::get never returns null
        unsafe { NonNull::new_unchecked(self.raw.get()) }
    }

    pub(crate) fn name(&self) -> &str {
        self.name.to_str().unwrap_or_default()
    }

    fn max_pathname(&self) -> u32 {
        let raw = unsafe { &*self.raw.get() };
        u32::try_from(raw.mxPathname).unwrap_or(0)
    }

    /// True if `vfs` was built by this adapter.
    pub(crate) unsafe fn is_adapter(vfs: *mut ffi::sqlite3_vfs) -> bool {
        match vfs.as_ref() {
            Some(vfs) => vfs.xAccess.map(|f| f as usize) == Some(x_access as usize),
            None => false,
        }
    }

    unsafe fn from_raw<'a>(vfs: *mut ffi::sqlite3_vfs) -> Option<&'a Descriptor> {
        let vfs = vfs.as_ref()?;
        (vfs.pAppData as *const Descriptor).as_ref()
    }

    /// Takes a strong reference to the descriptor behind an adapter-built VFS.
    pub(crate) unsafe fn retain(vfs: *mut ffi::sqlite3_vfs) -> Option<Arc<Descriptor>> {
        let ptr = vfs.as_ref()?.pAppData as *const Descriptor;
        if ptr.is_null() {
            return None;
        }
        Arc::increment_strong_count(ptr);
        Some(Arc::from_raw(ptr))
    }

    fn unregister(&self) -> Result<()> {
        if !self.registered.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        // SQLite drops the registry entry whatever the status says.
        let rc = unsafe { ffi::sqlite3_vfs_unregister(self.as_raw()) };
        let rc = fault_inject!(UnregisterFails, rc, ffi::SQLITE_IOERR);
        debug!("Unregistered VFS {}", self.name());

        if rc != ffi::SQLITE_OK {
            return Err(VfsError::from_code(rc));
        }
        Ok(())
    }

    fn report_unregister_failure(&self, err: VfsError) {
        let failure = Failure::new("unregister", err).with("name", self.name());
        hook::deliver(&failure, |f| self.vfs.excepthook(f));
    }
}

impl Drop for Descriptor {
    fn drop(&mut self) {
        if let Err(err) = self.unregister() {
            self.report_unregister_failure(err);
        }
        // Anything still holding the raw pointer now sees a null pAppData.
        unsafe { ptr::write_bytes(self.raw.get(), 0, 1) };
    }
}

/// Builder for registering a [`Vfs`] with SQLite.
///
/// # Examples
///
/// ```rust,no_run
/// use layervfs::{MemoryVfs, VfsRegistration};
///
/// # fn main() -> layervfs::Result<()> {
/// let vfs = VfsRegistration::new("memdb")
///     .max_pathname(512)
///     .register(MemoryVfs::new())?;
///
/// let conn = vfs.open_connection("app.db")?;
/// conn.execute_batch("CREATE TABLE t (x INTEGER)")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct VfsRegistration {
    name: String,
    base: Option<String>,
    make_default: bool,
    max_pathname: Option<u32>,
}

impl VfsRegistration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base: None,
            make_default: false,
            max_pathname: None,
        }
    }

    /// Registration settings from a validated [`VfsConfig`].
    ///
    /// A configured `base` becomes an [`expect_base`](Self::expect_base)
    /// requirement; build the implementation over
    /// [`VfsConfig::resolve_base`] to meet it.
    ///
    /// # Errors
    ///
    /// Returns [`VfsError::Config`] if the configuration is invalid.
    pub fn from_config(config: &VfsConfig) -> Result<Self> {
        config.validate_config()?;
        Ok(Self {
            name: config.name.clone(),
            base: config.base.clone(),
            make_default: config.make_default,
            max_pathname: config.max_pathname,
        })
    }

    /// Requires the implementation to inherit from the VFS registered as
    /// `base` (`""` for the default). Checked by [`register`](Self::register).
    pub fn expect_base(mut self, base: impl Into<String>) -> Self {
        self.base = Some(base.into());
        self
    }

    /// Makes the VFS SQLite's fallback when no VFS name is given.
    pub fn make_default(mut self, make_default: bool) -> Self {
        self.make_default = make_default;
        self
    }

    /// Longest path name the VFS accepts, in bytes.
    ///
    /// Defaults to the base's value when the implementation has a base and
    /// to [`DEFAULT_MAX_PATHNAME`] otherwise.
    pub fn max_pathname(mut self, len: u32) -> Self {
        self.max_pathname = Some(len);
        self
    }

    /// Builds the descriptor and registers it.
    ///
    /// A VFS already registered under the same name is unregistered first.
    ///
    /// # Errors
    ///
    /// - [`VfsError::InvalidName`] for an empty name or one containing NUL
    /// - [`VfsError::Config`] if an expected base was set and the
    ///   implementation does not inherit from it
    /// - [`VfsError::Registration`] if SQLite refuses the registration
    pub fn register<V: Vfs>(self, vfs: V) -> Result<RegisteredVfs> {
        if self.name.is_empty() {
            return Err(VfsError::InvalidName(String::from("name must not be empty")));
        }
        if let Some(expected) = &self.base {
            check_base(&self.name, expected, vfs.base())?;
        }
        let name = CString::new(self.name.as_str())
            .map_err(|e| VfsError::InvalidName(e.to_string()))?;

        let max_pathname = self
            .max_pathname
            .or_else(|| vfs.base().map(BaseVfs::max_pathname))
            .unwrap_or(DEFAULT_MAX_PATHNAME);
        let max_pathname = c_int::try_from(max_pathname)
            .map_err(|_| VfsError::Config(format!("max_pathname {} is too large", max_pathname)))?;

        let descriptor = Arc::new_cyclic(move |storage: &Weak<Descriptor>| Descriptor {
            raw: UnsafeCell::new(ffi::sqlite3_vfs {
                iVersion: SUPPORTED_VERSION,
                szOsFile: mem::size_of::<FileHandle>() as c_int,
                mxPathname: max_pathname,
                pNext: ptr::null_mut(),
                zName: name.as_ptr(),
                pAppData: storage.as_ptr() as *mut c_void,
                xOpen: Some(x_open),
                xDelete: Some(x_delete),
                xAccess: Some(x_access),
                xFullPathname: Some(x_full_pathname),
                xDlOpen: Some(x_dl_open),
                xDlError: Some(x_dl_error),
                xDlSym: Some(x_dl_sym),
                xDlClose: Some(x_dl_close),
                xRandomness: Some(x_randomness),
                xSleep: Some(x_sleep),
                xCurrentTime: Some(x_current_time),
                xGetLastError: Some(x_get_last_error),
                // Version 2 and 3 entries
                xCurrentTimeInt64: None,
                xSetSystemCall: None,
                xGetSystemCall: None,
                xNextSystemCall: None,
            }),
            name,
            registered: AtomicBool::new(false),
            vfs: Box::new(vfs),
        });

        displace_existing(&descriptor.name);

        let rc = fault_inject!(
            RegistrationFails,
            unsafe { ffi::sqlite3_vfs_register(descriptor.as_raw(), self.make_default as c_int) },
            ffi::SQLITE_NOMEM
        );
        if rc != ffi::SQLITE_OK {
            return Err(VfsError::Registration(rc));
        }
        descriptor.registered.store(true, Ordering::Release);

        debug!(
            "Registered VFS {} (default: {}, mxPathname: {})",
            self.name, self.make_default, max_pathname
        );
        Ok(RegisteredVfs { descriptor })
    }
}

fn check_base(name: &str, expected: &str, actual: Option<&BaseVfs>) -> Result<()> {
    let expected = super::resolve_name(expected)?;
    match actual {
        Some(base) if base.name() == expected => Ok(()),
        Some(base) => Err(VfsError::Config(format!(
            "VFS {} is configured over {} but inherits from {}",
            name,
            expected,
            base.name()
        ))),
        None => Err(VfsError::Config(format!(
            "VFS {} is configured over {} but has no base",
            name, expected
        ))),
    }
}

/// Removes every registry entry called `name` so the new one replaces it.
fn displace_existing(name: &CStr) {
    loop {
        let existing = unsafe { ffi::sqlite3_vfs_find(name.as_ptr()) };
        if existing.is_null() {
            return;
        }

        unsafe {
            let previous = if Descriptor::is_adapter(existing) {
                Descriptor::from_raw(existing)
            } else {
                None
            };
            match previous {
                Some(previous) => {
                    previous.registered.store(false, Ordering::Release);
                    debug!("Replacing VFS {}", previous.name());
                }
                None => warn!("Replacing foreign VFS {}", name.to_string_lossy()),
            }
            ffi::sqlite3_vfs_unregister(existing);
        }
    }
}

/// A VFS registered with SQLite.
///
/// Dropping the guard unregisters the VFS. The descriptor stays alive while
/// files opened through it remain open.
pub struct RegisteredVfs {
    descriptor: Arc<Descriptor>,
}

impl RegisteredVfs {
    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    pub fn max_pathname(&self) -> u32 {
        self.descriptor.max_pathname()
    }

    pub fn is_registered(&self) -> bool {
        self.descriptor.registered.load(Ordering::Acquire)
    }

    /// Removes the VFS from SQLite's registry. Safe to call repeatedly.
    ///
    /// # Errors
    ///
    /// Returns the unexpected status SQLite reported on the call that
    /// actually unregistered. The VFS counts as unregistered either way.
    pub fn unregister(&self) -> Result<()> {
        self.descriptor.unregister()
    }

    /// A base over this VFS, for building derived VFSes without a name lookup.
    pub fn as_base(&self) -> BaseVfs {
        BaseVfs::from_descriptor(Arc::clone(&self.descriptor))
    }

    /// Opens a connection through this VFS with rusqlite's default flags.
    pub fn open_connection<P: AsRef<Path>>(&self, path: P) -> Result<rusqlite::Connection> {
        let conn = rusqlite::Connection::open_with_flags_and_vfs(
            path,
            rusqlite::OpenFlags::default(),
            self.name(),
        )?;
        Ok(conn)
    }
}

impl fmt::Debug for RegisteredVfs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredVfs")
            .field("name", &self.name())
            .field("max_pathname", &self.max_pathname())
            .field("registered", &self.is_registered())
            .finish()
    }
}

impl Drop for RegisteredVfs {
    fn drop(&mut self) {
        if let Err(err) = self.descriptor.unregister() {
            self.descriptor.report_unregister_failure(err);
        }
    }
}

// Argument helpers

unsafe fn path_arg<'a>(op: &'static str, name: *const c_char) -> Result<&'a str> {
    if name.is_null() {
        return Err(VfsError::protocol(op, "file name is null"));
    }
    CStr::from_ptr(name)
        .to_str()
        .map_err(|e| VfsError::protocol(op, format!("file name is not UTF-8: {}", e)))
}

pub(crate) unsafe fn lossy(name: *const c_char) -> String {
    if name.is_null() {
        String::from("<null>")
    } else {
        CStr::from_ptr(name).to_string_lossy().into_owned()
    }
}

/// Copies `message` into a C buffer of `n_byte` bytes, always terminated.
/// Returns true if it had to be truncated.
pub(crate) unsafe fn copy_message(message: &str, n_byte: c_int, out: *mut c_char) -> bool {
    let capacity = match usize::try_from(n_byte) {
        Ok(n) if n > 0 && !out.is_null() => n - 1,
        _ => return !message.is_empty(),
    };
    let len = message.len().min(capacity);
    ptr::copy_nonoverlapping(message.as_ptr(), out as *mut u8, len);
    *out.add(len) = 0;
    len < message.len()
}

/// Runs one VFS method inside a frame.
///
/// A failure is decorated by `describe`, reported through the VFS's
/// excepthook and comes back as its status code.
fn dispatch<T>(
    descriptor: &Descriptor,
    op: &'static str,
    describe: impl FnOnce(Failure) -> Failure,
    call: impl FnOnce(&dyn Vfs) -> Result<T>,
) -> std::result::Result<T, c_int> {
    let frame = Frame::enter(op);
    let result = frame.run(|| call(descriptor.vfs.as_ref()));
    let outcome = result.map_err(|err| frame.fail(describe(Failure::new(op, err))));
    frame.leave(|f| descriptor.vfs.excepthook(f));
    outcome
}

// VFS callback functions

unsafe extern "C" fn x_open(
    vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    file: *mut ffi::sqlite3_file,
    flags: c_int,
    p_out_flags: *mut c_int,
) -> c_int {
    // SQLite only calls xClose on a handle whose methods are set.
    (*file).pMethods = ptr::null();

    let Some(descriptor) = Descriptor::retain(vfs) else {
        return ffi::SQLITE_CANTOPEN;
    };

    let mut open_flags = OpenFlags {
        input: flags,
        output: if p_out_flags.is_null() { 0 } else { *p_out_flags },
    };
    let label = if z_name.is_null() {
        String::from("<temp>")
    } else {
        lossy(z_name)
    };

    let result = dispatch(
        &descriptor,
        "xOpen",
        |f| f.with("zName", &label).with("inflags", flags),
        |vfs| {
            let name = if z_name.is_null() {
                None
            } else {
                Some(path_arg("xOpen", z_name)?)
            };
            vfs.open(name, &mut open_flags)
        },
    );

    match result {
        Ok(opened) => {
            if !p_out_flags.is_null() {
                *p_out_flags = open_flags.output;
            }
            debug!("Opened {} through VFS {}", label, descriptor.name());
            file::install(file, opened, label, Arc::clone(&descriptor));
            ffi::SQLITE_OK
        }
        Err(rc) => rc,
    }
}

unsafe extern "C" fn x_delete(
    vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    sync_dir: c_int,
) -> c_int {
    let Some(descriptor) = Descriptor::from_raw(vfs) else {
        return ffi::SQLITE_IOERR_DELETE;
    };

    let result = dispatch(
        descriptor,
        "xDelete",
        |f| f.with("zName", lossy(z_name)).with("syncDir", sync_dir),
        |vfs| vfs.delete(path_arg("xDelete", z_name)?, sync_dir != 0),
    );
    result.err().unwrap_or(ffi::SQLITE_OK)
}

pub(crate) unsafe extern "C" fn x_access(
    vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    flags: c_int,
    p_res_out: *mut c_int,
) -> c_int {
    let Some(descriptor) = Descriptor::from_raw(vfs) else {
        if !p_res_out.is_null() {
            *p_res_out = 0;
        }
        return ffi::SQLITE_IOERR_ACCESS;
    };

    let result = dispatch(
        descriptor,
        "xAccess",
        |f| f.with("zName", lossy(z_name)).with("flags", flags),
        |vfs| {
            let kind = AccessKind::from_raw(flags).ok_or_else(|| {
                VfsError::protocol("xAccess", format!("unknown access flags {}", flags))
            })?;
            vfs.access(path_arg("xAccess", z_name)?, kind)
        },
    );

    match result {
        Ok(exists) => {
            *p_res_out = exists as c_int;
            ffi::SQLITE_OK
        }
        Err(rc) => {
            *p_res_out = 0;
            rc
        }
    }
}

unsafe extern "C" fn x_full_pathname(
    vfs: *mut ffi::sqlite3_vfs,
    z_name: *const c_char,
    n_out: c_int,
    z_out: *mut c_char,
) -> c_int {
    let Some(descriptor) = Descriptor::from_raw(vfs) else {
        return ffi::SQLITE_CANTOPEN;
    };

    let result = dispatch(
        descriptor,
        "xFullPathname",
        |f| f.with("zName", lossy(z_name)).with("nOut", n_out),
        |vfs| {
            let full = vfs.full_pathname(path_arg("xFullPathname", z_name)?)?;
            let bytes = full.as_bytes();
            if bytes.contains(&0) {
                return Err(VfsError::protocol("xFullPathname", "result contains a NUL byte"));
            }
            // nOut already counts the terminator
            if bytes.len() + 1 > usize::try_from(n_out).unwrap_or(0) {
                return Err(VfsError::from_code(ffi::SQLITE_TOOBIG));
            }
            ptr::copy_nonoverlapping(bytes.as_ptr(), z_out as *mut u8, bytes.len());
            *z_out.add(bytes.len()) = 0;
            Ok(())
        },
    );
    result.err().unwrap_or(ffi::SQLITE_OK)
}

unsafe extern "C" fn x_dl_open(
    vfs: *mut ffi::sqlite3_vfs,
    z_filename: *const c_char,
) -> *mut c_void {
    let Some(descriptor) = Descriptor::from_raw(vfs) else {
        return ptr::null_mut();
    };

    dispatch(
        descriptor,
        "xDlOpen",
        |f| f.with("zName", lossy(z_filename)),
        |vfs| vfs.dl_open(path_arg("xDlOpen", z_filename)?),
    )
    .map_or(ptr::null_mut(), |handle| handle.0)
}

unsafe extern "C" fn x_dl_error(vfs: *mut ffi::sqlite3_vfs, n_byte: c_int, z_err_msg: *mut c_char) {
    let Some(descriptor) = Descriptor::from_raw(vfs) else {
        return;
    };

    let _ = dispatch(
        descriptor,
        "xDlError",
        |f| f.with("nByte", n_byte),
        |vfs| {
            // Nothing to say leaves SQLite's own message in place.
            if let Some(message) = vfs.dl_error()? {
                copy_message(&message, n_byte, z_err_msg);
            }
            Ok(())
        },
    );
}

unsafe extern "C" fn x_dl_sym(
    vfs: *mut ffi::sqlite3_vfs,
    handle: *mut c_void,
    z_symbol: *const c_char,
) -> Option<DlSymFn> {
    let descriptor = Descriptor::from_raw(vfs)?;

    let symbol = dispatch(
        descriptor,
        "xDlSym",
        |f| f.with("zName", lossy(z_symbol)),
        |vfs| {
            let symbol = CStr::from_ptr(z_symbol).to_str().map_err(|e| {
                VfsError::protocol("xDlSym", format!("symbol is not UTF-8: {}", e))
            })?;
            vfs.dl_sym(DlHandle(handle), symbol)
        },
    )
    .ok()?;

    if symbol.is_null() {
        None
    } else {
        Some(mem::transmute::<*mut c_void, DlSymFn>(symbol.0))
    }
}

unsafe extern "C" fn x_dl_close(vfs: *mut ffi::sqlite3_vfs, handle: *mut c_void) {
    let Some(descriptor) = Descriptor::from_raw(vfs) else {
        return;
    };

    let _ = dispatch(
        descriptor,
        "xDlClose",
        |f| f.with("handle", format!("{:p}", handle)),
        |vfs| vfs.dl_close(DlHandle(handle)),
    );
}

unsafe extern "C" fn x_randomness(
    vfs: *mut ffi::sqlite3_vfs,
    n_byte: c_int,
    z_out: *mut c_char,
) -> c_int {
    let Some(descriptor) = Descriptor::from_raw(vfs) else {
        return 0;
    };
    let amount = usize::try_from(n_byte).unwrap_or(0);

    dispatch(
        descriptor,
        "xRandomness",
        |f| f.with("nByte", n_byte),
        |vfs| {
            let bytes = vfs.randomness(amount)?;
            let len = bytes.len().min(amount);
            ptr::copy_nonoverlapping(bytes.as_ptr(), z_out as *mut u8, len);
            Ok(len as c_int)
        },
    )
    .unwrap_or(0)
}

unsafe extern "C" fn x_sleep(vfs: *mut ffi::sqlite3_vfs, microseconds: c_int) -> c_int {
    let Some(descriptor) = Descriptor::from_raw(vfs) else {
        return 0;
    };
    let requested = Duration::from_micros(u64::try_from(microseconds).unwrap_or(0));

    dispatch(
        descriptor,
        "xSleep",
        |f| f.with("microseconds", microseconds),
        |vfs| {
            let slept = vfs.sleep(requested)?;
            c_int::try_from(slept.as_micros())
                .map_err(|_| VfsError::protocol("xSleep", "Result is too big for integer"))
        },
    )
    .unwrap_or(0)
}

unsafe extern "C" fn x_current_time(vfs: *mut ffi::sqlite3_vfs, p_time_out: *mut f64) -> c_int {
    let Some(descriptor) = Descriptor::from_raw(vfs) else {
        return 1;
    };

    let result = dispatch(
        descriptor,
        "xCurrentTime",
        |f| f,
        |vfs| {
            let now = vfs.current_time()?;
            if !now.is_finite() {
                return Err(VfsError::protocol("xCurrentTime", format!("{} is not a time", now)));
            }
            Ok(now)
        },
    );

    // Only 0 and 1 mean anything to SQLite here.
    match result {
        Ok(now) => {
            *p_time_out = now;
            0
        }
        Err(_) => 1,
    }
}

unsafe extern "C" fn x_get_last_error(
    vfs: *mut ffi::sqlite3_vfs,
    n_byte: c_int,
    z_err_msg: *mut c_char,
) -> c_int {
    let Some(descriptor) = Descriptor::from_raw(vfs) else {
        return 0;
    };

    dispatch(
        descriptor,
        "xGetLastError",
        |f| f.with("nByte", n_byte),
        |vfs| match vfs.get_last_error()? {
            Some(message) => Ok(copy_message(&message, n_byte, z_err_msg) as c_int),
            None => {
                copy_message("", n_byte, z_err_msg);
                Ok(0)
            }
        },
    )
    .unwrap_or(0)
}
