//! SQLite file I/O trampolines
//!
//! Implements sqlite3_io_methods on top of the [`VfsFile`] returned by
//! [`Vfs::open`](super::Vfs::open).

use super::frame::Frame;
use super::hook::{self, Failure};
use super::vfs::Descriptor;
use super::{LockLevel, SyncFlags, VfsFile, DEFAULT_SECTOR_SIZE, SUPPORTED_VERSION};
use crate::error::{Result, VfsError};
use libsqlite3_sys as ffi;
use std::os::raw::{c_int, c_void};
use std::ptr;
use std::slice;
use std::sync::Arc;

/// Engine-allocated file record
///
/// SQLite allocates `szOsFile` bytes and hands them to `xOpen`; the adapter
/// fills them with this struct. `state` is `Some` exactly while the file is
/// open.
#[repr(C)]
pub(crate) struct FileHandle {
    /// Base sqlite3_file structure (MUST be first field)
    base: ffi::sqlite3_file,
    state: Option<Box<OpenFile>>,
}

struct OpenFile {
    file: Box<dyn VfsFile>,
    name: String,
    /// Keeps the descriptor alive while the file is open
    _vfs: Arc<Descriptor>,
}

static FILE_METHODS: ffi::sqlite3_io_methods = ffi::sqlite3_io_methods {
    iVersion: SUPPORTED_VERSION,
    xClose: Some(x_close),
    xRead: Some(x_read),
    xWrite: Some(x_write),
    xTruncate: Some(x_truncate),
    xSync: Some(x_sync),
    xFileSize: Some(x_file_size),
    xLock: Some(x_lock),
    xUnlock: Some(x_unlock),
    xCheckReservedLock: Some(x_check_reserved_lock),
    xFileControl: Some(x_file_control),
    xSectorSize: Some(x_sector_size),
    xDeviceCharacteristics: Some(x_device_characteristics),
    xShmMap: None,
    xShmLock: None,
    xShmBarrier: None,
    xShmUnmap: None,
    xFetch: None,
    xUnfetch: None,
};

/// Fills an engine-allocated handle after a successful open.
pub(crate) unsafe fn install(
    file: *mut ffi::sqlite3_file,
    opened: Box<dyn VfsFile>,
    name: String,
    vfs: Arc<Descriptor>,
) {
    (file as *mut FileHandle).write(FileHandle {
        base: ffi::sqlite3_file {
            pMethods: &FILE_METHODS,
        },
        state: Some(Box::new(OpenFile {
            file: opened,
            name,
            _vfs: vfs,
        })),
    });
}

fn loud(_: &VfsError) -> Option<c_int> {
    None
}

/// Runs one file method inside a frame.
///
/// `quiet` picks out expected failures: they return the code it gives
/// without being reported. Everything else is reported through the file's
/// excepthook. A closed handle fails with [`VfsError::FileClosed`].
unsafe fn dispatch<T>(
    file: *mut ffi::sqlite3_file,
    op: &'static str,
    quiet: impl Fn(&VfsError) -> Option<c_int>,
    describe: impl FnOnce(Failure) -> Failure,
    call: impl FnOnce(&mut dyn VfsFile) -> Result<T>,
) -> std::result::Result<T, c_int> {
    let handle = &mut *(file as *mut FileHandle);
    let Some(open) = handle.state.as_mut() else {
        let failure = describe(Failure::new(op, VfsError::FileClosed));
        let code = failure.code();
        hook::report(&failure);
        return Err(code);
    };

    let frame = Frame::enter(op);
    let result = frame.run(|| call(open.file.as_mut()));
    let outcome = result.map_err(|err| match quiet(&err) {
        Some(code) => code,
        None => frame.fail(describe(Failure::new(op, err)).with("file", &open.name)),
    });
    frame.leave(|f| open.file.excepthook(f));
    outcome
}

fn offset_arg(op: &'static str, offset: ffi::sqlite3_int64) -> Result<u64> {
    u64::try_from(offset).map_err(|_| VfsError::protocol(op, format!("negative offset {}", offset)))
}

// File I/O method implementations

unsafe extern "C" fn x_close(file: *mut ffi::sqlite3_file) -> c_int {
    let handle = &mut *(file as *mut FileHandle);
    // Released whatever close reports; a second close has nothing to do.
    let Some(mut open) = handle.state.take() else {
        return ffi::SQLITE_OK;
    };

    let frame = Frame::enter("xClose");
    let rc = match frame.run(|| open.file.close()) {
        Ok(()) => ffi::SQLITE_OK,
        Err(err) => frame.fail(Failure::new("xClose", err).with("file", &open.name)),
    };
    frame.leave(|f| open.file.excepthook(f));

    handle.base.pMethods = ptr::null();
    drop(open);
    rc
}

unsafe extern "C" fn x_read(
    file: *mut ffi::sqlite3_file,
    buf: *mut c_void,
    amt: c_int,
    offset: ffi::sqlite3_int64,
) -> c_int {
    let amount = usize::try_from(amt).unwrap_or(0);

    let result = dispatch(
        file,
        "xRead",
        loud,
        |f| f.with("amount", amt).with("offset", offset),
        |file| {
            let data = file.read(amount, offset_arg("xRead", offset)?)?;
            if data.len() > amount {
                return Err(VfsError::protocol(
                    "xRead",
                    format!("returned {} bytes when {} were requested", data.len(), amount),
                ));
            }
            Ok(data)
        },
    );

    match result {
        Ok(data) => {
            if amount == 0 {
                return ffi::SQLITE_OK;
            }
            let out = slice::from_raw_parts_mut(buf as *mut u8, amount);
            out[..data.len()].copy_from_slice(&data);
            if data.len() < amount {
                // SQLite relies on the unread tail being zeroed
                out[data.len()..].fill(0);
                ffi::SQLITE_IOERR_SHORT_READ
            } else {
                ffi::SQLITE_OK
            }
        }
        Err(rc) => rc,
    }
}

unsafe extern "C" fn x_write(
    file: *mut ffi::sqlite3_file,
    buf: *const c_void,
    amt: c_int,
    offset: ffi::sqlite3_int64,
) -> c_int {
    let data: &[u8] = match usize::try_from(amt) {
        Ok(len) if len > 0 && !buf.is_null() => slice::from_raw_parts(buf as *const u8, len),
        _ => &[],
    };

    dispatch(
        file,
        "xWrite",
        loud,
        |f| f.with("amount", amt).with("offset", offset),
        |file| file.write(data, offset_arg("xWrite", offset)?),
    )
    .err()
    .unwrap_or(ffi::SQLITE_OK)
}

unsafe extern "C" fn x_truncate(file: *mut ffi::sqlite3_file, size: ffi::sqlite3_int64) -> c_int {
    dispatch(
        file,
        "xTruncate",
        loud,
        |f| f.with("size", size),
        |file| file.truncate(offset_arg("xTruncate", size)?),
    )
    .err()
    .unwrap_or(ffi::SQLITE_OK)
}

unsafe extern "C" fn x_sync(file: *mut ffi::sqlite3_file, flags: c_int) -> c_int {
    dispatch(
        file,
        "xSync",
        loud,
        |f| f.with("flags", flags),
        |file| file.sync(SyncFlags::from_raw(flags)),
    )
    .err()
    .unwrap_or(ffi::SQLITE_OK)
}

unsafe extern "C" fn x_file_size(
    file: *mut ffi::sqlite3_file,
    p_size: *mut ffi::sqlite3_int64,
) -> c_int {
    let result = dispatch(file, "xFileSize", loud, |f| f, |file| {
        let size = file.file_size()?;
        ffi::sqlite3_int64::try_from(size)
            .map_err(|_| VfsError::protocol("xFileSize", format!("size {} is too large", size)))
    });

    match result {
        Ok(size) => {
            *p_size = size;
            ffi::SQLITE_OK
        }
        Err(rc) => rc,
    }
}

unsafe extern "C" fn x_lock(file: *mut ffi::sqlite3_file, level: c_int) -> c_int {
    dispatch(
        file,
        "xLock",
        // Busy is how SQLite's lock protocol asks for a retry
        |err| err.is_busy().then(|| err.code()),
        |f| f.with("level", level),
        |file| file.lock(lock_arg("xLock", level)?),
    )
    .err()
    .unwrap_or(ffi::SQLITE_OK)
}

unsafe extern "C" fn x_unlock(file: *mut ffi::sqlite3_file, level: c_int) -> c_int {
    dispatch(
        file,
        "xUnlock",
        loud,
        |f| f.with("level", level),
        |file| file.unlock(lock_arg("xUnlock", level)?),
    )
    .err()
    .unwrap_or(ffi::SQLITE_OK)
}

fn lock_arg(op: &'static str, level: c_int) -> Result<LockLevel> {
    LockLevel::from_raw(level)
        .ok_or_else(|| VfsError::protocol(op, format!("unknown lock level {}", level)))
}

unsafe extern "C" fn x_check_reserved_lock(
    file: *mut ffi::sqlite3_file,
    p_res_out: *mut c_int,
) -> c_int {
    match dispatch(file, "xCheckReservedLock", loud, |f| f, |file| file.check_reserved_lock()) {
        Ok(reserved) => {
            *p_res_out = reserved as c_int;
            ffi::SQLITE_OK
        }
        Err(rc) => {
            *p_res_out = 0;
            rc
        }
    }
}

unsafe extern "C" fn x_file_control(
    file: *mut ffi::sqlite3_file,
    op: c_int,
    p_arg: *mut c_void,
) -> c_int {
    dispatch(
        file,
        "xFileControl",
        // SQLite probes opcodes it does not expect every VFS to know
        |err| {
            (err.is_not_implemented() || err.primary_code() == ffi::SQLITE_NOTFOUND)
                .then_some(ffi::SQLITE_NOTFOUND)
        },
        |f| f.with("op", op),
        |file| file.file_control(op, p_arg),
    )
    .err()
    .unwrap_or(ffi::SQLITE_OK)
}

unsafe extern "C" fn x_sector_size(file: *mut ffi::sqlite3_file) -> c_int {
    let default = DEFAULT_SECTOR_SIZE as c_int;
    dispatch(
        file,
        "xSectorSize",
        |err| err.is_not_implemented().then_some(default),
        |f| f,
        |file| {
            let size = file.sector_size()?;
            c_int::try_from(size)
                .map_err(|_| VfsError::protocol("xSectorSize", format!("{} is too large", size)))
        },
    )
    .unwrap_or(default)
}

unsafe extern "C" fn x_device_characteristics(file: *mut ffi::sqlite3_file) -> c_int {
    dispatch(
        file,
        "xDeviceCharacteristics",
        |err| err.is_not_implemented().then_some(0),
        |f| f,
        |file| file.device_characteristics(),
    )
    .unwrap_or(0)
}
