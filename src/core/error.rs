use libsqlite3_sys as ffi;
use std::ffi::CStr;
use std::io::ErrorKind;
use std::os::raw::c_int;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VfsError {
    #[error("{} {method} is not implemented", method_label(.file))]
    NotImplemented { method: &'static str, file: bool },

    #[error("Attempting operation on closed file")]
    FileClosed,

    #[error("SQLite error {code}: {message}")]
    Sqlite { code: c_int, message: String },

    #[error("{op}: {detail}")]
    Protocol { op: &'static str, detail: String },

    #[error("Base vfs named \"{0}\" not found")]
    BaseNotFound(String),

    #[error("Base vfs implements version {found} of the vfs interface, but only version {supported} is supported")]
    BaseVersion { found: c_int, supported: c_int },

    #[error("Invalid VFS name: {0}")]
    InvalidName(String),

    #[error("VFS registration failed: {0}")]
    Registration(c_int),

    #[error("Out of memory")]
    NoMem,

    #[error("Panic in {op}: {message}")]
    Panic { op: &'static str, message: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] rusqlite::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, VfsError>;

impl VfsError {
    pub fn not_implemented(method: &'static str) -> Self {
        VfsError::NotImplemented {
            method,
            file: false,
        }
    }

    pub fn file_not_implemented(method: &'static str) -> Self {
        VfsError::NotImplemented { method, file: true }
    }

    pub fn protocol(op: &'static str, detail: impl Into<String>) -> Self {
        VfsError::Protocol {
            op,
            detail: detail.into(),
        }
    }

    /// Builds the host-side error for an engine status code.
    ///
    /// The message comes from `sqlite3_errstr`, which understands extended
    /// codes as well as primary ones.
    pub fn from_code(code: c_int) -> Self {
        let message = unsafe {
            let ptr = ffi::sqlite3_errstr(code);
            if ptr.is_null() {
                String::from("unknown error")
            } else {
                CStr::from_ptr(ptr).to_string_lossy().into_owned()
            }
        };
        VfsError::Sqlite { code, message }
    }

    /// Translates to the closest engine status code.
    ///
    /// Errors with no better match become `SQLITE_ERROR`.
    pub fn code(&self) -> c_int {
        match self {
            VfsError::Sqlite { code, .. } => *code,
            VfsError::FileClosed => ffi::SQLITE_IOERR,
            VfsError::Registration(rc) => *rc,
            VfsError::NoMem => ffi::SQLITE_NOMEM,
            VfsError::Io(err) => io_code(err.kind()),
            VfsError::Connection(rusqlite::Error::SqliteFailure(err, _)) => err.extended_code,
            VfsError::Other(err) => err
                .chain()
                .find_map(|cause| {
                    if let Some(inner) = cause.downcast_ref::<VfsError>() {
                        Some(inner.code())
                    } else {
                        cause
                            .downcast_ref::<std::io::Error>()
                            .map(|io| io_code(io.kind()))
                    }
                })
                .unwrap_or(ffi::SQLITE_ERROR),
            _ => ffi::SQLITE_ERROR,
        }
    }

    /// Primary code, with the extended bits masked off.
    pub fn primary_code(&self) -> c_int {
        self.code() & 0xff
    }

    /// Busy is part of the normal locking protocol and never reported.
    pub fn is_busy(&self) -> bool {
        self.primary_code() == ffi::SQLITE_BUSY
    }

    pub fn is_not_implemented(&self) -> bool {
        matches!(self, VfsError::NotImplemented { .. })
    }
}

fn method_label(file: &bool) -> &'static str {
    if *file {
        "File method"
    } else {
        "Method"
    }
}

fn io_code(kind: ErrorKind) -> c_int {
    match kind {
        ErrorKind::NotFound => ffi::SQLITE_CANTOPEN,
        ErrorKind::PermissionDenied => ffi::SQLITE_PERM,
        ErrorKind::OutOfMemory => ffi::SQLITE_NOMEM,
        ErrorKind::WouldBlock => ffi::SQLITE_BUSY,
        _ => ffi::SQLITE_IOERR,
    }
}

/// Converts a native status code into a `Result`.
pub fn check(rc: c_int) -> Result<()> {
    if rc == ffi::SQLITE_OK {
        Ok(())
    } else {
        Err(VfsError::from_code(rc))
    }
}

impl From<validator::ValidationErrors> for VfsError {
    fn from(errors: validator::ValidationErrors) -> Self {
        VfsError::Config(errors.to_string())
    }
}

impl From<toml::de::Error> for VfsError {
    fn from(err: toml::de::Error) -> Self {
        VfsError::Config(err.to_string())
    }
}
