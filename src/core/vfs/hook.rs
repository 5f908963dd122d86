//! Unraisable-failure reporting
//!
//! SQLite only ever sees a status code, so everything else about a failure
//! inside a VFS callback (the error itself, the call's arguments) ends up
//! here. Each [`Vfs`](super::Vfs) and [`VfsFile`](super::VfsFile) receives
//! its failures through `excepthook`, whose default forwards to [`report`].

use crate::error::VfsError;
use parking_lot::RwLock;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

type Hook = Arc<dyn Fn(&Failure) + Send + Sync>;

static EXCEPTHOOK: RwLock<Option<Hook>> = parking_lot::const_rwlock(None);

/// A failure that happened inside an adapter-mediated call.
#[derive(Debug)]
pub struct Failure {
    /// Engine entry point, e.g. `"xRead"`
    pub op: &'static str,
    /// Argument names and values of the failing call
    pub context: Vec<(&'static str, String)>,
    pub error: VfsError,
}

impl Failure {
    pub fn new(op: &'static str, error: VfsError) -> Self {
        Self {
            op,
            context: Vec::new(),
            error,
        }
    }

    pub fn with(mut self, key: &'static str, value: impl fmt::Display) -> Self {
        self.context.push((key, value.to_string()));
        self
    }

    /// Engine status code the failure translates to
    pub fn code(&self) -> i32 {
        self.error.code()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.op, self.error)?;
        if !self.context.is_empty() {
            f.write_str(" {")?;
            for (i, (key, value)) in self.context.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}: {}", key, value)?;
            }
            f.write_str("}")?;
        }
        Ok(())
    }
}

/// Installs the process-wide excepthook.
pub fn set_excepthook<F>(hook: F)
where
    F: Fn(&Failure) + Send + Sync + 'static,
{
    *EXCEPTHOOK.write() = Some(Arc::new(hook));
}

/// Restores the default hook, which logs through `tracing`.
pub fn clear_excepthook() {
    *EXCEPTHOOK.write() = None;
}

/// Sends a failure to the process-wide excepthook.
///
/// A hook that panics is abandoned for this failure and the default logger
/// used instead.
pub fn report(failure: &Failure) {
    let hook = EXCEPTHOOK.read().clone();
    match hook {
        Some(hook) => {
            if panic::catch_unwind(AssertUnwindSafe(|| hook(failure))).is_err() {
                display(failure);
            }
        }
        None => display(failure),
    }
}

/// Hands a failure to an object's own excepthook, with the same panic
/// fallback as [`report`].
pub(crate) fn deliver(failure: &Failure, hook: impl FnOnce(&Failure)) {
    if panic::catch_unwind(AssertUnwindSafe(|| hook(failure))).is_err() {
        display(failure);
    }
}

fn display(failure: &Failure) {
    tracing::error!(op = failure.op, code = failure.code(), "{}", failure);
}
