//! Per-call failure bookkeeping
//!
//! A [`Frame`] brackets one trampoline invocation. Entering takes the
//! thread's pending failures as the frame's snapshot so that whatever was in
//! flight before SQLite called us (a failure from an enclosing callback, for
//! instance) stays separate from failures raised by this call. Leaving hands
//! this call's failures to the owning object's excepthook and puts the
//! snapshot back. Exactly one snapshot is taken and restored per frame,
//! including on unwind.

use super::hook::{self, Failure};
use crate::error::{Result, VfsError};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::mem;
use std::os::raw::c_int;
use std::panic::{self, AssertUnwindSafe};

thread_local! {
    static PENDING: RefCell<Vec<Failure>> = const { RefCell::new(Vec::new()) };
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

pub(crate) struct Frame {
    op: &'static str,
    prior: Option<Vec<Failure>>,
}

impl Frame {
    pub(crate) fn enter(op: &'static str) -> Self {
        let prior = PENDING.with(|pending| mem::take(&mut *pending.borrow_mut()));
        DEPTH.with(|depth| depth.set(depth.get() + 1));
        Frame {
            op,
            prior: Some(prior),
        }
    }

    /// Runs the dispatch, turning a panic into [`VfsError::Panic`].
    pub(crate) fn run<T>(&self, call: impl FnOnce() -> Result<T>) -> Result<T> {
        match panic::catch_unwind(AssertUnwindSafe(call)) {
            Ok(result) => result,
            Err(payload) => Err(VfsError::Panic {
                op: self.op,
                message: panic_message(payload.as_ref()),
            }),
        }
    }

    /// Records a failure for reporting on leave and returns its status code.
    pub(crate) fn fail(&self, failure: Failure) -> c_int {
        let code = failure.code();
        PENDING.with(|pending| pending.borrow_mut().push(failure));
        code
    }

    /// Reports this call's failures through `hook` and restores the snapshot.
    pub(crate) fn leave(mut self, hook: impl Fn(&Failure)) {
        for failure in self.restore() {
            hook::deliver(&failure, &hook);
        }
    }

    fn restore(&mut self) -> Vec<Failure> {
        let prior = self.prior.take().unwrap_or_default();
        DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
        PENDING.with(|pending| mem::replace(&mut *pending.borrow_mut(), prior))
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if self.prior.is_some() {
            for failure in self.restore() {
                hook::report(&failure);
            }
        }
    }
}

/// Records a failure that has no return channel.
///
/// Inside a VFS callback the failure is reported through the excepthook of
/// the object whose callback is running once it returns. Outside any callback
/// it is reported immediately.
pub fn defer(failure: Failure) {
    if DEPTH.with(Cell::get) == 0 {
        hook::report(&failure);
    } else {
        PENDING.with(|pending| pending.borrow_mut().push(failure));
    }
}

/// True if the current callback has failures waiting to be reported.
#[cfg(test)]
pub(crate) fn is_pending() -> bool {
    PENDING.with(|pending| !pending.borrow().is_empty())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("non-string panic payload")
    }
}
