//! Fault injection
//!
//! Only compiled for tests or with the `fault-injection` feature. Arming a
//! point makes the next pass through it on the current thread take its
//! failure branch instead of the real operation.
//!
//! ```rust,ignore
//! let _faults = fault::arm(FaultPoint::RandomnessAlloc);
//! assert!(base.randomness(16).is_err());
//! ```

use std::cell::RefCell;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// `sqlite3_vfs_register` reports `SQLITE_NOMEM`
    RegistrationFails,
    /// `sqlite3_vfs_unregister` reports `SQLITE_IOERR`
    UnregisterFails,
    /// Base VFS looks like it has an unsupported version
    BadBaseVersion,
    /// Base full pathname output cannot be decoded
    FullPathnameConversion,
    RandomnessAlloc,
    CurrentTimeFail,
    GetLastErrorAlloc,
    DlErrorAlloc,
    ReadBufferAlloc,
    UnlockFails,
    SyncFails,
    FileSizeFails,
    CheckReservedLockFails,
    CheckReservedLockIsTrue,
    CloseFails,
}

thread_local! {
    static ARMED: RefCell<HashSet<FaultPoint>> = RefCell::new(HashSet::new());
}

/// Disarms every fault point on the current thread when dropped.
#[must_use = "faults are disarmed as soon as the guard is dropped"]
pub struct FaultGuard(());

impl Drop for FaultGuard {
    fn drop(&mut self) {
        clear();
    }
}

/// Arms `point` on the current thread.
pub fn arm(point: FaultPoint) -> FaultGuard {
    ARMED.with(|armed| armed.borrow_mut().insert(point));
    FaultGuard(())
}

pub fn clear() {
    ARMED.with(|armed| armed.borrow_mut().clear());
}

pub fn is_armed(point: FaultPoint) -> bool {
    ARMED.with(|armed| armed.borrow().contains(&point))
}

/// Consumes an armed point. One-shot: returns true at most once per `arm`.
pub(crate) fn fires(point: FaultPoint) -> bool {
    ARMED.with(|armed| armed.borrow_mut().remove(&point))
}
