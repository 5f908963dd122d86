//! In-memory VFS
//!
//! A complete VFS written only against the [`Vfs`] / [`VfsFile`] traits. Files
//! live in a shared map for as long as the `MemoryVfs` (or any clone of it) is
//! alive, so several connections through the same registration see the same
//! database. Registered through the adapter it is a version 1 VFS and can
//! therefore serve as a base for derived VFSes.

use crate::error::{Result, VfsError};
use crate::vfs::{
    AccessKind, DlHandle, DlSymbol, LockLevel, OpenFlags, SyncFlags, Vfs, VfsFile,
};
use libsqlite3_sys as ffi;
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use std::collections::HashMap;
use std::os::raw::{c_int, c_void};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Julian day number of the Unix epoch
const UNIX_EPOCH_JULIAN_DAY: f64 = 2440587.5;
const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Sector size reported for every file
pub const MEMORY_SECTOR_SIZE: u32 = 4096;

/// Largest size a file may grow to; writes past it fail with `SQLITE_FULL`
pub const MEMORY_MAX_FILE_SIZE: u64 = 1 << 40;

#[derive(Default)]
struct Store {
    files: RwLock<HashMap<String, Arc<Mutex<Node>>>>,
    last_error: Mutex<Option<String>>,
    next_temp: AtomicU64,
    next_owner: AtomicU64,
}

impl Store {
    fn fail(&self, err: VfsError) -> VfsError {
        *self.last_error.lock() = Some(err.to_string());
        err
    }
}

#[derive(Default)]
struct Node {
    data: Vec<u8>,
    locks: LockTable,
}

/// SQLite's five-level file lock, tracked per open handle.
#[derive(Debug, Default)]
struct LockTable {
    held: HashMap<u64, LockLevel>,
}

impl LockTable {
    fn level(&self, owner: u64) -> LockLevel {
        self.held.get(&owner).copied().unwrap_or(LockLevel::None)
    }

    fn others(&self, owner: u64) -> impl Iterator<Item = LockLevel> + '_ {
        self.held
            .iter()
            .filter(move |(id, _)| **id != owner)
            .map(|(_, level)| *level)
    }

    fn acquire(&mut self, owner: u64, level: LockLevel) -> Result<()> {
        let current = self.level(owner);
        if level <= current {
            return Ok(());
        }

        match level {
            LockLevel::None => Ok(()),
            LockLevel::Shared => {
                if self.others(owner).any(|l| l >= LockLevel::Pending) {
                    return Err(busy());
                }
                self.held.insert(owner, LockLevel::Shared);
                Ok(())
            }
            LockLevel::Reserved => {
                if current < LockLevel::Shared {
                    return Err(VfsError::protocol(
                        "xLock",
                        "RESERVED requested without holding SHARED",
                    ));
                }
                if self.others(owner).any(|l| l >= LockLevel::Reserved) {
                    return Err(busy());
                }
                self.held.insert(owner, LockLevel::Reserved);
                Ok(())
            }
            LockLevel::Pending | LockLevel::Exclusive => {
                if current < LockLevel::Shared {
                    return Err(VfsError::protocol(
                        "xLock",
                        format!("{:?} requested without holding SHARED", level),
                    ));
                }
                if current < LockLevel::Reserved
                    && self.others(owner).any(|l| l >= LockLevel::Reserved)
                {
                    return Err(busy());
                }
                // Pending keeps new readers out while existing ones drain.
                self.held.insert(owner, LockLevel::Pending);
                if level == LockLevel::Exclusive {
                    if self.others(owner).any(|l| l >= LockLevel::Shared) {
                        return Err(busy());
                    }
                    self.held.insert(owner, LockLevel::Exclusive);
                }
                Ok(())
            }
        }
    }

    fn release(&mut self, owner: u64, level: LockLevel) -> Result<()> {
        match level {
            LockLevel::None => {
                self.held.remove(&owner);
                Ok(())
            }
            LockLevel::Shared => {
                if self.level(owner) > LockLevel::Shared {
                    self.held.insert(owner, LockLevel::Shared);
                }
                Ok(())
            }
            other => Err(VfsError::protocol(
                "xUnlock",
                format!("cannot unlock to {:?}", other),
            )),
        }
    }

    fn reserved(&self) -> bool {
        self.held.values().any(|l| *l >= LockLevel::Reserved)
    }
}

/// Grows or shrinks `data` to `len` bytes, zero-filling. A size the
/// allocator refuses is `SQLITE_FULL` rather than an abort.
fn resize(data: &mut Vec<u8>, len: usize) -> Result<()> {
    if let Some(extra) = len.checked_sub(data.len()) {
        data.try_reserve(extra)
            .map_err(|_| VfsError::from_code(ffi::SQLITE_FULL))?;
    }
    data.resize(len, 0);
    Ok(())
}

fn busy() -> VfsError {
    VfsError::from_code(ffi::SQLITE_BUSY)
}

/// In-memory VFS. Clones share the same files.
///
/// # Examples
///
/// ```rust,no_run
/// use layervfs::{MemoryVfs, VfsRegistration};
///
/// # fn main() -> layervfs::Result<()> {
/// let memory = MemoryVfs::new();
/// let vfs = VfsRegistration::new("example-mem").register(memory.clone())?;
///
/// let conn = vfs.open_connection("notes.db")?;
/// conn.execute_batch("CREATE TABLE notes (body TEXT)")?;
/// drop(conn);
///
/// assert!(memory.paths().iter().any(|p| p.ends_with("notes.db")));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct MemoryVfs {
    store: Arc<Store>,
}

impl MemoryVfs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current contents of `name`, if it exists.
    pub fn contents(&self, name: &str) -> Option<Vec<u8>> {
        let files = self.store.files.read();
        files.get(name).map(|node| node.lock().data.clone())
    }

    /// Creates or replaces `name` with `data`.
    pub fn insert(&self, name: impl Into<String>, data: Vec<u8>) {
        let node = Node {
            data,
            locks: LockTable::default(),
        };
        self.store
            .files
            .write()
            .insert(name.into(), Arc::new(Mutex::new(node)));
    }

    /// Names of every file currently stored, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.store.files.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.store.files.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Opens `name` directly, without going through SQLite.
    pub fn open_file(&self, name: Option<&str>, flags: &mut OpenFlags) -> Result<MemoryFile> {
        let store = &self.store;
        let temp = name.is_none();
        let (name, node) = match name {
            None => {
                let id = store.next_temp.fetch_add(1, Ordering::Relaxed);
                let name = format!("/<temp-{}>", id);
                let node = Arc::new(Mutex::new(Node::default()));
                store.files.write().insert(name.clone(), Arc::clone(&node));
                (name, node)
            }
            Some(name) => {
                let mut files = store.files.write();
                let node = match files.get(name) {
                    Some(_) if flags.is_exclusive() && flags.is_create() => {
                        return Err(store.fail(VfsError::from_code(ffi::SQLITE_CANTOPEN)));
                    }
                    Some(node) => Arc::clone(node),
                    None if flags.is_create() => {
                        let node = Arc::new(Mutex::new(Node::default()));
                        files.insert(name.to_string(), Arc::clone(&node));
                        node
                    }
                    None => return Err(store.fail(VfsError::from_code(ffi::SQLITE_CANTOPEN))),
                };
                (name.to_string(), node)
            }
        };

        flags.output = flags.input;
        debug!("Opened in-memory file {}", name);
        Ok(MemoryFile {
            store: Arc::clone(store),
            owner: store.next_owner.fetch_add(1, Ordering::Relaxed),
            readonly: flags.is_readonly(),
            delete_on_close: temp || flags.is_delete_on_close(),
            name,
            node,
            closed: false,
        })
    }
}

impl Vfs for MemoryVfs {
    fn delete(&self, name: &str, _sync_dir: bool) -> Result<()> {
        match self.store.files.write().remove(name) {
            Some(_) => Ok(()),
            None => Err(self
                .store
                .fail(VfsError::from_code(ffi::SQLITE_IOERR_DELETE_NOENT))),
        }
    }

    fn access(&self, name: &str, _kind: AccessKind) -> Result<bool> {
        Ok(self.store.files.read().contains_key(name))
    }

    fn full_pathname(&self, name: &str) -> Result<String> {
        if name.starts_with('/') {
            Ok(name.to_string())
        } else {
            Ok(format!("/{}", name))
        }
    }

    fn open(&self, name: Option<&str>, flags: &mut OpenFlags) -> Result<Box<dyn VfsFile>> {
        Ok(Box::new(self.open_file(name, flags)?))
    }

    #[cfg(unix)]
    fn dl_open(&self, path: &str) -> Result<DlHandle> {
        let path = std::ffi::CString::new(path).map_err(|e| VfsError::InvalidName(e.to_string()))?;
        Ok(DlHandle(unsafe { libc::dlopen(path.as_ptr(), libc::RTLD_NOW) }))
    }

    #[cfg(unix)]
    fn dl_sym(&self, handle: DlHandle, symbol: &str) -> Result<DlSymbol> {
        let symbol =
            std::ffi::CString::new(symbol).map_err(|e| VfsError::InvalidName(e.to_string()))?;
        Ok(DlSymbol(unsafe { libc::dlsym(handle.0, symbol.as_ptr()) }))
    }

    #[cfg(unix)]
    fn dl_close(&self, handle: DlHandle) -> Result<()> {
        if !handle.is_null() {
            unsafe { libc::dlclose(handle.0) };
        }
        Ok(())
    }

    #[cfg(unix)]
    fn dl_error(&self) -> Result<Option<String>> {
        let message = unsafe { libc::dlerror() };
        if message.is_null() {
            return Ok(None);
        }
        let message = unsafe { std::ffi::CStr::from_ptr(message) };
        Ok(Some(message.to_string_lossy().into_owned()))
    }

    fn randomness(&self, amount: usize) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; amount];
        rand::thread_rng().fill_bytes(&mut bytes);
        Ok(bytes)
    }

    fn sleep(&self, duration: Duration) -> Result<Duration> {
        std::thread::sleep(duration);
        Ok(duration)
    }

    fn current_time(&self) -> Result<f64> {
        let millis = chrono::Utc::now().timestamp_millis() as f64;
        Ok(UNIX_EPOCH_JULIAN_DAY + millis / MILLIS_PER_DAY)
    }

    fn get_last_error(&self) -> Result<Option<String>> {
        Ok(self.store.last_error.lock().clone())
    }
}

/// An open in-memory file
pub struct MemoryFile {
    store: Arc<Store>,
    name: String,
    node: Arc<Mutex<Node>>,
    owner: u64,
    readonly: bool,
    delete_on_close: bool,
    closed: bool,
}

impl MemoryFile {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock_level(&self) -> LockLevel {
        self.node.lock().locks.level(self.owner)
    }

    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.node.lock().locks.held.remove(&self.owner);

        if self.delete_on_close {
            let mut files = self.store.files.write();
            // Only if the name still refers to this file's node
            if files
                .get(&self.name)
                .is_some_and(|node| Arc::ptr_eq(node, &self.node))
            {
                files.remove(&self.name);
            }
        }
    }
}

impl VfsFile for MemoryFile {
    fn read(&mut self, amount: usize, offset: u64) -> Result<Vec<u8>> {
        let node = self.node.lock();
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        if start >= node.data.len() {
            return Ok(Vec::new());
        }
        let end = start.saturating_add(amount).min(node.data.len());
        Ok(node.data[start..end].to_vec())
    }

    fn write(&mut self, data: &[u8], offset: u64) -> Result<()> {
        if self.readonly {
            return Err(VfsError::from_code(ffi::SQLITE_READONLY));
        }
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|end| *end <= MEMORY_MAX_FILE_SIZE)
            .and_then(|end| usize::try_from(end).ok())
            .ok_or_else(|| self.store.fail(VfsError::from_code(ffi::SQLITE_FULL)))?;
        let start = end - data.len();

        let mut node = self.node.lock();
        if node.data.len() < end {
            resize(&mut node.data, end).map_err(|err| self.store.fail(err))?;
        }
        node.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        let size = Some(size)
            .filter(|size| *size <= MEMORY_MAX_FILE_SIZE)
            .and_then(|size| usize::try_from(size).ok())
            .ok_or_else(|| self.store.fail(VfsError::from_code(ffi::SQLITE_FULL)))?;
        resize(&mut self.node.lock().data, size).map_err(|err| self.store.fail(err))
    }

    fn sync(&mut self, _flags: SyncFlags) -> Result<()> {
        Ok(())
    }

    fn file_size(&mut self) -> Result<u64> {
        Ok(self.node.lock().data.len() as u64)
    }

    fn lock(&mut self, level: LockLevel) -> Result<()> {
        self.node.lock().locks.acquire(self.owner, level)
    }

    fn unlock(&mut self, level: LockLevel) -> Result<()> {
        self.node.lock().locks.release(self.owner, level)
    }

    fn check_reserved_lock(&mut self) -> Result<bool> {
        Ok(self.node.lock().locks.reserved())
    }

    fn file_control(&mut self, _op: c_int, _arg: *mut c_void) -> Result<()> {
        Err(VfsError::from_code(ffi::SQLITE_NOTFOUND))
    }

    fn sector_size(&mut self) -> Result<u32> {
        Ok(MEMORY_SECTOR_SIZE)
    }

    fn device_characteristics(&mut self) -> Result<c_int> {
        Ok(ffi::SQLITE_IOCAP_ATOMIC4K | ffi::SQLITE_IOCAP_SAFE_APPEND)
    }

    fn close(&mut self) -> Result<()> {
        self.release();
        Ok(())
    }
}

impl Drop for MemoryFile {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create() -> OpenFlags {
        OpenFlags::new(ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE)
    }

    #[test]
    fn test_open_create_write_read() -> Result<()> {
        let vfs = MemoryVfs::new();
        let mut flags = create();
        let mut file = vfs.open_file(Some("/a.db"), &mut flags)?;
        assert_eq!(flags.output, flags.input);

        file.write(b"hello world", 0)?;
        assert_eq!(file.read(5, 6)?, b"world");
        assert_eq!(file.file_size()?, 11);
        assert_eq!(vfs.contents("/a.db").as_deref(), Some(&b"hello world"[..]));
        Ok(())
    }

    #[test]
    fn test_short_read_past_end() -> Result<()> {
        let vfs = MemoryVfs::new();
        let mut file = vfs.open_file(Some("/short"), &mut create())?;
        file.write(&[7; 10], 0)?;

        assert_eq!(file.read(20, 5)?, vec![7; 5]);
        assert!(file.read(4, 100)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_write_past_end_zero_fills_gap() -> Result<()> {
        let vfs = MemoryVfs::new();
        let mut file = vfs.open_file(Some("/gap"), &mut create())?;
        file.write(b"xy", 4)?;
        assert_eq!(vfs.contents("/gap"), Some(vec![0, 0, 0, 0, b'x', b'y']));

        file.truncate(1)?;
        assert_eq!(file.file_size()?, 1);
        Ok(())
    }

    #[test]
    fn test_open_missing_without_create() {
        let vfs = MemoryVfs::new();
        let mut flags = OpenFlags::new(ffi::SQLITE_OPEN_READWRITE);
        let err = vfs.open_file(Some("/missing"), &mut flags).err();
        assert_eq!(err.map(|e| e.code()), Some(ffi::SQLITE_CANTOPEN));
        assert!(vfs.get_last_error().ok().flatten().is_some());
    }

    #[test]
    fn test_exclusive_create_of_existing_file() {
        let vfs = MemoryVfs::new();
        vfs.insert("/taken", Vec::new());
        let mut flags = OpenFlags::new(
            ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE | ffi::SQLITE_OPEN_EXCLUSIVE,
        );
        assert!(vfs.open_file(Some("/taken"), &mut flags).is_err());
    }

    #[test]
    fn test_readonly_rejects_writes() -> Result<()> {
        let vfs = MemoryVfs::new();
        vfs.insert("/ro", b"data".to_vec());
        let mut flags = OpenFlags::new(ffi::SQLITE_OPEN_READONLY);
        let mut file = vfs.open_file(Some("/ro"), &mut flags)?;

        assert_eq!(flags.output & ffi::SQLITE_OPEN_READONLY, ffi::SQLITE_OPEN_READONLY);
        assert_eq!(
            file.write(b"x", 0).err().map(|e| e.code()),
            Some(ffi::SQLITE_READONLY)
        );
        Ok(())
    }

    #[test]
    fn test_temp_and_delete_on_close() -> Result<()> {
        let vfs = MemoryVfs::new();
        let mut temp = vfs.open_file(None, &mut create())?;
        assert_eq!(vfs.len(), 1);
        temp.close()?;
        assert!(vfs.is_empty());

        let mut flags = OpenFlags::new(
            ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE | ffi::SQLITE_OPEN_DELETEONCLOSE,
        );
        let file = vfs.open_file(Some("/scratch"), &mut flags)?;
        assert!(vfs.access("/scratch", AccessKind::Exists)?);
        drop(file);
        assert!(!vfs.access("/scratch", AccessKind::Exists)?);
        Ok(())
    }

    #[test]
    fn test_huge_offsets_fail_instead_of_aborting() -> Result<()> {
        let vfs = MemoryVfs::new();
        let mut file = vfs.open_file(Some("/huge"), &mut create())?;
        file.write(b"head", 0)?;

        let err = file.write(b"x", 1 << 46).err();
        assert_eq!(err.map(|e| e.code()), Some(ffi::SQLITE_FULL));
        let err = file.write(b"xy", u64::MAX - 1).err();
        assert_eq!(err.map(|e| e.code()), Some(ffi::SQLITE_FULL));
        let err = file.truncate(1 << 46).err();
        assert_eq!(err.map(|e| e.code()), Some(ffi::SQLITE_FULL));

        // The file is untouched and the failure is remembered
        assert_eq!(file.read(16, 0)?, b"head");
        assert!(vfs.get_last_error()?.is_some());
        Ok(())
    }

    #[test]
    fn test_named_file_that_looks_temporary_survives_close() -> Result<()> {
        let vfs = MemoryVfs::new();
        let mut file = vfs.open_file(Some("/<temp-7>"), &mut create())?;
        file.write(b"kept", 0)?;
        file.close()?;
        assert_eq!(vfs.contents("/<temp-7>"), Some(b"kept".to_vec()));
        Ok(())
    }

    #[test]
    fn test_delete() -> Result<()> {
        let vfs = MemoryVfs::new();
        vfs.insert("/gone", vec![1]);
        vfs.delete("/gone", false)?;
        let err = vfs.delete("/gone", false).err();
        assert_eq!(err.map(|e| e.code()), Some(ffi::SQLITE_IOERR_DELETE_NOENT));
        Ok(())
    }

    #[test]
    fn test_lock_protocol() -> Result<()> {
        let vfs = MemoryVfs::new();
        let mut writer = vfs.open_file(Some("/locks"), &mut create())?;
        let mut reader = vfs.open_file(Some("/locks"), &mut create())?;

        writer.lock(LockLevel::Shared)?;
        reader.lock(LockLevel::Shared)?;
        writer.lock(LockLevel::Reserved)?;
        assert!(reader.check_reserved_lock()?);

        // A second writer cannot reserve
        assert!(reader.lock(LockLevel::Reserved).err().is_some_and(|e| e.is_busy()));

        // Exclusive waits for the reader, holding pending meanwhile
        assert!(writer.lock(LockLevel::Exclusive).err().is_some_and(|e| e.is_busy()));
        assert_eq!(writer.lock_level(), LockLevel::Pending);

        reader.unlock(LockLevel::None)?;
        writer.lock(LockLevel::Exclusive)?;

        // No new readers while exclusive is held
        assert!(reader.lock(LockLevel::Shared).err().is_some_and(|e| e.is_busy()));

        writer.unlock(LockLevel::Shared)?;
        reader.lock(LockLevel::Shared)?;
        writer.unlock(LockLevel::None)?;
        assert!(!reader.check_reserved_lock()?);
        Ok(())
    }

    #[test]
    fn test_close_releases_locks() -> Result<()> {
        let vfs = MemoryVfs::new();
        let mut first = vfs.open_file(Some("/held"), &mut create())?;
        let mut second = vfs.open_file(Some("/held"), &mut create())?;

        first.lock(LockLevel::Shared)?;
        first.lock(LockLevel::Exclusive)?;
        first.close()?;

        second.lock(LockLevel::Shared)?;
        second.lock(LockLevel::Exclusive)?;
        Ok(())
    }

    #[test]
    fn test_current_time_is_a_julian_day() -> Result<()> {
        let now = MemoryVfs::new().current_time()?;
        // 2020-01-01 and 2100-01-01
        assert!(now > 2458849.5 && now < 2488069.5, "{}", now);
        Ok(())
    }

    #[test]
    fn test_randomness_length() -> Result<()> {
        assert_eq!(MemoryVfs::new().randomness(33)?.len(), 33);
        Ok(())
    }

    #[test]
    fn test_file_control_is_not_found() -> Result<()> {
        let vfs = MemoryVfs::new();
        let mut file = vfs.open_file(Some("/fc"), &mut create())?;
        let err = file.file_control(ffi::SQLITE_FCNTL_PRAGMA, std::ptr::null_mut()).err();
        assert_eq!(err.map(|e| e.code()), Some(ffi::SQLITE_NOTFOUND));
        assert_eq!(file.sector_size()?, MEMORY_SECTOR_SIZE);
        Ok(())
    }
}
