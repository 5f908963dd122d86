//! VFS FFI integration tests
//!
//! Drives registered VFSes through real SQLite connections: the in-memory VFS,
//! a transform layered on top of it, and a pass-through base registered under
//! a second name.

use layervfs::{
    BaseVfs, Failure, MemoryVfs, TransformVfs, Vfs, VfsError, VfsFile, VfsRegistration,
    XorTransform,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn unique(prefix: &str) -> String {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    format!("{}-{}-{}", prefix, std::process::id(), NEXT.fetch_add(1, Ordering::Relaxed))
}

fn open_uri(path: &str, vfs: &str) -> Connection {
    Connection::open_with_flags(
        format!("file:{}?vfs={}", path, vfs),
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_URI,
    )
    .unwrap()
}

#[test]
fn test_memory_vfs_create_insert_select() {
    let memory = MemoryVfs::new();
    let vfs = VfsRegistration::new(unique("mem")).register(memory.clone()).unwrap();

    let conn = vfs.open_connection("/basic.db").unwrap();
    conn.execute("CREATE TABLE test (id INTEGER PRIMARY KEY, value TEXT)", [])
        .unwrap();
    for i in 0..10 {
        conn.execute("INSERT INTO test VALUES (?, ?)", params![i, format!("value{}", i)])
            .unwrap();
    }

    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM test", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 10);

    let value: String = conn
        .query_row("SELECT value FROM test WHERE id = ?", params![7], |row| row.get(0))
        .unwrap();
    assert_eq!(value, "value7");
    drop(conn);

    let image = memory.contents("/basic.db").unwrap();
    assert!(image.starts_with(b"SQLite format 3\0"));
    // The rollback journal is deleted after each commit
    assert!(memory.contents("/basic.db-journal").is_none());
}

#[test]
fn test_persistence_across_connections() {
    let memory = MemoryVfs::new();
    let vfs = VfsRegistration::new(unique("persist")).register(memory).unwrap();

    {
        let conn = open_uri("/persist.db", vfs.name());
        conn.execute_batch(
            "CREATE TABLE kv (k TEXT PRIMARY KEY, v INTEGER);
             INSERT INTO kv VALUES ('a', 1), ('b', 2);",
        )
        .unwrap();
    }

    let conn = open_uri("/persist.db", vfs.name());
    let total: i64 = conn
        .query_row("SELECT SUM(v) FROM kv", [], |row| row.get(0))
        .unwrap();
    assert_eq!(total, 3);
}

#[test]
fn test_transactions_and_rollback() {
    let vfs = VfsRegistration::new(unique("txn")).register(MemoryVfs::new()).unwrap();
    let mut conn = vfs.open_connection("/txn.db").unwrap();
    conn.execute("CREATE TABLE t (x INTEGER)", []).unwrap();

    {
        let tx = conn.transaction().unwrap();
        tx.execute("INSERT INTO t VALUES (1)", []).unwrap();
        tx.commit().unwrap();
    }
    {
        let tx = conn.transaction().unwrap();
        tx.execute("INSERT INTO t VALUES (2)", []).unwrap();
        tx.rollback().unwrap();
    }

    let rows: i64 = conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0)).unwrap();
    assert_eq!(rows, 1);
}

#[test]
fn test_large_blob_operations() {
    let vfs = VfsRegistration::new(unique("blobs")).register(MemoryVfs::new()).unwrap();
    let conn = vfs.open_connection("/blobs.db").unwrap();
    conn.execute("CREATE TABLE blobs (id INTEGER PRIMARY KEY, data BLOB)", [])
        .unwrap();

    for i in 0..3 {
        let blob_data = vec![0xABu8; 256 * 1024];
        conn.execute("INSERT INTO blobs VALUES (?, ?)", params![i, blob_data])
            .unwrap();
    }

    for i in 0..3 {
        let blob: Vec<u8> = conn
            .query_row("SELECT data FROM blobs WHERE id = ?", params![i], |row| row.get(0))
            .unwrap();
        assert_eq!(blob.len(), 256 * 1024);
        assert!(blob.iter().all(|&b| b == 0xAB));
    }
}

#[test]
fn test_vacuum_and_temp_files() {
    let memory = MemoryVfs::new();
    let vfs = VfsRegistration::new(unique("vacuum")).register(memory.clone()).unwrap();
    let conn = vfs.open_connection("/vacuum.db").unwrap();

    conn.execute_batch("PRAGMA temp_store = FILE; CREATE TABLE t (x BLOB);")
        .unwrap();
    for _ in 0..50 {
        conn.execute("INSERT INTO t VALUES (randomblob(2000))", []).unwrap();
    }
    conn.execute("DELETE FROM t", []).unwrap();
    conn.execute("VACUUM", []).unwrap();

    drop(conn);
    // Temp files are deleted on close
    assert_eq!(memory.paths(), vec![String::from("/vacuum.db")]);
}

#[test]
fn test_transform_vfs_hides_plaintext() {
    let memory = MemoryVfs::new();
    let store = VfsRegistration::new(unique("xor-store")).register(memory.clone()).unwrap();
    let xor = TransformVfs::new(store.as_base(), XorTransform::new(*b"not-a-real-cipher"));
    let vfs = VfsRegistration::new(unique("xor")).register(xor).unwrap();

    let conn = vfs.open_connection("/secret.db").unwrap();
    conn.execute("CREATE TABLE notes (body TEXT)", []).unwrap();
    conn.execute("INSERT INTO notes VALUES ('plaintext marker')", [])
        .unwrap();
    drop(conn);

    let image = memory.contents("/secret.db").unwrap();
    assert!(!image.starts_with(b"SQLite format 3\0"));
    assert!(!image.windows(16).any(|w| w == b"plaintext marker"));

    // Reading back through the transform recovers the data
    let conn = vfs.open_connection("/secret.db").unwrap();
    let body: String = conn
        .query_row("SELECT body FROM notes", [], |row| row.get(0))
        .unwrap();
    assert_eq!(body, "plaintext marker");

    // Reading the raw store directly does not
    let raw = store.open_connection("/secret.db").unwrap();
    assert!(raw.query_row("SELECT body FROM notes", [], |row| row.get::<_, String>(0)).is_err());
}

#[test]
fn test_pass_through_base_registered_again() {
    let memory = MemoryVfs::new();
    let store = VfsRegistration::new(unique("pt-store")).register(memory.clone()).unwrap();
    let alias = VfsRegistration::new(unique("pt-alias"))
        .register(BaseVfs::find(store.name()).unwrap())
        .unwrap();

    let conn = alias.open_connection("/through.db").unwrap();
    conn.execute_batch("CREATE TABLE t (x); INSERT INTO t VALUES (42);")
        .unwrap();
    drop(conn);

    let conn = store.open_connection("/through.db").unwrap();
    let x: i64 = conn.query_row("SELECT x FROM t", [], |row| row.get(0)).unwrap();
    assert_eq!(x, 42);
}

#[cfg(unix)]
#[test]
fn test_transform_over_disk_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("disk.db");

    // The unix VFS is version 3, so the base file layer opens through it by name
    struct DiskXor {
        transform: XorTransform,
    }

    impl Vfs for DiskXor {
        fn full_pathname(&self, name: &str) -> layervfs::Result<String> {
            Ok(name.to_string())
        }

        fn access(&self, name: &str, _kind: layervfs::AccessKind) -> layervfs::Result<bool> {
            Ok(std::path::Path::new(name).exists())
        }

        fn delete(&self, name: &str, _sync_dir: bool) -> layervfs::Result<()> {
            std::fs::remove_file(name)?;
            Ok(())
        }

        fn randomness(&self, amount: usize) -> layervfs::Result<Vec<u8>> {
            Ok(vec![4; amount])
        }

        fn current_time(&self) -> layervfs::Result<f64> {
            Ok(2460000.5)
        }

        fn open(
            &self,
            name: Option<&str>,
            flags: &mut layervfs::OpenFlags,
        ) -> layervfs::Result<Box<dyn VfsFile>> {
            let base = layervfs::BaseFile::open("unix", name, flags)?;
            Ok(Box::new(DiskXorFile {
                base,
                transform: self.transform.clone(),
            }))
        }
    }

    struct DiskXorFile {
        base: layervfs::BaseFile,
        transform: XorTransform,
    }

    impl VfsFile for DiskXorFile {
        fn base(&mut self) -> Option<&mut layervfs::BaseFile> {
            Some(&mut self.base)
        }

        fn read(&mut self, amount: usize, offset: u64) -> layervfs::Result<Vec<u8>> {
            use layervfs::Transform;
            let mut data = self.base.read(amount, offset)?;
            self.transform.decode(&mut data, offset);
            Ok(data)
        }

        fn write(&mut self, data: &[u8], offset: u64) -> layervfs::Result<()> {
            use layervfs::Transform;
            let mut data = data.to_vec();
            self.transform.encode(&mut data, offset);
            self.base.write(&data, offset)
        }
    }

    let vfs = VfsRegistration::new(unique("disk-xor"))
        .register(DiskXor {
            transform: XorTransform::new(*b"k3y"),
        })
        .unwrap();

    {
        let conn = vfs.open_connection(&path).unwrap();
        conn.execute_batch("CREATE TABLE t (x TEXT); INSERT INTO t VALUES ('on disk');")
            .unwrap();
    }

    let raw = std::fs::read(&path).unwrap();
    assert!(!raw.starts_with(b"SQLite format 3\0"));

    let conn = vfs.open_connection(&path).unwrap();
    let x: String = conn.query_row("SELECT x FROM t", [], |row| row.get(0)).unwrap();
    assert_eq!(x, "on disk");
}

#[test]
fn test_unregistered_vfs_cannot_open() {
    let vfs = VfsRegistration::new(unique("gone")).register(MemoryVfs::new()).unwrap();
    let name = vfs.name().to_string();
    vfs.unregister().unwrap();

    let result = Connection::open_with_flags_and_vfs("/gone.db", OpenFlags::default(), &name);
    assert!(result.is_err());
}

#[test]
fn test_open_connection_after_replacement() {
    let name = unique("replaced");
    let first = MemoryVfs::new();
    let second = MemoryVfs::new();
    let _old = VfsRegistration::new(name.as_str()).register(first.clone()).unwrap();
    let new = VfsRegistration::new(name.as_str()).register(second.clone()).unwrap();

    let conn = new.open_connection("/which.db").unwrap();
    conn.execute("CREATE TABLE t (x)", []).unwrap();
    drop(conn);

    assert!(first.is_empty());
    assert!(second.contents("/which.db").is_some());
}

/// Logs failures and refuses one file name.
struct Picky {
    base: BaseVfs,
    seen: Arc<Mutex<Vec<String>>>,
}

impl Vfs for Picky {
    fn base(&self) -> Option<&BaseVfs> {
        Some(&self.base)
    }

    fn open(
        &self,
        name: Option<&str>,
        flags: &mut layervfs::OpenFlags,
    ) -> layervfs::Result<Box<dyn VfsFile>> {
        if name.is_some_and(|n| n.ends_with("forbidden.db")) {
            return Err(VfsError::from_code(libsqlite3_sys::SQLITE_PERM));
        }
        Ok(Box::new(self.base.open(name, flags)?))
    }

    fn excepthook(&self, failure: &Failure) {
        self.seen.lock().push(failure.to_string());
    }
}

#[test]
fn test_open_failure_reaches_caller_and_hook() {
    let store = VfsRegistration::new(unique("picky-store")).register(MemoryVfs::new()).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let vfs = VfsRegistration::new(unique("picky"))
        .register(Picky {
            base: store.as_base(),
            seen: Arc::clone(&seen),
        })
        .unwrap();

    let conn = vfs.open_connection("/allowed.db").unwrap();
    conn.execute("CREATE TABLE t (x)", []).unwrap();

    let failed = vfs
        .open_connection("/forbidden.db")
        .and_then(|conn| conn.execute("CREATE TABLE t (x)", []).map_err(VfsError::from));
    assert!(failed.is_err());

    let seen = seen.lock();
    assert!(seen.iter().any(|s| s.starts_with("xOpen") && s.contains("forbidden.db")));
}
