//! SQLite VFS multi-connection concurrency tests
//!
//! Several connections sharing one file through a layered stack: memory
//! store at the bottom, XOR transform on top.

use layervfs::{MemoryVfs, RegisteredVfs, TransformVfs, VfsRegistration, XorTransform};
use rusqlite::{Connection, ErrorCode};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn unique(prefix: &str) -> String {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    format!("{}-{}-{}", prefix, std::process::id(), NEXT.fetch_add(1, Ordering::Relaxed))
}

fn layered() -> (MemoryVfs, RegisteredVfs, RegisteredVfs) {
    let memory = MemoryVfs::new();
    let store = VfsRegistration::new(unique("multi-store"))
        .register(memory.clone())
        .unwrap();
    let xor = VfsRegistration::new(unique("multi-xor"))
        .register(TransformVfs::new(store.as_base(), XorTransform::new(*b"multi")))
        .unwrap();
    (memory, store, xor)
}

#[test]
fn test_sequential_connections_see_each_others_writes() {
    let (_memory, _store, xor) = layered();

    let writer = xor.open_connection("/db.sqlite").unwrap();
    writer
        .execute_batch("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1);")
        .unwrap();

    let reader = xor.open_connection("/db.sqlite").unwrap();
    for round in 2..12 {
        writer.execute("INSERT INTO t VALUES (?)", [round]).unwrap();
        let count: i64 = reader
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, round);
    }
}

#[test]
fn test_open_read_transaction_blocks_commit() {
    let (_memory, _store, xor) = layered();

    let writer = xor.open_connection("/db.sqlite").unwrap();
    writer.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();
    writer.busy_timeout(Duration::ZERO).unwrap();

    let mut reader: Connection = xor.open_connection("/db.sqlite").unwrap();
    let tx = reader.transaction().unwrap();
    let count: i64 = tx
        .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 0);

    match writer.execute("INSERT INTO t VALUES (1)", []) {
        Err(rusqlite::Error::SqliteFailure(e, _)) => assert_eq!(e.code, ErrorCode::DatabaseBusy),
        other => panic!("expected busy, got {:?}", other),
    }

    tx.commit().unwrap();
    writer.execute("INSERT INTO t VALUES (2)", []).unwrap();

    let count: i64 = reader
        .query_row("SELECT COUNT(*) FROM t WHERE x = 2", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 1);
}

#[test]
fn test_concurrent_connections_through_layers() {
    let (_memory, _store, xor) = layered();
    let name = xor.name().to_string();

    let setup = xor.open_connection("/db.sqlite").unwrap();
    setup
        .execute_batch("CREATE TABLE t (thread INTEGER, item INTEGER)")
        .unwrap();

    let handles: Vec<_> = (0..5)
        .map(|thread_id: i64| {
            let name = name.clone();
            std::thread::spawn(move || {
                let conn = Connection::open_with_flags_and_vfs(
                    "/db.sqlite",
                    rusqlite::OpenFlags::default(),
                    name.as_str(),
                )
                .unwrap();
                conn.busy_timeout(Duration::from_secs(10)).unwrap();
                for item in 0..20 {
                    conn.execute("INSERT INTO t VALUES (?, ?)", [thread_id, item])
                        .unwrap();
                    let _: i64 = conn
                        .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
                        .unwrap();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let count: i64 = setup
        .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 100);
}

#[test]
fn test_store_is_clean_after_connections_close() {
    let (memory, _store, xor) = layered();
    {
        let a = xor.open_connection("/db.sqlite").unwrap();
        let b = xor.open_connection("/db.sqlite").unwrap();
        a.execute_batch("CREATE TABLE t (x); INSERT INTO t VALUES (1);")
            .unwrap();
        b.execute("INSERT INTO t VALUES (2)", []).unwrap();
    }

    // Only the database itself remains once the journals are gone
    assert_eq!(memory.paths(), vec![String::from("/db.sqlite")]);
    let stored = memory.contents("/db.sqlite").unwrap();
    assert!(!stored.starts_with(b"SQLite format 3\0"));
}
