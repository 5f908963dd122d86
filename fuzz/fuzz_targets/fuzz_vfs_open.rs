#![no_main]
use layervfs::{MemoryVfs, RegisteredVfs, VfsRegistration};
use libfuzzer_sys::fuzz_target;
use std::sync::OnceLock;

// Arbitrary bytes as a database image, queried through the adapter
fuzz_target!(|data: &[u8]| {
    static VFS: OnceLock<(MemoryVfs, RegisteredVfs)> = OnceLock::new();
    let (memory, vfs) = VFS.get_or_init(|| {
        let memory = MemoryVfs::new();
        let vfs = VfsRegistration::new("fuzz-open")
            .register(memory.clone())
            .expect("register fuzz VFS");
        (memory, vfs)
    });

    memory.insert("/fuzz.db", data.to_vec());
    if let Ok(conn) = vfs.open_connection("/fuzz.db") {
        let _ = conn.query_row("PRAGMA integrity_check", [], |row| row.get::<_, String>(0));
        let _ = conn.execute_batch("SELECT * FROM sqlite_schema; CREATE TABLE IF NOT EXISTS f (x);");
    }
    for path in memory.paths() {
        let _ = layervfs::Vfs::delete(memory, &path, false);
    }
});
