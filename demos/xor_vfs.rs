//! Layered VFS demo
//!
//! Registers an in-memory store, stacks an XOR transform on top of it, runs
//! some SQL through the top layer and shows what actually landed in the store.
//!
//! Run with: cargo run --example xor_vfs

use layervfs::{MemoryVfs, TransformVfs, VfsConfig, VfsRegistration, XorTransform};

const STORE_CONFIG: &str = r#"
name = "demo-store"
max_pathname = 512
"#;

const XOR_CONFIG: &str = r#"
name = "demo-xor"
base = "demo-store"
"#;

fn main() -> anyhow::Result<()> {
    let config = VfsConfig::from_toml_str(STORE_CONFIG)?;
    let memory = MemoryVfs::new();
    let store = VfsRegistration::from_config(&config)?.register(memory.clone())?;
    println!("registered {} (max pathname {})", store.name(), store.max_pathname());

    let xor_config = VfsConfig::from_toml_str(XOR_CONFIG)?;
    let base = xor_config
        .resolve_base()?
        .ok_or_else(|| anyhow::anyhow!("{} needs a base", xor_config.name))?;
    let xor = VfsRegistration::from_config(&xor_config)?
        .register(TransformVfs::new(base, XorTransform::new(*b"layervfs")))?;
    println!("registered {} over {}", xor.name(), store.name());

    let conn = xor.open_connection("/notes.db")?;
    conn.execute_batch(
        "CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT);
         INSERT INTO notes (body) VALUES ('first'), ('second'), ('third');",
    )?;

    let mut stmt = conn.prepare("SELECT id, body FROM notes ORDER BY id")?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;
    for row in rows {
        let (id, body) = row?;
        println!("  {id}: {body}");
    }
    drop(stmt);
    drop(conn);

    let stored = memory.contents("/notes.db").unwrap_or_default();
    let header: String = stored.iter().take(16).map(|b| format!("{b:02x}")).collect();
    println!("stored bytes: {} total, header {}", stored.len(), header);
    println!(
        "plain sqlite header visible in store: {}",
        stored.starts_with(b"SQLite format 3\0")
    );

    xor.unregister()?;
    store.unregister()?;
    Ok(())
}
