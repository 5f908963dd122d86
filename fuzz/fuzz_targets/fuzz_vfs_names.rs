#![no_main]
use layervfs::{AccessKind, BaseVfs, MemoryVfs, OpenFlags, RegisteredVfs, VfsRegistration};
use libfuzzer_sys::fuzz_target;
use std::sync::OnceLock;

// Arbitrary names and flags through the VFS-level trampolines
fuzz_target!(|input: (String, i32, u16)| {
    static VFS: OnceLock<(RegisteredVfs, BaseVfs)> = OnceLock::new();
    let (_, native) = VFS.get_or_init(|| {
        let vfs = VfsRegistration::new("fuzz-names")
            .register(MemoryVfs::new())
            .expect("register fuzz VFS");
        let native = BaseVfs::find(vfs.name()).expect("find fuzz VFS");
        (vfs, native)
    });

    let (name, flags, amount) = input;
    let _ = native.access(&name, AccessKind::Exists);
    let _ = native.full_pathname(&name);
    let _ = native.randomness(amount as usize);

    let mut open_flags = OpenFlags::new(flags & 0x7f);
    if let Ok(mut file) = native.open(Some(&name), &mut open_flags) {
        let _ = file.read(amount as usize, 0);
        let _ = file.close();
    }
    let _ = native.delete(&name, false);
});
