#![no_main]
use layervfs::{BaseVfs, MemoryVfs, OpenFlags, RegisteredVfs, TransformVfs, VfsRegistration, XorTransform};
use libfuzzer_sys::{arbitrary::{Arbitrary, Unstructured}, fuzz_target};
use std::sync::OnceLock;

#[derive(Debug, Arbitrary)]
enum FileOp {
    Write { offset: u16, data: Vec<u8> },
    Read { offset: u16, amount: u16 },
    Truncate { size: u16 },
    Size,
}

struct Fixture {
    _store: RegisteredVfs,
    _xor: RegisteredVfs,
    xor: BaseVfs,
}

// Random file operations through two adapter layers, checked against a model
fuzz_target!(|input: &[u8]| {
    static FIXTURE: OnceLock<Fixture> = OnceLock::new();
    let fixture = FIXTURE.get_or_init(|| {
        let store = VfsRegistration::new("fuzz-rw-store")
            .register(MemoryVfs::new())
            .expect("register store");
        let xor = VfsRegistration::new("fuzz-rw-xor")
            .register(TransformVfs::new(store.as_base(), XorTransform::new(*b"fuzz")))
            .expect("register xor");
        Fixture {
            xor: BaseVfs::find(xor.name()).expect("find xor"),
            _store: store,
            _xor: xor,
        }
    });

    let mut u = Unstructured::new(input);
    let ops: Vec<FileOp> = match u.arbitrary() {
        Ok(ops) => ops,
        Err(_) => return,
    };

    let mut flags = OpenFlags::new(
        libsqlite3_sys::SQLITE_OPEN_READWRITE
            | libsqlite3_sys::SQLITE_OPEN_CREATE
            | libsqlite3_sys::SQLITE_OPEN_DELETEONCLOSE,
    );
    let Ok(mut file) = fixture.xor.open(Some("/fuzz-rw"), &mut flags) else {
        return;
    };
    // Gaps read back as whatever the transform makes of zeros, so only
    // written bytes are compared
    let mut model: Vec<Option<u8>> = Vec::new();

    for op in ops.iter().take(64) {
        match op {
            FileOp::Write { offset, data } => {
                if data.is_empty() {
                    continue;
                }
                let offset = *offset as usize;
                file.write(data, offset as u64).expect("write");
                if model.len() < offset + data.len() {
                    model.resize(offset + data.len(), None);
                }
                for (slot, byte) in model[offset..offset + data.len()].iter_mut().zip(data) {
                    *slot = Some(*byte);
                }
            }
            FileOp::Read { offset, amount } => {
                let offset = *offset as usize;
                let amount = *amount as usize;
                let got = file.read(amount, offset as u64).expect("read");
                let end = (offset + amount).min(model.len());
                let expected = if offset < end { &model[offset..end] } else { &[][..] };
                assert!(got.len() <= expected.len());
                for (byte, slot) in got.iter().zip(expected) {
                    if let Some(written) = slot {
                        assert_eq!(byte, written);
                    }
                }
            }
            FileOp::Truncate { size } => {
                file.truncate(*size as u64).expect("truncate");
                model.resize(*size as usize, None);
            }
            FileOp::Size => {
                assert_eq!(file.file_size().expect("size"), model.len() as u64);
            }
        }
    }
    file.close().expect("close");
});
