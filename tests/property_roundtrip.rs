//! Property-based tests for the file trampolines
//!
//! Uses proptest to check write/read round-trips and short-read zero-fill
//! through registered VFSes.

use layervfs::{
    BaseVfs, MemoryVfs, OpenFlags, RegisteredVfs, TransformVfs, VfsRegistration, XorTransform,
};
use libsqlite3_sys as ffi;
use proptest::prelude::*;
use std::os::raw::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

fn rw_create() -> OpenFlags {
    OpenFlags::new(ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE | ffi::SQLITE_OPEN_MAIN_DB)
}

fn next_file() -> String {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    format!("/prop-{}", NEXT.fetch_add(1, Ordering::Relaxed))
}

struct Fixture {
    _store: RegisteredVfs,
    _xor: RegisteredVfs,
    store: BaseVfs,
    xor: BaseVfs,
}

// Registrations are shared by every case; each case uses a fresh file name
fn fixture() -> &'static Fixture {
    static FIXTURE: OnceLock<Fixture> = OnceLock::new();
    FIXTURE.get_or_init(|| {
        let store = VfsRegistration::new(format!("prop-store-{}", std::process::id()))
            .register(MemoryVfs::new())
            .unwrap();
        let xor = VfsRegistration::new(format!("prop-xor-{}", std::process::id()))
            .register(TransformVfs::new(store.as_base(), XorTransform::new(*b"prop")))
            .unwrap();
        Fixture {
            store: BaseVfs::find(store.name()).unwrap(),
            xor: BaseVfs::find(xor.name()).unwrap(),
            _store: store,
            _xor: xor,
        }
    })
}

proptest! {
    #[test]
    fn prop_write_then_read_round_trips(
        data in prop::collection::vec(any::<u8>(), 1..8192),
        offset in 0u64..65536,
    ) {
        for base in [&fixture().store, &fixture().xor] {
            let mut file = base.open(Some(&next_file()), &mut rw_create()).unwrap();
            file.write(&data, offset).unwrap();
            prop_assert_eq!(file.read(data.len(), offset).unwrap(), data.clone());
            prop_assert_eq!(file.file_size().unwrap(), offset + data.len() as u64);
            file.close().unwrap();
        }
    }

    #[test]
    fn prop_overlapping_writes_last_wins(
        first in prop::collection::vec(any::<u8>(), 64..512),
        second in prop::collection::vec(any::<u8>(), 1..64),
        at in 0u64..64,
    ) {
        let mut file = fixture().xor.open(Some(&next_file()), &mut rw_create()).unwrap();
        file.write(&first, 0).unwrap();
        file.write(&second, at).unwrap();

        let mut expected = first.clone();
        let start = at as usize;
        expected[start..start + second.len()].copy_from_slice(&second);
        prop_assert_eq!(file.read(first.len(), 0).unwrap(), expected);
    }

    #[test]
    fn prop_short_read_zero_fills_tail(
        mut content in prop::collection::vec(any::<u8>(), 1..1024),
        extra in 1usize..1024,
    ) {
        // Trailing zeros in the content would be trimmed as padding
        if let Some(last) = content.last_mut() {
            *last |= 1;
        }
        let wanted = content.len() + extra;

        let mut file = fixture().store.open(Some(&next_file()), &mut rw_create()).unwrap();
        file.write(&content, 0).unwrap();

        // Through the public read: the truncated content, not the padding
        prop_assert_eq!(file.read(wanted, 0).unwrap(), content.clone());

        // Through the raw method table: short-read status and a zeroed tail
        let mut buf = vec![0xffu8; wanted];
        let rc = unsafe {
            let raw = file.as_ptr();
            let read = (*(*raw).pMethods).xRead.unwrap();
            read(raw, buf.as_mut_ptr() as *mut c_void, wanted as i32, 0)
        };
        prop_assert_eq!(rc, ffi::SQLITE_IOERR_SHORT_READ);
        prop_assert_eq!(&buf[..content.len()], &content[..]);
        prop_assert!(buf[content.len()..].iter().all(|&b| b == 0));
    }
}
