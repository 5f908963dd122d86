//! Transform-wrapper VFS
//!
//! [`TransformVfs`] inherits everything from a base VFS except `open`, and
//! wraps each base file so that page contents pass through a [`Transform`]
//! on their way to and from storage.

use crate::error::Result;
use crate::vfs::{BaseFile, BaseVfs, OpenFlags, Vfs, VfsFile};
use std::sync::Arc;

/// Reversible, length-preserving byte transform keyed on file offset.
pub trait Transform: Send + Sync + 'static {
    /// Applied to data before it is written at `offset`.
    fn encode(&self, data: &mut [u8], offset: u64);

    /// Applied to data read from `offset`.
    fn decode(&self, data: &mut [u8], offset: u64);
}

/// Xors every byte with a repeating key, aligned to the file offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XorTransform {
    key: Vec<u8>,
}

impl XorTransform {
    /// An empty key leaves data unchanged.
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    fn apply(&self, data: &mut [u8], offset: u64) {
        if self.key.is_empty() {
            return;
        }
        let len = self.key.len() as u64;
        for (i, byte) in data.iter_mut().enumerate() {
            *byte ^= self.key[((offset + i as u64) % len) as usize];
        }
    }
}

impl Transform for XorTransform {
    fn encode(&self, data: &mut [u8], offset: u64) {
        self.apply(data, offset);
    }

    fn decode(&self, data: &mut [u8], offset: u64) {
        self.apply(data, offset);
    }
}

/// A VFS that transforms file contents over a base VFS.
///
/// # Examples
///
/// ```rust,no_run
/// use layervfs::{BaseVfs, MemoryVfs, TransformVfs, VfsRegistration, XorTransform};
///
/// # fn main() -> layervfs::Result<()> {
/// let memory = VfsRegistration::new("xor-store").register(MemoryVfs::new())?;
/// let xor = TransformVfs::new(memory.as_base(), XorTransform::new(*b"secret"));
/// let vfs = VfsRegistration::new("xor").register(xor)?;
///
/// let conn = vfs.open_connection("hidden.db")?;
/// conn.execute_batch("CREATE TABLE t (x)")?;
/// # Ok(())
/// # }
/// ```
pub struct TransformVfs<T: Transform> {
    base: BaseVfs,
    transform: Arc<T>,
}

impl<T: Transform> TransformVfs<T> {
    pub fn new(base: BaseVfs, transform: T) -> Self {
        Self {
            base,
            transform: Arc::new(transform),
        }
    }

    /// Over the VFS registered as `base_name` (`""` for the default).
    pub fn over(base_name: &str, transform: T) -> Result<Self> {
        Ok(Self::new(BaseVfs::find(base_name)?, transform))
    }

    pub fn transform(&self) -> &T {
        &self.transform
    }
}

impl<T: Transform> Vfs for TransformVfs<T> {
    fn base(&self) -> Option<&BaseVfs> {
        Some(&self.base)
    }

    fn open(&self, name: Option<&str>, flags: &mut OpenFlags) -> Result<Box<dyn VfsFile>> {
        let file = self.base.open(name, flags)?;
        Ok(Box::new(TransformFile {
            base: file,
            transform: Arc::clone(&self.transform),
        }))
    }
}

/// File half of [`TransformVfs`]. Only `read` and `write` are overridden.
pub struct TransformFile<T: Transform> {
    base: BaseFile,
    transform: Arc<T>,
}

impl<T: Transform> VfsFile for TransformFile<T> {
    fn base(&mut self) -> Option<&mut BaseFile> {
        Some(&mut self.base)
    }

    fn read(&mut self, amount: usize, offset: u64) -> Result<Vec<u8>> {
        let mut data = self.base.read(amount, offset)?;
        self.transform.decode(&mut data, offset);
        Ok(data)
    }

    fn write(&mut self, data: &[u8], offset: u64) -> Result<()> {
        let mut encoded = data.to_vec();
        self.transform.encode(&mut encoded, offset);
        self.base.write(&encoded, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xor_is_its_own_inverse() {
        let xor = XorTransform::new(*b"key");
        let mut data = b"attack at dawn".to_vec();
        xor.encode(&mut data, 3);
        assert_ne!(&data[..], b"attack at dawn");
        xor.decode(&mut data, 3);
        assert_eq!(&data[..], b"attack at dawn");
    }

    #[test]
    fn test_xor_is_offset_aligned() {
        let xor = XorTransform::new(*b"abcd");
        let mut whole = vec![0u8; 8];
        xor.encode(&mut whole, 0);

        // Encoding the tail separately must match the tail of the whole
        let mut tail = vec![0u8; 5];
        xor.encode(&mut tail, 3);
        assert_eq!(&whole[3..], &tail[..]);
    }

    #[test]
    fn test_empty_key_is_identity() {
        let xor = XorTransform::new(Vec::new());
        let mut data = vec![1, 2, 3];
        xor.encode(&mut data, 0);
        assert_eq!(data, vec![1, 2, 3]);
    }
}
