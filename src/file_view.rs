//! Read-only whole-file buffers handed out as raw `(pointer, length)` pairs.

use std::fs;
use std::io;
use std::path::Path;
use std::ptr;
use std::slice;

use tracing::debug;

use crate::error::KvResult;
use crate::handle::{HandleKind, UniqueHandle};

/// Load the whole file at `path` into a buffer owned by the caller.
///
/// The pair must be given back to [`release_file`] exactly once.
pub fn load_file(path: impl AsRef<Path>) -> io::Result<(*mut u8, usize)> {
    let bytes = fs::read(path)?.into_boxed_slice();
    let len = bytes.len();
    Ok((Box::into_raw(bytes).cast::<u8>(), len))
}

/// Free a buffer from [`load_file`].
///
/// # Safety
/// `(raw, len)` must come from a single `load_file` call and not have been
/// released already.
pub unsafe fn release_file(raw: *mut u8, len: usize) {
    drop(Box::from_raw(ptr::slice_from_raw_parts_mut(raw, len)));
}

/// Kind for [`load_file`] buffers. The length is captured when the buffer is
/// bound, since the release call needs it.
#[derive(Debug, Clone, Copy)]
pub struct FileBuffer {
    len: usize,
}

impl HandleKind for FileBuffer {
    type Raw = *mut u8;

    fn invalid(&self) -> Self::Raw {
        ptr::null_mut()
    }

    fn release(&mut self, raw: Self::Raw) {
        // SAFETY: the handle owns raw, and `len` was recorded alongside it.
        unsafe { release_file(raw, self.len) };
    }
}

/// An owned, read-only copy of a file's contents.
#[derive(Debug)]
pub struct FileView {
    buf: UniqueHandle<FileBuffer>,
}

impl FileView {
    /// Load the file at `path`. Read failures surface as [`KvError::Io`].
    ///
    /// [`KvError::Io`]: crate::KvError::Io
    pub fn load(path: impl AsRef<Path>) -> KvResult<Self> {
        let path = path.as_ref();
        let (raw, len) = load_file(path)?;
        debug!(path = %path.display(), len, "loaded file view");
        Ok(Self {
            buf: UniqueHandle::with_kind(FileBuffer { len }, raw),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: the handle owns a live buffer of exactly `len` bytes.
        unsafe { slice::from_raw_parts(self.buf.get(), self.len()) }
    }

    pub fn len(&self) -> usize {
        self.buf.kind().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hand the buffer back as a raw pair; pass it to [`release_file`] later.
    pub fn into_raw(mut self) -> (*mut u8, usize) {
        let len = self.len();
        (self.buf.release(), len)
    }
}

impl AsRef<[u8]> for FileView {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}
