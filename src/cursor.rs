use std::fmt;

use rusqlite::ffi;

use crate::error::{KvError, KvResult};
use crate::kv::{column_bytes, KvStore, StatementHandle};

/// Ordered traversal of a [`KvStore`], from the last key backwards.
///
/// The underlying statement is finalized when the cursor is dropped. The
/// cursor borrows its store, so the connection always outlives it.
pub struct Cursor<'a> {
    store: &'a KvStore,
    stmt: StatementHandle,
    on_entry: bool,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(store: &'a KvStore, stmt: StatementHandle) -> Self {
        Self {
            store,
            stmt,
            on_entry: false,
        }
    }

    /// Position on the last record. Leaves the cursor invalid when the store
    /// is empty.
    pub fn seek_last(&mut self) -> KvResult<()> {
        // SAFETY: live statement owned by this cursor.
        unsafe { ffi::sqlite3_reset(self.stmt.get()) };
        self.advance()
    }

    /// Step to the previous record. A no-op once the cursor is invalid.
    pub fn prev(&mut self) -> KvResult<()> {
        if !self.on_entry {
            return Ok(());
        }
        self.advance()
    }

    pub fn is_valid_entry(&self) -> bool {
        self.on_entry
    }

    pub fn key(&self) -> KvResult<&[u8]> {
        self.column(0)
    }

    pub fn value(&self) -> KvResult<&[u8]> {
        self.column(1)
    }

    pub fn value_len(&self) -> KvResult<usize> {
        self.value().map(<[u8]>::len)
    }

    /// Hand the current key to `consume`.
    pub fn read_key<R>(&self, consume: impl FnOnce(&[u8]) -> R) -> KvResult<R> {
        self.key().map(consume)
    }

    /// Hand the current value to `consume`.
    pub fn read_value<R>(&self, consume: impl FnOnce(&[u8]) -> R) -> KvResult<R> {
        self.value().map(consume)
    }

    fn advance(&mut self) -> KvResult<()> {
        self.on_entry = false;
        self.on_entry = self.store.step(&self.stmt)?;
        Ok(())
    }

    fn column(&self, index: i32) -> KvResult<&[u8]> {
        if !self.on_entry {
            return Err(KvError::NoEntry);
        }
        // SAFETY: on a row; stepping needs `&mut self`, which the returned
        // borrow prevents.
        Ok(unsafe { column_bytes(self.stmt.get(), index) })
    }
}

impl fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("stmt", &self.stmt)
            .field("on_entry", &self.on_entry)
            .finish()
    }
}
