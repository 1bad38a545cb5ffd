//! Key-value store over an embedded SQLite database.
//!
//! The connection is a raw `sqlite3*` owned by a [`UniqueHandle`]; statements
//! are owned the same way, so every exit path closes what was opened.

use std::ffi::{c_int, c_void, CString};
use std::fmt;
use std::ptr;
use std::slice;

use rusqlite::ffi;
use tracing::{debug, trace, warn};

use crate::config::KvConfig;
use crate::cursor::Cursor;
use crate::error::{KvError, KvResult};
use crate::handle::{HandleKind, UniqueHandle};

/// Kind for `sqlite3*` connections, released with `sqlite3_close`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Database;

impl HandleKind for Database {
    type Raw = *mut ffi::sqlite3;

    fn invalid(&self) -> Self::Raw {
        ptr::null_mut()
    }

    fn release(&mut self, raw: Self::Raw) {
        // SAFETY: raw is a connection this kind exclusively owns.
        let rc = unsafe { ffi::sqlite3_close(raw) };
        if rc != ffi::SQLITE_OK {
            warn!(code = rc, "sqlite3_close failed; connection leaked");
        }
    }
}

/// Kind for prepared statements, released with `sqlite3_finalize`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Statement;

impl HandleKind for Statement {
    type Raw = *mut ffi::sqlite3_stmt;

    fn invalid(&self) -> Self::Raw {
        ptr::null_mut()
    }

    fn release(&mut self, raw: Self::Raw) {
        // SAFETY: raw is a statement this kind exclusively owns. The return
        // code repeats the last step's error, which was already reported.
        unsafe { ffi::sqlite3_finalize(raw) };
    }
}

pub(crate) type StatementHandle = UniqueHandle<Statement>;

const LETTERS: &[u8; 26] = b"abcdefghijklmnopqrstuvwxyz";
/// Largest multiple of 26 that fits in a byte (9 * 26).
const UNIFORM_LIMIT: u8 = 234;

/// A key-value table in an SQLite database.
pub struct KvStore {
    db: UniqueHandle<Database>,
    table: String,
}

impl KvStore {
    /// Open (and unless read-only, create) the store described by `config`.
    pub fn open(config: &KvConfig) -> KvResult<Self> {
        config.validate()?;
        let path = CString::new(config.db_path.as_str())?;

        let mut db = UniqueHandle::<Database>::new();
        // SAFETY: the out-pointer targets the empty handle's slot; sqlite
        // writes a connection (possibly a failed one) into it.
        let rc = unsafe {
            ffi::sqlite3_open_v2(path.as_ptr(), db.as_out_ptr(), config.mode.flags(), ptr::null())
        };
        if rc != ffi::SQLITE_OK {
            // A failed open still allocates a connection; `db` closes it.
            return Err(KvError::from_code(db.get(), rc));
        }
        debug!(path = %config.db_path, mode = ?config.mode, "opened kv store");

        let store = Self {
            db,
            table: config.table.clone(),
        };
        if !config.mode.is_read_only() {
            store.exec(&format!(
                "CREATE TABLE IF NOT EXISTS {} (k BLOB PRIMARY KEY, v BLOB NOT NULL)",
                store.table
            ))?;
        }
        Ok(store)
    }

    pub fn open_in_memory() -> KvResult<Self> {
        Self::open(&KvConfig::in_memory())
    }

    /// The raw connection, still owned by the store.
    pub fn raw(&self) -> *mut ffi::sqlite3 {
        self.db.get()
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Insert or overwrite `key`.
    pub fn store(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> KvResult<()> {
        let (key, value) = (key.as_ref(), value.as_ref());
        trace!(key_len = key.len(), value_len = value.len(), "store");
        let sql = format!("INSERT OR REPLACE INTO {} (k, v) VALUES (?1, ?2)", self.table);
        let stmt = self.prepare(&sql)?;
        self.bind_blob(&stmt, 1, key)?;
        self.bind_blob(&stmt, 2, value)?;
        self.step_done(&stmt)
    }

    /// `store` with a formatted value: `store_fmt(k, format_args!("{}", x))`.
    pub fn store_fmt(&self, key: impl AsRef<[u8]>, args: fmt::Arguments<'_>) -> KvResult<()> {
        self.store(key, args.to_string())
    }

    /// Create `key` with `bytes`, or concatenate `bytes` onto its value.
    pub fn append(&self, key: impl AsRef<[u8]>, bytes: impl AsRef<[u8]>) -> KvResult<()> {
        let (key, bytes) = (key.as_ref(), bytes.as_ref());
        trace!(key_len = key.len(), bytes = bytes.len(), "append");
        let sql = format!(
            "INSERT INTO {t} (k, v) VALUES (?1, ?2) \
             ON CONFLICT(k) DO UPDATE SET v = CAST({t}.v || excluded.v AS BLOB)",
            t = self.table
        );
        let stmt = self.prepare(&sql)?;
        self.bind_blob(&stmt, 1, key)?;
        self.bind_blob(&stmt, 2, bytes)?;
        self.step_done(&stmt)
    }

    pub fn append_fmt(&self, key: impl AsRef<[u8]>, args: fmt::Arguments<'_>) -> KvResult<()> {
        self.append(key, args.to_string())
    }

    /// Remove `key`. Returns [`KvError::NotFound`] if it was absent.
    pub fn delete(&self, key: impl AsRef<[u8]>) -> KvResult<()> {
        let key = key.as_ref();
        let sql = format!("DELETE FROM {} WHERE k = ?1", self.table);
        let stmt = self.prepare(&sql)?;
        self.bind_blob(&stmt, 1, key)?;
        self.step_done(&stmt)?;
        // SAFETY: live connection.
        if unsafe { ffi::sqlite3_changes(self.raw()) } == 0 {
            return Err(KvError::NotFound);
        }
        Ok(())
    }

    pub fn fetch(&self, key: impl AsRef<[u8]>) -> KvResult<Option<Vec<u8>>> {
        let sql = format!("SELECT v FROM {} WHERE k = ?1", self.table);
        let stmt = self.prepare(&sql)?;
        self.bind_blob(&stmt, 1, key.as_ref())?;
        if !self.step(&stmt)? {
            return Ok(None);
        }
        // SAFETY: the statement is on a row; the bytes are copied before
        // `stmt` is stepped or finalized.
        let value = unsafe { column_bytes(stmt.get(), 0) }.to_vec();
        Ok(Some(value))
    }

    /// Fill `buf` with random lowercase ASCII letters from the engine's PRNG.
    pub fn random_string(&self, buf: &mut [u8]) -> KvResult<()> {
        if buf.is_empty() {
            return Err(KvError::EmptyBuffer);
        }
        let len = c_int::try_from(buf.len()).map_err(|_| KvError::TooLarge(buf.len()))?;
        // SAFETY: buf is writable for len bytes.
        unsafe { ffi::sqlite3_randomness(len, buf.as_mut_ptr().cast::<c_void>()) };
        for b in buf.iter_mut() {
            // Redraw bytes at or above UNIFORM_LIMIT so every letter is
            // equally likely.
            while *b >= UNIFORM_LIMIT {
                // SAFETY: b is a single writable byte.
                unsafe { ffi::sqlite3_randomness(1, (&mut *b as *mut u8).cast::<c_void>()) };
            }
            *b = LETTERS[usize::from(*b) % LETTERS.len()];
        }
        Ok(())
    }

    pub fn begin(&self) -> KvResult<()> {
        self.exec("BEGIN")
    }

    pub fn commit(&self) -> KvResult<()> {
        self.exec("COMMIT")
    }

    pub fn rollback(&self) -> KvResult<()> {
        self.exec("ROLLBACK")
    }

    /// Cursor over all records, last key first.
    pub fn cursor(&self) -> KvResult<Cursor<'_>> {
        let sql = format!("SELECT k, v FROM {} ORDER BY k DESC", self.table);
        let stmt = self.prepare(&sql)?;
        Ok(Cursor::new(self, stmt))
    }

    /// Close now and report the engine's status, instead of leaving it to
    /// `Drop`, which can only log a failure.
    ///
    /// Fails with `SQLITE_BUSY` while statements prepared on [`raw`](Self::raw)
    /// are still alive.
    pub fn close(mut self) -> KvResult<()> {
        let raw = self.db.release();
        // SAFETY: ownership of raw was just taken from the handle. Cursors
        // borrow `self`, but statements prepared through `raw()` may not be
        // finalized yet.
        let rc = unsafe { ffi::sqlite3_close(raw) };
        if rc != ffi::SQLITE_OK {
            let err = KvError::from_code(raw, rc);
            // SQLITE_BUSY leaves the connection open; it is owned again so
            // Drop makes the final attempt.
            self.db.reset(raw);
            return Err(err);
        }
        debug!(table = %self.table, "closed kv store");
        Ok(())
    }

    fn exec(&self, sql: &str) -> KvResult<()> {
        let sql = CString::new(sql)?;
        // SAFETY: live connection, NUL-terminated SQL, no callback.
        let rc = unsafe {
            ffi::sqlite3_exec(self.raw(), sql.as_ptr(), None, ptr::null_mut(), ptr::null_mut())
        };
        self.check(rc)
    }

    pub(crate) fn prepare(&self, sql: &str) -> KvResult<StatementHandle> {
        let sql = CString::new(sql)?;
        let mut stmt = StatementHandle::new();
        // SAFETY: live connection; sqlite writes the statement (or null)
        // into the empty handle's slot.
        let rc = unsafe {
            ffi::sqlite3_prepare_v2(self.raw(), sql.as_ptr(), -1, stmt.as_out_ptr(), ptr::null_mut())
        };
        self.check(rc)?;
        Ok(stmt)
    }

    fn bind_blob(&self, stmt: &StatementHandle, index: c_int, data: &[u8]) -> KvResult<()> {
        let len = c_int::try_from(data.len()).map_err(|_| KvError::TooLarge(data.len()))?;
        // SAFETY: SQLITE_TRANSIENT makes sqlite copy the bytes before
        // returning, so `data` need not outlive the statement.
        let rc = unsafe {
            ffi::sqlite3_bind_blob(
                stmt.get(),
                index,
                data.as_ptr().cast::<c_void>(),
                len,
                ffi::SQLITE_TRANSIENT(),
            )
        };
        self.check(rc)
    }

    /// Step once. `true` when a row is available, `false` when done.
    pub(crate) fn step(&self, stmt: &StatementHandle) -> KvResult<bool> {
        // SAFETY: stmt is a live statement prepared on this connection.
        match unsafe { ffi::sqlite3_step(stmt.get()) } {
            ffi::SQLITE_ROW => Ok(true),
            ffi::SQLITE_DONE => Ok(false),
            rc => Err(KvError::from_code(self.raw(), rc)),
        }
    }

    fn step_done(&self, stmt: &StatementHandle) -> KvResult<()> {
        self.step(stmt).map(|_| ())
    }

    fn check(&self, rc: c_int) -> KvResult<()> {
        if rc == ffi::SQLITE_OK {
            Ok(())
        } else {
            Err(KvError::from_code(self.raw(), rc))
        }
    }
}

impl fmt::Debug for KvStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvStore")
            .field("db", &self.db)
            .field("table", &self.table)
            .finish()
    }
}

/// Bytes of column `index` on the current row.
///
/// # Safety
/// `stmt` must be positioned on a row. The slice is only valid until the
/// statement is next stepped, reset or finalized.
pub(crate) unsafe fn column_bytes<'a>(stmt: *mut ffi::sqlite3_stmt, index: c_int) -> &'a [u8] {
    let data = ffi::sqlite3_column_blob(stmt, index);
    let len = ffi::sqlite3_column_bytes(stmt, index);
    if data.is_null() || len <= 0 {
        return &[];
    }
    slice::from_raw_parts(data.cast::<u8>(), len as usize)
}
