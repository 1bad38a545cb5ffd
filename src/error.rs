use std::ffi::{c_int, CStr, NulError};

use rusqlite::ffi;
use thiserror::Error;

/// Errors reported by the key-value bindings. The handle wrapper itself never
/// produces one; these always originate in the engine or in argument checks.
#[derive(Debug, Error)]
pub enum KvError {
    /// The engine returned a non-OK status.
    #[error("sqlite error {code}: {message}")]
    Sqlite { code: c_int, message: String },

    #[error("key not found")]
    NotFound,

    /// A cursor read was attempted while not positioned on a record.
    #[error("cursor is not positioned on an entry")]
    NoEntry,

    #[error("invalid table name: {0:?}")]
    InvalidTable(String),

    #[error("{0} bytes exceeds the engine's length limit")]
    TooLarge(usize),

    #[error("random string buffer is empty")]
    EmptyBuffer,

    #[error("path or statement contains a NUL byte: {0}")]
    Nul(#[from] NulError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type KvResult<T> = Result<T, KvError>;

impl KvError {
    /// Build an error from a status code, pulling the message from `db` when
    /// there is one.
    pub(crate) fn from_code(db: *mut ffi::sqlite3, code: c_int) -> Self {
        let message = if db.is_null() {
            errstr(code)
        } else {
            // SAFETY: db is a live connection; the message is copied before
            // any further call on it.
            unsafe { CStr::from_ptr(ffi::sqlite3_errmsg(db)) }
                .to_string_lossy()
                .into_owned()
        };
        KvError::Sqlite { code, message }
    }

    /// The engine status code, if this error carries one.
    pub fn code(&self) -> Option<c_int> {
        match self {
            KvError::Sqlite { code, .. } => Some(*code),
            _ => None,
        }
    }
}

fn errstr(code: c_int) -> String {
    // SAFETY: sqlite3_errstr returns a static string for any code.
    unsafe { CStr::from_ptr(ffi::sqlite3_errstr(code)) }
        .to_string_lossy()
        .into_owned()
}
