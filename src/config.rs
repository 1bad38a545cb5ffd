use std::ffi::c_int;

use rusqlite::ffi;
use serde::{Deserialize, Serialize};

use crate::error::{KvError, KvResult};

pub const DEFAULT_TABLE: &str = "kv";
pub const MEMORY_PATH: &str = ":memory:";

/// How the database file is opened.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenMode {
    /// Read-write, creating the file if it does not exist.
    #[default]
    Create,
    /// Read-write; the file must already exist.
    ReadWrite,
    ReadOnly,
    /// Private in-memory database; the path is ignored.
    Memory,
}

impl OpenMode {
    pub(crate) fn flags(self) -> c_int {
        let base = match self {
            OpenMode::Create => ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE,
            OpenMode::ReadWrite => ffi::SQLITE_OPEN_READWRITE,
            OpenMode::ReadOnly => ffi::SQLITE_OPEN_READONLY,
            OpenMode::Memory => {
                ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE | ffi::SQLITE_OPEN_MEMORY
            }
        };
        // Connections are confined to one thread by the bindings' types.
        base | ffi::SQLITE_OPEN_NOMUTEX
    }

    pub fn is_read_only(self) -> bool {
        self == OpenMode::ReadOnly
    }
}

/// Key-value store configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvConfig {
    /// Path to the database file
    pub db_path: String,
    #[serde(default)]
    pub mode: OpenMode,
    /// Table holding the records
    #[serde(default = "default_table")]
    pub table: String,
}

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

impl KvConfig {
    pub fn new(db_path: impl Into<String>) -> Self {
        Self {
            db_path: db_path.into(),
            mode: OpenMode::default(),
            table: default_table(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MEMORY_PATH).with_mode(OpenMode::Memory)
    }

    pub fn with_mode(mut self, mode: OpenMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Checks the table name is a plain identifier; it is spliced into SQL.
    pub fn validate(&self) -> KvResult<()> {
        let mut chars = self.table.chars();
        let head_ok = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        if head_ok && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            Ok(())
        } else {
            Err(KvError::InvalidTable(self.table.clone()))
        }
    }
}
