//! Value types shared by the statement and function surfaces.

use libsqlite3_sys as ffi;
use std::fmt;

/// Storage class of a column or argument value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// 64-bit signed integer.
    Integer,
    /// IEEE double.
    Float,
    /// UTF-8 text.
    Text,
    /// Raw bytes.
    Blob,
    /// SQL NULL.
    Null,
}

impl ValueType {
    /// Converts the engine's fundamental datatype code.
    ///
    /// Codes outside the five fundamental types are treated as `Null`.
    #[must_use]
    pub const fn from_raw(raw: i32) -> Self {
        match raw {
            ffi::SQLITE_INTEGER => Self::Integer,
            ffi::SQLITE_FLOAT => Self::Float,
            ffi::SQLITE_TEXT => Self::Text,
            ffi::SQLITE_BLOB => Self::Blob,
            _ => Self::Null,
        }
    }

    /// Returns the engine's datatype code.
    #[must_use]
    pub const fn raw(self) -> i32 {
        match self {
            Self::Integer => ffi::SQLITE_INTEGER,
            Self::Float => ffi::SQLITE_FLOAT,
            Self::Text => ffi::SQLITE_TEXT,
            Self::Blob => ffi::SQLITE_BLOB,
            Self::Null => ffi::SQLITE_NULL,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Integer => "INTEGER",
            Self::Float => "REAL",
            Self::Text => "TEXT",
            Self::Blob => "BLOB",
            Self::Null => "NULL",
        };
        f.write_str(name)
    }
}

/// Catalog facts about one result column.
///
/// Columns that do not come straight from a table column (expressions,
/// literals) report all three as `false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ColumnMetadata {
    /// Declared `NOT NULL`.
    pub not_null: bool,
    /// Part of the primary key.
    pub primary_key: bool,
    /// Declared `AUTOINCREMENT`.
    pub auto_increment: bool,
}

impl ColumnMetadata {
    /// Returns the tuple `(not_null, primary_key, auto_increment)`.
    #[must_use]
    pub const fn as_tuple(self) -> (bool, bool, bool) {
        (self.not_null, self.primary_key, self.auto_increment)
    }
}

/// Row change reported by the update hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateKind {
    /// Row inserted.
    Insert,
    /// Row updated.
    Update,
    /// Row deleted.
    Delete,
}

impl UpdateKind {
    /// Converts the engine's authorizer opcode.
    #[must_use]
    pub const fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            ffi::SQLITE_INSERT => Some(Self::Insert),
            ffi::SQLITE_UPDATE => Some(Self::Update),
            ffi::SQLITE_DELETE => Some(Self::Delete),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_type_codes() {
        for ty in [
            ValueType::Integer,
            ValueType::Float,
            ValueType::Text,
            ValueType::Blob,
            ValueType::Null,
        ] {
            assert_eq!(ValueType::from_raw(ty.raw()), ty);
        }
        assert_eq!(ValueType::from_raw(42), ValueType::Null);
        assert_eq!(ValueType::Float.to_string(), "REAL");
    }

    #[test]
    fn update_kinds() {
        assert_eq!(UpdateKind::from_raw(ffi::SQLITE_INSERT), Some(UpdateKind::Insert));
        assert_eq!(UpdateKind::from_raw(ffi::SQLITE_DELETE), Some(UpdateKind::Delete));
        assert_eq!(UpdateKind::from_raw(0), None);
    }

    #[test]
    fn metadata_tuple() {
        assert_eq!(ColumnMetadata::default().as_tuple(), (false, false, false));
    }
}
