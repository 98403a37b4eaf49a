//! Per-connection callback registry.
//!
//! Tracks which callbacks are currently installed on a connection. Removing
//! or replacing an entry only forgets it here: the trampolines stay alive in
//! the connection's arena until the connection closes.

use crate::trampoline::{CallbackTarget, Trampoline};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// What a registration is installed as.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RegistryKey {
    /// A user function, by lower-cased name and arity (-1 = variadic).
    Function {
        /// Lower-cased function name.
        name: String,
        /// Declared argument count.
        arity: i32,
    },
    /// A collation, by lower-cased name.
    Collation(String),
    /// The busy handler.
    Busy,
    /// The commit hook.
    Commit,
    /// The rollback hook.
    Rollback,
    /// The update hook.
    Update,
    /// The progress handler.
    Progress,
}

impl RegistryKey {
    /// Key for a function. Function names are case-insensitive.
    pub fn function(name: &str, arity: i32) -> Self {
        Self::Function {
            name: name.to_ascii_lowercase(),
            arity,
        }
    }

    /// Key for a collation. Collation names are case-insensitive.
    pub fn collation(name: &str) -> Self {
        Self::Collation(name.to_ascii_lowercase())
    }
}

/// An installed callback: the target object and its trampolines.
#[derive(Clone)]
pub struct Registration {
    /// The bound callback object.
    pub target: Arc<dyn CallbackTarget>,
    /// Trampolines handed to the engine for this entry.
    pub trampolines: Vec<Trampoline>,
}

impl Registration {
    /// Creates a registration.
    pub fn new(target: Arc<dyn CallbackTarget>, trampolines: Vec<Trampoline>) -> Self {
        Self {
            target,
            trampolines,
        }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("target", &self.target.target_name())
            .field("trampolines", &self.trampolines)
            .finish()
    }
}

/// Installed callbacks of one connection.
#[derive(Debug, Default)]
pub struct CallbackRegistry {
    entries: HashMap<RegistryKey, Registration>,
}

impl CallbackRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `registration`, returning the one it replaced.
    pub fn insert(&mut self, key: RegistryKey, registration: Registration) -> Option<Registration> {
        self.entries.insert(key, registration)
    }

    /// Forgets an entry.
    pub fn remove(&mut self, key: &RegistryKey) -> Option<Registration> {
        self.entries.remove(key)
    }

    /// Looks up an entry.
    pub fn get(&self, key: &RegistryKey) -> Option<&Registration> {
        self.entries.get(key)
    }

    /// Returns true if `key` is installed.
    pub fn contains(&self, key: &RegistryKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Installed functions as `(name, arity)`.
    pub fn functions(&self) -> Vec<(String, i32)> {
        self.entries
            .keys()
            .filter_map(|key| match key {
                RegistryKey::Function { name, arity } => Some((name.clone(), *arity)),
                _ => None,
            })
            .collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is installed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
