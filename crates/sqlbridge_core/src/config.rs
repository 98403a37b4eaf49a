//! Bridge configuration.

use libsqlite3_sys as ffi;
use std::ops::BitOr;
use std::time::Duration;

/// Flags passed to the native open call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpenFlags(i32);

impl OpenFlags {
    /// Open read-only.
    pub const READ_ONLY: Self = Self(ffi::SQLITE_OPEN_READONLY);
    /// Open read-write.
    pub const READ_WRITE: Self = Self(ffi::SQLITE_OPEN_READWRITE);
    /// Create the file if it does not exist.
    pub const CREATE: Self = Self(ffi::SQLITE_OPEN_CREATE);
    /// Interpret the path as a URI.
    pub const URI: Self = Self(ffi::SQLITE_OPEN_URI);
    /// Open an in-memory database.
    pub const MEMORY: Self = Self(ffi::SQLITE_OPEN_MEMORY);
    /// Multi-thread mode.
    pub const NO_MUTEX: Self = Self(ffi::SQLITE_OPEN_NOMUTEX);
    /// Serialized mode.
    pub const FULL_MUTEX: Self = Self(ffi::SQLITE_OPEN_FULLMUTEX);
    /// Enable shared cache for this connection.
    pub const SHARED_CACHE: Self = Self(ffi::SQLITE_OPEN_SHAREDCACHE);
    /// Disable shared cache for this connection.
    pub const PRIVATE_CACHE: Self = Self(ffi::SQLITE_OPEN_PRIVATECACHE);

    /// Creates flags from raw bits.
    pub const fn from_bits(bits: i32) -> Self {
        Self(bits)
    }

    /// Returns the raw bits.
    pub const fn bits(self) -> i32 {
        self.0
    }

    /// Returns true if every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns these flags plus [`OpenFlags::URI`] when `path` is a `file:` URI.
    pub fn for_path(self, path: &str) -> Self {
        let is_uri = path
            .get(..5)
            .is_some_and(|prefix| prefix.eq_ignore_ascii_case("file:"));
        if is_uri {
            self | Self::URI
        } else {
            self
        }
    }
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self::READ_WRITE | Self::CREATE
    }
}

impl BitOr for OpenFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// How backup and restore pump pages between databases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPolicy {
    /// Pages copied per native step.
    pub pages_per_step: i32,
    /// Sleep between retries when the source or destination is busy.
    pub busy_sleep: Duration,
    /// Consecutive busy results tolerated before the loop gives up.
    pub max_busy_retries: u32,
}

impl Default for TransferPolicy {
    fn default() -> Self {
        Self {
            pages_per_step: 100,
            busy_sleep: Duration::from_millis(100),
            max_busy_retries: 3,
        }
    }
}

impl TransferPolicy {
    /// Sets pages per step.
    #[must_use]
    pub const fn pages_per_step(mut self, pages: i32) -> Self {
        self.pages_per_step = pages;
        self
    }

    /// Sets the busy sleep.
    #[must_use]
    pub const fn busy_sleep(mut self, sleep: Duration) -> Self {
        self.busy_sleep = sleep;
        self
    }

    /// Sets the busy retry limit.
    #[must_use]
    pub const fn max_busy_retries(mut self, retries: u32) -> Self {
        self.max_busy_retries = retries;
        self
    }
}

/// Configuration for a [`ConnectionBridge`](crate::ConnectionBridge).
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Busy timeout applied right after open (`None` = leave the engine default).
    pub busy_timeout: Option<Duration>,

    /// Flags used by the backup path when opening the destination file.
    pub backup_flags: OpenFlags,

    /// Flags used by the restore path when opening the source file.
    pub restore_flags: OpenFlags,

    /// Page transfer policy for backup and restore.
    pub transfer: TransferPolicy,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            busy_timeout: None,
            backup_flags: OpenFlags::READ_WRITE | OpenFlags::CREATE,
            restore_flags: OpenFlags::READ_ONLY,
            transfer: TransferPolicy::default(),
        }
    }
}

impl BridgeConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the busy timeout applied after open.
    #[must_use]
    pub const fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = Some(timeout);
        self
    }

    /// Sets the transfer policy.
    #[must_use]
    pub const fn transfer(mut self, policy: TransferPolicy) -> Self {
        self.transfer = policy;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = BridgeConfig::default();
        assert!(config.busy_timeout.is_none());
        assert_eq!(config.transfer.pages_per_step, 100);
        assert_eq!(config.transfer.busy_sleep, Duration::from_millis(100));
        assert_eq!(config.transfer.max_busy_retries, 3);
        assert!(config.backup_flags.contains(OpenFlags::CREATE));
        assert!(config.restore_flags.contains(OpenFlags::READ_ONLY));
    }

    #[test]
    fn builder_pattern() {
        let config = BridgeConfig::new()
            .busy_timeout(Duration::from_secs(2))
            .transfer(TransferPolicy::default().pages_per_step(-1));

        assert_eq!(config.busy_timeout, Some(Duration::from_secs(2)));
        assert_eq!(config.transfer.pages_per_step, -1);
    }

    #[test]
    fn uri_detection_ignores_case() {
        let flags = OpenFlags::READ_ONLY;
        assert!(flags.for_path("FILE:test.db?mode=ro").contains(OpenFlags::URI));
        assert!(flags.for_path("file:x").contains(OpenFlags::URI));
        assert!(!flags.for_path("/tmp/file.db").contains(OpenFlags::URI));
        assert!(!flags.for_path("fil").contains(OpenFlags::URI));
    }
}
