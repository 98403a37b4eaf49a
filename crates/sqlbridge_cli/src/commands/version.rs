//! Version command implementation.

use sqlbridge_core::library;

/// Prints the CLI, bridge and native engine versions.
pub fn run() {
    println!("sqlbridge CLI v{}", env!("CARGO_PKG_VERSION"));
    println!("sqlbridge core v{}", sqlbridge_core::VERSION);
    match library::initialize() {
        Ok(info) => {
            println!("SQLite v{} ({})", info.version, info.version_number);
            println!("  Thread-safe: {}", info.threadsafe);
        }
        Err(e) => println!("SQLite unavailable: {e}"),
    }
}
