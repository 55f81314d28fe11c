//! Extension bootstrap collaborator contract.
//!
//! The actual out-of-process script interpreter invocation is explicitly out
//! of scope — this crate only defines the interface [`registry::RegistryCache`]
//! calls, plus a default implementation that keeps the registry/slot
//! bookkeeping exercisable without a real interpreter.
//!
//! [`registry::RegistryCache`]: crate::registry::RegistryCache

use flux::logging::{self, Logger};

/// Invoked by the registry cache when a registry entry's bootstrap state
/// needs to run. Implementations MUST be callable from the main thread and
/// MUST NOT block indefinitely — the tick loop has no other progress while a
/// call is in flight.
pub trait BootstrapExecutor: Send {
    fn bootstrap(&mut self, name: &str, entry_path: Option<&str>, hash: Option<&str>) -> bool;
    fn hook(&mut self, name: &str, entry_path: Option<&str>, hash: Option<&str>, hook_name: &str) -> bool;
}

/// Default executor: records the call and reports failure, since no real
/// script interpreter is wired in. Keeps slot generation/stale-unload
/// bookkeeping testable on its own.
pub struct LoggingBootstrapExecutor {
    log: Logger,
}

impl LoggingBootstrapExecutor {
    pub fn new(log: Logger) -> Self {
        LoggingBootstrapExecutor { log }
    }
}

impl BootstrapExecutor for LoggingBootstrapExecutor {
    fn bootstrap(&mut self, name: &str, entry_path: Option<&str>, hash: Option<&str>) -> bool {
        logging::info!(self.log, "bootstrap collaborator not configured, skipping"; "name" => name, "entry" => entry_path.unwrap_or(""), "hash" => hash.unwrap_or(""));
        false
    }

    fn hook(&mut self, name: &str, entry_path: Option<&str>, hash: Option<&str>, hook_name: &str) -> bool {
        logging::info!(self.log, "bootstrap hook collaborator not configured, skipping"; "name" => name, "entry" => entry_path.unwrap_or(""), "hash" => hash.unwrap_or(""), "hook" => hook_name);
        false
    }
}
