//! # rulesync-core
//!
//! The reconciliation engine: the `refresh` (remote -> local) and `push`
//! (local -> remote) algorithms, the lazy/eager mutation API, and the
//! concurrency guards that let multiple organizations and processes share
//! one state directory safely.
//!
//! ## Pipeline
//!
//! 1. [`handles::Handles`] constructs a [`facade::Facade`] for one
//!    organization, wiring together its filesystem mirror, its slice of
//!    the shared ledger, and a signed transport client.
//! 2. [`facade::Facade::refresh`] replaces the mirror with the current
//!    remote view, discarding pending ledger state for that organization.
//! 3. Mutation verbs (`create_ruleset`, `update_rule`, `copy_rule`, ...)
//!    edit the mirror and the ledger, pushing immediately in eager mode.
//! 4. [`facade::Facade::push`] applies every pending ledger entry to the
//!    platform in ledger order.
//!
//! ## Modules
//!
//! - [`reconciler`] — `refresh`/`push` (spec §4.4.1, §4.4.2)
//! - [`facade`] — the mutation verbs (spec §4.4.3)
//! - [`handles`] — per-organization facade construction (spec §4.5)
//! - [`lock`] — advisory cross-process lock guarding the shared ledger

use std::sync::Mutex;

pub mod facade;
pub mod handles;
pub mod lock;
pub mod reconciler;

pub use facade::Facade;
pub use handles::Handles;
pub use rulesync_types::{NullReporter, Reporter};

static LEDGER_GUARD: Mutex<()> = Mutex::new(());

/// Serialize access to the shared ledger file across organizations within
/// this process (spec §5: "the shared ledger file is... must be guarded by
/// a process-local mutex"). [`lock::StateLock`] covers the cross-process
/// case; this covers threads within one process, which a file lock alone
/// cannot since they'd all hold the same process's lock.
pub fn with_ledger_guard<T>(f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    let _guard = LEDGER_GUARD.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    f()
}

#[cfg(test)]
mod property_tests;
