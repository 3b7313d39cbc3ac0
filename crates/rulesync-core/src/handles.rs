//! Per-organization [`Facade`] construction (spec §4.5).
//!
//! A `Facade` is a stateless view over files shared under `state_dir`: two
//! handles built from the same `(state_dir, org_id)` pair always observe
//! the same mirror and ledger, because both read and write the same paths
//! on every call. That satisfies the uniqueness contract without a cache —
//! `Handles::get` simply constructs a fresh `Facade` each time.

use std::path::{Path, PathBuf};

use anyhow::Result;

use rulesync_auth::Credentials;
use rulesync_ledger::Ledger;
use rulesync_mirror::Mirror;
use rulesync_transport::TransportClient;

use crate::facade::Facade;

/// Everything needed to construct a [`Facade`] for any organization under
/// one workspace: where the mirror/ledger live, how to reach the platform,
/// and whether mutation verbs push eagerly.
#[derive(Debug, Clone)]
pub struct Handles {
    state_dir: PathBuf,
    state_file: String,
    base_url: String,
    creds: Credentials,
    eager: bool,
}

impl Handles {
    pub fn new(
        state_dir: impl Into<PathBuf>,
        state_file: impl Into<String>,
        base_url: impl Into<String>,
        creds: Credentials,
        eager: bool,
    ) -> Self {
        Self {
            state_dir: state_dir.into(),
            state_file: state_file.into(),
            base_url: base_url.into(),
            creds,
            eager,
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Build a handle for `org_id`. Creating the underlying `TransportClient`
    /// is the only fallible step.
    pub fn get(&self, org_id: &str) -> Result<Facade> {
        let mirror = Mirror::new(self.state_dir.join(org_id));
        let ledger = Ledger::with_file(&self.state_dir, &self.state_file);
        let transport = TransportClient::new(self.base_url.clone(), self.creds.clone(), org_id)?;
        Ok(Facade::new(mirror, ledger, transport, org_id, self.eager))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn two_handles_for_the_same_org_share_mirror_and_ledger_paths() {
        let td = tempdir().unwrap();
        let handles = Handles::new(
            td.path(),
            ".rulesync.state.json",
            "http://127.0.0.1:1",
            Credentials {
                user_id: "u".into(),
                api_key: "k".into(),
            },
            false,
        );

        let a = handles.get("org-1").unwrap();
        let b = handles.get("org-1").unwrap();
        assert_eq!(a.mirror().org_dir(), b.mirror().org_dir());
    }
}
