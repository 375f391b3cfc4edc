use proclife_core::{ProcessEntry, ProcessTable};
use std::sync::{Mutex, PoisonError};
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::debug;

/// [`ProcessTable`] backed by `sysinfo`
///
/// Zombies and dead entries are left out, so a child that exited but was not yet
/// waited on already counts as gone.
pub struct SysinfoProcessTable {
    system: Mutex<System>,
}

impl SysinfoProcessTable {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SysinfoProcessTable {
    fn snapshot(&self) -> Vec<ProcessEntry> {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing(),
        );

        let entries: Vec<ProcessEntry> = system
            .processes()
            .iter()
            .filter(|(_, process)| {
                !matches!(
                    process.status(),
                    sysinfo::ProcessStatus::Zombie | sysinfo::ProcessStatus::Dead
                )
            })
            .map(|(pid, process)| ProcessEntry {
                pid: pid.as_u32(),
                name: process.name().to_string_lossy().into_owned(),
            })
            .collect();

        debug!(count = entries.len(), "Refreshed process table");
        entries
    }
}
