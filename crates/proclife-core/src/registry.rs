//! Capacity-bounded collection of tracked processes.
//!
//! One mutex guards every record. It is only held for the duration of a single read or
//! mutation and never across an await point. Every removal of a live record wakes the
//! tasks parked in [`ProcessRegistry::wait_for_empty`] and
//! [`ProcessRegistry::wait_for_removal`].

use crate::error::{ProcessError, Result};
use crate::process::{NativeId, ProcessRecord, ProcessSnapshot, ProcessState};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// Addresses one generation of a tracked identifier
///
/// Identifiers can be reused once a process is reaped; the serial keeps a stale
/// collector or reaper from touching the newer record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub identifier: String,
    pub serial: u64,
}

#[derive(Debug, Default)]
struct Records {
    live: Vec<ProcessRecord>,
    retained: VecDeque<ProcessRecord>,
    next_serial: u64,
}

impl Records {
    fn live_mut(&mut self, key: &RecordKey) -> Option<&mut ProcessRecord> {
        self.live.iter_mut().find(|r| r.serial == key.serial)
    }

    fn any_mut(&mut self, key: &RecordKey) -> Option<&mut ProcessRecord> {
        if let Some(pos) = self.live.iter().position(|r| r.serial == key.serial) {
            return self.live.get_mut(pos);
        }
        self.retained.iter_mut().find(|r| r.serial == key.serial)
    }

    fn take_live(&mut self, key: &RecordKey) -> Option<ProcessRecord> {
        let pos = self.live.iter().position(|r| r.serial == key.serial)?;
        Some(self.live.remove(pos))
    }

    fn lookup(&self, identifier: &str) -> Option<&ProcessRecord> {
        self.live
            .iter()
            .find(|r| r.identifier == identifier)
            .or_else(|| self.retained.iter().rev().find(|r| r.identifier == identifier))
    }
}

/// Mutex-protected registry of [`ProcessRecord`]s
#[derive(Debug)]
pub struct ProcessRegistry {
    max_processes: usize,
    retained_limit: usize,
    records: Mutex<Records>,
    removed: Notify,
}

impl ProcessRegistry {
    pub fn new(max_processes: usize, retained_limit: usize) -> Self {
        Self {
            max_processes,
            retained_limit,
            records: Mutex::new(Records::default()),
            removed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.max_processes
    }

    /// Number of live records, reservations included
    pub fn size(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().live.is_empty()
    }

    /// Insert a record, assigning it a fresh serial
    ///
    /// Fails with `CapacityExceeded` when full and `DuplicateIdentifier` when a live
    /// record already uses the identifier. On failure nothing changes.
    pub fn add(&self, mut record: ProcessRecord) -> Result<RecordKey> {
        let mut records = self.lock();

        if records.live.iter().any(|r| r.identifier == record.identifier) {
            return Err(ProcessError::DuplicateIdentifier(record.identifier));
        }
        if records.live.len() >= self.max_processes {
            return Err(ProcessError::CapacityExceeded {
                max: self.max_processes,
            });
        }

        records.next_serial += 1;
        record.serial = records.next_serial;
        let key = record.key();
        records.live.push(record);
        debug!(identifier = %key.identifier, serial = key.serial, "Registered process record");
        Ok(key)
    }

    /// Reserve `identifier` for a process that is about to be spawned
    pub fn reserve(&self, identifier: &str, command: &str) -> Result<RecordKey> {
        self.add(ProcessRecord::spawning(identifier, command))
    }

    /// Promote a reservation to `Running` once the OS handed back a process id
    ///
    /// The record starts out supervised and replaces any retained record with the same
    /// identifier.
    pub fn mark_running(&self, key: &RecordKey, native_id: NativeId) -> bool {
        let mut records = self.lock();
        match records.live_mut(key) {
            Some(record) if record.state == ProcessState::Spawning => {
                record.native_id = Some(native_id);
                record.state = ProcessState::Running;
                record.supervised = true;
            }
            _ => return false,
        }
        records.retained.retain(|r| r.identifier != key.identifier);
        true
    }

    /// The task owning this record's child is gone; reconciliation may reap it
    pub fn release_supervision(&self, key: &RecordKey) {
        if let Some(record) = self.lock().live_mut(key) {
            record.supervised = false;
        }
    }

    /// Drop a reservation whose spawn failed
    pub fn release(&self, key: &RecordKey) {
        let released = self.lock().take_live(key).is_some();
        if released {
            self.removed.notify_waiters();
        }
    }

    /// Remove the live record for `identifier`, discarding it
    ///
    /// Idempotent: returns false when nothing was tracked under that identifier.
    pub fn remove(&self, identifier: &str) -> bool {
        let removed = {
            let mut records = self.lock();
            match records.live.iter().position(|r| r.identifier == identifier) {
                Some(pos) => {
                    records.live.remove(pos);
                    true
                }
                None => false,
            }
        };
        if removed {
            self.removed.notify_waiters();
        }
        removed
    }

    /// Move a live record to the retained set with its final state
    ///
    /// A record that was being terminated ends as `Terminated`, any other as `Exited`.
    /// Returns `None` if this generation was already reaped or removed.
    pub fn reap(&self, key: &RecordKey, exit_status: Option<i32>) -> Option<ProcessState> {
        let final_state = {
            let mut records = self.lock();
            let mut record = records.take_live(key)?;
            record.state = match record.state {
                ProcessState::Terminating => ProcessState::Terminated,
                _ => ProcessState::Exited,
            };
            record.exit_status = exit_status;
            let final_state = record.state;

            if self.retained_limit > 0 {
                if records.retained.len() >= self.retained_limit {
                    records.retained.pop_front();
                }
                records.retained.push_back(record);
            }
            final_state
        };
        self.removed.notify_waiters();
        Some(final_state)
    }

    /// Snapshot of the record known under `identifier`, live records first
    pub fn find(&self, identifier: &str) -> Option<ProcessSnapshot> {
        self.lock().lookup(identifier).map(ProcessRecord::snapshot)
    }

    /// Whether a live record uses `identifier`
    pub fn contains(&self, identifier: &str) -> bool {
        self.lock().live.iter().any(|r| r.identifier == identifier)
    }

    /// Whether this exact generation is still live
    pub fn is_live(&self, key: &RecordKey) -> bool {
        self.lock().live.iter().any(|r| r.serial == key.serial)
    }

    /// Insertion-ordered snapshot of every live record
    pub fn list(&self) -> Vec<ProcessSnapshot> {
        self.lock().live.iter().map(ProcessRecord::snapshot).collect()
    }

    /// Captured output for `identifier` so far
    pub fn output(&self, identifier: &str) -> Option<Vec<String>> {
        self.lock()
            .lookup(identifier)
            .map(|r| r.captured_output.clone())
    }

    /// Append one line of captured output; false if the record no longer exists
    pub fn append_line(&self, key: &RecordKey, line: String) -> bool {
        match self.lock().any_mut(key) {
            Some(record) => {
                record.captured_output.push(line);
                true
            }
            None => false,
        }
    }

    pub fn mark_capture_closed(&self, key: &RecordKey) {
        if let Some(record) = self.lock().any_mut(key) {
            record.capture_closed = true;
        }
    }

    /// Move every `Running` record named `identifier` to `Terminating`
    pub fn begin_termination(&self, identifier: &str) -> Vec<(RecordKey, NativeId)> {
        let mut records = self.lock();
        records
            .live
            .iter_mut()
            .filter(|r| r.identifier == identifier)
            .filter_map(|r| match (r.state, r.native_id) {
                (ProcessState::Running | ProcessState::Terminating, Some(native_id)) => {
                    r.state = ProcessState::Terminating;
                    Some((r.key(), native_id))
                }
                _ => None,
            })
            .collect()
    }

    /// Mark the running record whose process id is `pid` as `Terminating`
    pub fn begin_termination_by_pid(&self, pid: u32) -> Option<(RecordKey, NativeId)> {
        let mut records = self.lock();
        let record = records.live.iter_mut().find(|r| {
            matches!(r.state, ProcessState::Running | ProcessState::Terminating)
                && r.native_id.map(|id| id.pid()) == Some(pid)
        })?;
        record.state = ProcessState::Terminating;
        let native_id = record.native_id?;
        Some((record.key(), native_id))
    }

    /// Undo [`ProcessRegistry::begin_termination`] when the signal was not delivered
    pub fn restore_running(&self, key: &RecordKey) {
        if let Some(record) = self.lock().live_mut(key) {
            if record.state == ProcessState::Terminating {
                record.state = ProcessState::Running;
            }
        }
    }

    /// Keys and native ids of every live record that has been spawned
    pub fn spawned(&self) -> Vec<(RecordKey, NativeId)> {
        self.lock()
            .live
            .iter()
            .filter_map(|r| r.native_id.map(|id| (r.key(), id)))
            .collect()
    }

    /// Spawned records without a supervisor, which only reconciliation can reap
    pub fn unsupervised(&self) -> Vec<(RecordKey, NativeId)> {
        self.lock()
            .live
            .iter()
            .filter(|r| !r.supervised)
            .filter_map(|r| r.native_id.map(|id| (r.key(), id)))
            .collect()
    }

    /// Wait until no live record remains
    pub async fn wait_for_empty(&self) {
        loop {
            let notified = self.removed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Wait until `key` is no longer live, giving up after `timeout`
    ///
    /// Returns true if the record was removed in time.
    pub async fn wait_for_removal(&self, key: &RecordKey, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.removed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if !self.is_live(key) {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}
