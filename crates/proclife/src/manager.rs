//! Bounded-concurrency process manager.
//!
//! Every spawned child gets one supervisor task. The supervisor owns the `Child`,
//! drains its stdout through an [`OutputCollector`] and reaps the record once the
//! process is gone, so removal from the registry always happens before anyone
//! waiting on it is woken.

use crate::factory::PlatformFactory;
use crate::process_table::SysinfoProcessTable;
use proclife_core::{
    CaptureOutcome, CommandLine, ManagerConfig, NativeId, NativeSignal, OutputCollector,
    ProcessError, ProcessLauncher, ProcessRegistry, ProcessSnapshot, ProcessState, ProcessTable,
    RecordKey, Result, TerminationController, TerminationResult,
};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, ChildStdout};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Spawns, tracks, monitors and tears down external processes
pub struct ProcessManager {
    config: ManagerConfig,
    registry: Arc<ProcessRegistry>,
    launcher: Arc<dyn ProcessLauncher>,
    terminator: Arc<dyn TerminationController>,
    process_table: Arc<dyn ProcessTable>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl ProcessManager {
    /// Create a manager using the host platform launcher and the `sysinfo` process table
    pub fn new(config: ManagerConfig) -> Result<Self> {
        Self::with_components(
            config,
            PlatformFactory::create_launcher(),
            PlatformFactory::create_termination_controller(),
            Arc::new(SysinfoProcessTable::new()),
        )
    }

    /// Create a manager from explicit collaborators
    pub fn with_components(
        config: ManagerConfig,
        launcher: Arc<dyn ProcessLauncher>,
        terminator: Arc<dyn TerminationController>,
        process_table: Arc<dyn ProcessTable>,
    ) -> Result<Self> {
        config.validate()?;

        info!(
            platform = launcher.platform_name(),
            max_processes = config.max_processes,
            "Created ProcessManager"
        );

        Ok(Self {
            registry: Arc::new(ProcessRegistry::new(
                config.max_processes,
                config.retained_outputs,
            )),
            config,
            launcher,
            terminator,
            process_table,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Run `command` through the platform shell under `identifier`
    ///
    /// Returns as soon as the process is registered; never waits for it to exit.
    pub async fn create_process(&self, command: &str, identifier: &str) -> Result<NativeId> {
        self.ensure_open()?;
        let command = CommandLine::shell(command);
        let reservation = self.reserve(identifier, &command.display())?;
        self.launch(reservation, &command).await
    }

    /// Execute a script file under `identifier`, making it executable first if needed
    pub async fn run_script(&self, script: impl AsRef<Path>, identifier: &str) -> Result<NativeId> {
        self.ensure_open()?;
        let script = script.as_ref();
        let reservation = self.reserve(identifier, &script.display().to_string())?;
        let command = self.launcher.prepare_script(script).await?;
        self.launch(reservation, &command).await
    }

    pub fn has_process(&self, identifier: &str) -> bool {
        self.registry.contains(identifier)
    }

    /// Snapshot of the record known under `identifier`, reaped records included
    pub fn get_process(&self, identifier: &str) -> Option<ProcessSnapshot> {
        self.registry.find(identifier)
    }

    pub fn process_count(&self) -> usize {
        self.registry.size()
    }

    /// Records currently in the `Running` state, in creation order
    ///
    /// Records being terminated are left out even though their snapshot still reports
    /// [`ProcessStatus::Running`](proclife_core::ProcessStatus::Running) until they are reaped.
    pub fn get_running_processes(&self) -> Vec<ProcessSnapshot> {
        self.registry
            .list()
            .into_iter()
            .filter(|snapshot| snapshot.state == ProcessState::Running)
            .collect()
    }

    /// Lines captured so far; partial while the process is still running
    pub fn get_process_output(&self, identifier: &str) -> Result<Vec<String>> {
        self.registry
            .output(identifier)
            .ok_or_else(|| ProcessError::UnknownIdentifier(identifier.to_string()))
    }

    /// Signal the process with the given pid and wait a bounded time for it to exit
    ///
    /// Returns true once the exit was observed within the termination grace period.
    /// A pid that no longer exists counts as terminated.
    pub async fn terminate_process(&self, pid: u32, signal: NativeSignal) -> Result<bool> {
        let Some((key, native_id)) = self.registry.begin_termination_by_pid(pid) else {
            return self.terminate_untracked(pid, signal).await;
        };

        if let Err(e) = self.terminator.terminate_by_pid(native_id, signal) {
            self.registry.restore_running(&key);
            return Err(e);
        }

        info!(identifier = %key.identifier, pid = pid, signal = %signal, "Signalled tracked process");
        Ok(self.confirm_removed(&[key]).await)
    }

    /// Signal every live process tracked under `name`
    ///
    /// Returns false when nothing matched. Processes that outlive the grace period
    /// stay `Terminating` and are reaped later.
    pub async fn terminate_process_by_name(&self, name: &str, signal: NativeSignal) -> Result<bool> {
        let keys = self
            .terminator
            .terminate_by_name(&self.registry, name, signal)?;

        if keys.is_empty() {
            debug!(name = %name, "No live process matched");
            return Ok(false);
        }

        info!(name = %name, count = keys.len(), signal = %signal, "Signalled tracked processes");
        self.confirm_removed(&keys).await;
        Ok(true)
    }

    /// Wait until every tracked process has been reaped
    pub async fn wait_for_completion(&self) {
        self.registry.wait_for_empty().await;
    }

    /// Reap records whose process vanished from the OS process table
    ///
    /// Records whose supervisor is still running are left to it, so their exit status
    /// and trailing output are never lost. Returns the identifiers reaped by this pass.
    pub async fn monitor_processes(&self) -> Vec<String> {
        // Taken before the table so a process spawned in between is never mistaken for dead
        let spawned = self.registry.unsupervised();
        if spawned.is_empty() {
            return Vec::new();
        }

        let Some(listed) = self.listed_pids().await else {
            return Vec::new();
        };

        let mut reaped = Vec::new();
        for (key, native_id) in spawned {
            if listed.contains(&native_id.pid()) {
                continue;
            }
            if let Some(state) = self.registry.reap(&key, None) {
                info!(identifier = %key.identifier, pid = %native_id, state = ?state, "Reconciled exited process");
                reaped.push(key.identifier);
            }
        }

        if !reaped.is_empty() {
            debug!(count = reaped.len(), "Reconciliation pass reaped processes");
        }
        reaped
    }

    /// Kill every tracked process and wait for the supervisors to finish
    ///
    /// Further `create_process`/`run_script` calls fail with `ManagerShutDown`.
    pub async fn shutdown(&self) {
        info!(live = self.registry.size(), "Shutting down ProcessManager");
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("ProcessManager shutdown completed");
    }

    fn ensure_open(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ProcessError::ManagerShutDown);
        }
        Ok(())
    }

    fn reserve(&self, identifier: &str, command: &str) -> Result<Reservation<'_>> {
        let key = self.registry.reserve(identifier, command).inspect_err(|e| {
            debug!(identifier = %identifier, error = %e, "Process admission refused");
        })?;
        Ok(Reservation {
            registry: &self.registry,
            key,
            armed: true,
        })
    }

    async fn launch(&self, reservation: Reservation<'_>, command: &CommandLine) -> Result<NativeId> {
        let launched = self
            .launcher
            .spawn(command, &reservation.key.identifier)
            .await?;
        let key = reservation.commit();
        let native_id = launched.native_id;

        if !self.registry.mark_running(&key, native_id) {
            warn!(identifier = %key.identifier, pid = %native_id, "Reservation vanished before the process started");
        }

        let supervisor = Supervisor {
            _supervision: SupervisionGuard {
                registry: self.registry.clone(),
                key: key.clone(),
            },
            registry: self.registry.clone(),
            terminator: self.terminator.clone(),
            key,
            native_id,
            cancel: self.cancel.child_token(),
            drain_grace: self.config.termination_grace(),
        };
        self.tasks
            .spawn(supervisor.run(launched.child, launched.stdout));

        Ok(native_id)
    }

    async fn terminate_untracked(&self, pid: u32, signal: NativeSignal) -> Result<bool> {
        if let Some(listed) = self.listed_pids().await {
            if !listed.contains(&pid) {
                info!(error = %ProcessError::NoSuchProcess(pid), "Nothing to terminate");
                return Ok(true);
            }
        }

        self.terminator.terminate_single_by_pid(pid, signal)?;

        let deadline = Instant::now() + self.config.termination_grace();
        loop {
            if let Some(listed) = self.listed_pids().await {
                if !listed.contains(&pid) {
                    return Ok(true);
                }
            }
            if Instant::now() >= deadline {
                warn!(pid = pid, "Untracked process still running after termination grace period");
                return Ok(false);
            }
            tokio::time::sleep(self.config.reap_poll_interval()).await;
        }
    }

    async fn confirm_removed(&self, keys: &[RecordKey]) -> bool {
        let deadline = Instant::now() + self.config.termination_grace();
        let mut confirmed = true;

        for key in keys {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !self.registry.wait_for_removal(key, remaining).await {
                warn!(
                    identifier = %key.identifier,
                    grace_ms = self.config.termination_grace_ms,
                    "Process still running after termination grace period"
                );
                confirmed = false;
            }
        }
        confirmed
    }

    async fn listed_pids(&self) -> Option<HashSet<u32>> {
        let table = self.process_table.clone();
        let query = tokio::task::spawn_blocking(move || {
            table
                .snapshot()
                .into_iter()
                .map(|entry| entry.pid)
                .collect::<HashSet<_>>()
        });

        match query.await {
            Ok(pids) => Some(pids),
            Err(e) => {
                warn!(error = %e, "Process table query failed");
                None
            }
        }
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        let spawned = self.registry.spawned();
        self.cancel.cancel();

        if spawned.is_empty() {
            return;
        }

        warn!(
            count = spawned.len(),
            "ProcessManager dropped with live processes - attempting emergency cleanup"
        );
        // Supervisors may never run again if the runtime is going away
        for (key, native_id) in spawned {
            match self.terminator.signal(native_id, NativeSignal::KILL) {
                TerminationResult::Success | TerminationResult::ProcessNotFound => {}
                result => {
                    warn!(identifier = %key.identifier, pid = %native_id, result = ?result, "Emergency cleanup failed");
                }
            }
        }
    }
}

/// Identifier held in the `Spawning` state until the launch either succeeds or is abandoned
struct Reservation<'a> {
    registry: &'a ProcessRegistry,
    key: RecordKey,
    armed: bool,
}

impl Reservation<'_> {
    fn commit(mut self) -> RecordKey {
        self.armed = false;
        self.key.clone()
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!(identifier = %self.key.identifier, "Releasing reservation after failed launch");
            self.registry.release(&self.key);
        }
    }
}

/// Hands a record over to reconciliation if its supervisor ends without reaping it
struct SupervisionGuard {
    registry: Arc<ProcessRegistry>,
    key: RecordKey,
}

impl Drop for SupervisionGuard {
    fn drop(&mut self) {
        self.registry.release_supervision(&self.key);
    }
}

/// Owns one child from launch until it is reaped
struct Supervisor {
    _supervision: SupervisionGuard,
    registry: Arc<ProcessRegistry>,
    terminator: Arc<dyn TerminationController>,
    key: RecordKey,
    native_id: NativeId,
    cancel: CancellationToken,
    drain_grace: Duration,
}

impl Supervisor {
    async fn run(self, mut child: Child, stdout: Option<ChildStdout>) {
        let collector = OutputCollector::new(self.registry.clone(), self.key.clone());
        let capture_cancel = self.cancel.child_token();
        let capture = async {
            match stdout {
                Some(stdout) => collector.drain(stdout, &capture_cancel).await,
                None => {
                    let closed = ProcessError::OutputCaptureClosed(self.key.identifier.clone());
                    warn!(pid = %self.native_id, error = %closed, "Child has no stdout pipe");
                    self.registry.mark_capture_closed(&self.key);
                    CaptureOutcome::Closed
                }
            }
        };
        tokio::pin!(capture);
        let mut captured = None;

        let status = loop {
            tokio::select! {
                outcome = &mut capture, if captured.is_none() => captured = Some(outcome),
                status = child.wait() => break status,
                _ = self.cancel.cancelled() => {
                    self.kill();
                    break child.wait().await;
                }
            }
        };

        // A grandchild may still hold the write end of the pipe
        let outcome = match captured {
            Some(outcome) => outcome,
            None => match tokio::time::timeout(self.drain_grace, &mut capture).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    debug!(identifier = %self.key.identifier, "Output pipe still open after exit, stopping capture");
                    capture_cancel.cancel();
                    capture.await
                }
            },
        };

        let exit_status = match status {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(identifier = %self.key.identifier, pid = %self.native_id, error = %e, "Failed to wait for process");
                None
            }
        };

        match self.registry.reap(&self.key, exit_status) {
            Some(state) => info!(
                identifier = %self.key.identifier,
                pid = %self.native_id,
                state = ?state,
                exit_status = ?exit_status,
                capture = ?outcome,
                "Reaped process"
            ),
            None => debug!(identifier = %self.key.identifier, "Record already reaped"),
        }
    }

    fn kill(&self) {
        match self.terminator.signal(self.native_id, NativeSignal::KILL) {
            TerminationResult::Success | TerminationResult::ProcessNotFound => {
                debug!(identifier = %self.key.identifier, pid = %self.native_id, "Killed process during teardown");
            }
            result => {
                error!(identifier = %self.key.identifier, pid = %self.native_id, result = ?result, "Failed to kill process during teardown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proclife_core::{ProcessEntry, ProcessRecord};
    use std::sync::Mutex;

    /// Process table that lists exactly what the test tells it to
    #[derive(Default)]
    struct ScriptedTable(Mutex<Vec<ProcessEntry>>);

    impl ScriptedTable {
        fn set(&self, pids: &[u32]) {
            *self.0.lock().unwrap() = pids
                .iter()
                .map(|pid| ProcessEntry {
                    pid: *pid,
                    name: "scripted".to_string(),
                })
                .collect();
        }
    }

    impl ProcessTable for ScriptedTable {
        fn snapshot(&self) -> Vec<ProcessEntry> {
            self.0.lock().unwrap().clone()
        }
    }

    fn manager_with_table(max_processes: usize, table: Arc<ScriptedTable>) -> ProcessManager {
        ProcessManager::with_components(
            ManagerConfig::with_capacity(max_processes),
            PlatformFactory::create_launcher(),
            PlatformFactory::create_termination_controller(),
            table,
        )
        .unwrap()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = ManagerConfig {
            max_processes: 0,
            ..ManagerConfig::default()
        };
        assert!(matches!(
            ProcessManager::new(config),
            Err(ProcessError::ConfigurationError(_))
        ));
    }

    #[tokio::test]
    async fn test_output_of_unknown_identifier() {
        let manager = ProcessManager::new(ManagerConfig::default()).unwrap();
        assert!(matches!(
            manager.get_process_output("ghost"),
            Err(ProcessError::UnknownIdentifier(id)) if id == "ghost"
        ));
        assert!(!manager.has_process("ghost"));
        assert!(manager.get_process("ghost").is_none());
    }

    #[tokio::test]
    async fn test_failed_launch_releases_reservation() {
        let manager = ProcessManager::new(ManagerConfig::with_capacity(1)).unwrap();
        let result = manager
            .run_script("/definitely/not/here/job.sh", "job")
            .await;

        assert!(matches!(result, Err(ProcessError::SpawnFailure { .. })));
        assert!(!manager.has_process("job"));
        assert_eq!(manager.process_count(), 0);
        tokio::time::timeout(Duration::from_secs(1), manager.wait_for_completion())
            .await
            .expect("registry should be empty");
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_monitor_reaps_unsupervised_processes_missing_from_table() {
        let table = Arc::new(ScriptedTable::default());
        let manager = manager_with_table(4, table.clone());

        let kept = manager.create_process("sleep 30", "kept").await.unwrap();
        manager.create_process("sleep 30", "supervised").await.unwrap();
        manager
            .registry
            .add(ProcessRecord::running("adopted", NativeId::Unix(999_999), "sleep 30"))
            .unwrap();
        table.set(&[kept.pid()]);

        let reaped = manager.monitor_processes().await;
        assert_eq!(reaped, vec!["adopted".to_string()]);
        assert!(manager.has_process("kept"));
        // Its supervisor still owns the child, so it is not reconciliation's to reap
        assert!(manager.has_process("supervised"));
        assert_eq!(
            manager.get_process("adopted").unwrap().state,
            ProcessState::Exited
        );

        // A second pass has nothing left to do
        assert!(manager.monitor_processes().await.is_empty());

        manager.shutdown().await;
        assert_eq!(manager.process_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_running_processes_exclude_terminating() {
        let manager = ProcessManager::new(ManagerConfig::default()).unwrap();
        manager.create_process("sleep 30", "stays").await.unwrap();
        manager.create_process("sleep 30", "leaving").await.unwrap();
        manager.registry.begin_termination("leaving");

        let running: Vec<_> = manager
            .get_running_processes()
            .into_iter()
            .map(|snapshot| snapshot.identifier)
            .collect();
        assert_eq!(running, vec!["stays".to_string()]);
        assert_eq!(
            manager.get_process("leaving").unwrap().status(),
            proclife_core::ProcessStatus::Running
        );

        manager.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_create_after_shutdown_fails() {
        let manager = ProcessManager::new(ManagerConfig::default()).unwrap();
        manager.create_process("sleep 30", "sleeper").await.unwrap();
        manager.shutdown().await;

        assert!(!manager.has_process("sleeper"));
        assert_eq!(
            manager.get_process("sleeper").unwrap().status(),
            proclife_core::ProcessStatus::Exited
        );
        assert!(matches!(
            manager.create_process("true", "late").await,
            Err(ProcessError::ManagerShutDown)
        ));
    }
}
