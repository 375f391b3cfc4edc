use crate::error::{ProcessError, Result};
use crate::registry::{ProcessRegistry, RecordKey};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::SystemTime;
use tokio::process::{Child, ChildStdout};
use tracing::{info, warn};

/// Platform-native process identity
///
/// Only launchers and termination controllers look inside the tag; everything above
/// them treats a `NativeId` as opaque and uses [`NativeId::pid`] for display and
/// process-table lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NativeId {
    /// Numeric pid, also the process group id of the child
    Unix(u32),
    /// Windows process id
    Windows(u32),
}

impl NativeId {
    pub fn pid(&self) -> u32 {
        match self {
            NativeId::Unix(pid) | NativeId::Windows(pid) => *pid,
        }
    }

    /// Tag a raw pid with the variant of the host platform
    pub fn for_host(pid: u32) -> Self {
        if cfg!(windows) {
            NativeId::Windows(pid)
        } else {
            NativeId::Unix(pid)
        }
    }
}

impl fmt::Display for NativeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.pid())
    }
}

/// Host signal number
///
/// The meaning of the value is defined by the host OS. The named constants use the
/// POSIX numbering; Windows controllers treat [`NativeSignal::KILL`] as a forced
/// termination and everything else as a polite close request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NativeSignal(i32);

impl NativeSignal {
    pub const HUP: NativeSignal = NativeSignal(1);
    pub const INT: NativeSignal = NativeSignal(2);
    pub const KILL: NativeSignal = NativeSignal(9);
    pub const TERM: NativeSignal = NativeSignal(15);

    pub const fn from_raw(raw: i32) -> Self {
        NativeSignal(raw)
    }

    pub const fn raw(&self) -> i32 {
        self.0
    }

    pub fn is_kill(&self) -> bool {
        *self == NativeSignal::KILL
    }
}

impl Default for NativeSignal {
    fn default() -> Self {
        NativeSignal::TERM
    }
}

impl fmt::Display for NativeSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            NativeSignal::HUP => write!(f, "SIGHUP"),
            NativeSignal::INT => write!(f, "SIGINT"),
            NativeSignal::KILL => write!(f, "SIGKILL"),
            NativeSignal::TERM => write!(f, "SIGTERM"),
            NativeSignal(other) => write!(f, "signal {other}"),
        }
    }
}

/// What to execute for a tracked process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandLine {
    /// A command string interpreted by the platform shell
    Shell(String),
    /// A program executed directly with explicit arguments
    Exec { program: String, args: Vec<String> },
}

impl CommandLine {
    pub fn shell(command: impl Into<String>) -> Self {
        CommandLine::Shell(command.into())
    }

    pub fn exec<S: ToString, I: IntoIterator<Item = S>>(program: impl Into<String>, args: I) -> Self {
        CommandLine::Exec {
            program: program.into(),
            args: args.into_iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Human readable form stored on the record
    pub fn display(&self) -> String {
        match self {
            CommandLine::Shell(command) => command.clone(),
            CommandLine::Exec { program, args } if args.is_empty() => program.clone(),
            CommandLine::Exec { program, args } => format!("{program} {}", args.join(" ")),
        }
    }
}

/// Lifecycle state of a tracked process
///
/// `Spawning → Running → (Terminating → Terminated) | Exited`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessState {
    Spawning,
    Running,
    Terminating,
    Terminated,
    Exited,
}

impl ProcessState {
    /// Whether the process may still be alive
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ProcessState::Spawning | ProcessState::Running | ProcessState::Terminating
        )
    }
}

/// Externally reported status of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessStatus {
    Running,
    Terminated,
    Exited,
}

impl From<ProcessState> for ProcessStatus {
    fn from(state: ProcessState) -> Self {
        match state {
            ProcessState::Spawning | ProcessState::Running | ProcessState::Terminating => {
                ProcessStatus::Running
            }
            ProcessState::Terminated => ProcessStatus::Terminated,
            ProcessState::Exited => ProcessStatus::Exited,
        }
    }
}

/// One tracked process, owned by the [`ProcessRegistry`]
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub(crate) serial: u64,
    pub(crate) identifier: String,
    pub(crate) native_id: Option<NativeId>,
    pub(crate) command: String,
    pub(crate) captured_output: Vec<String>,
    pub(crate) exit_status: Option<i32>,
    pub(crate) state: ProcessState,
    pub(crate) start_time: SystemTime,
    pub(crate) capture_closed: bool,
    pub(crate) supervised: bool,
}

impl ProcessRecord {
    /// A record for a process that is about to be launched
    pub fn spawning(identifier: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            serial: 0,
            identifier: identifier.into(),
            native_id: None,
            command: command.into(),
            captured_output: Vec::new(),
            exit_status: None,
            state: ProcessState::Spawning,
            start_time: SystemTime::now(),
            capture_closed: false,
            supervised: false,
        }
    }

    /// A record for a process that is already running
    pub fn running(
        identifier: impl Into<String>,
        native_id: NativeId,
        command: impl Into<String>,
    ) -> Self {
        Self {
            native_id: Some(native_id),
            state: ProcessState::Running,
            ..Self::spawning(identifier, command)
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn native_id(&self) -> Option<NativeId> {
        self.native_id
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub(crate) fn key(&self) -> RecordKey {
        RecordKey {
            identifier: self.identifier.clone(),
            serial: self.serial,
        }
    }

    pub(crate) fn snapshot(&self) -> ProcessSnapshot {
        ProcessSnapshot {
            identifier: self.identifier.clone(),
            native_id: self.native_id,
            command: self.command.clone(),
            state: self.state,
            exit_status: self.exit_status,
            start_time: self.start_time,
            line_count: self.captured_output.len(),
            capture_closed: self.capture_closed,
        }
    }
}

/// Point-in-time copy of a [`ProcessRecord`] without its output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessSnapshot {
    pub identifier: String,
    pub native_id: Option<NativeId>,
    pub command: String,
    pub state: ProcessState,
    pub exit_status: Option<i32>,
    pub start_time: SystemTime,
    pub line_count: usize,
    pub capture_closed: bool,
}

impl ProcessSnapshot {
    pub fn status(&self) -> ProcessStatus {
        self.state.into()
    }

    pub fn pid(&self) -> Option<u32> {
        self.native_id.map(|id| id.pid())
    }
}

/// A freshly launched child with its stdout pipe detached for the collector
pub struct LaunchedProcess {
    pub native_id: NativeId,
    pub child: Child,
    pub stdout: Option<ChildStdout>,
}

/// Result of a signal delivery attempt
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Signal was delivered
    Success,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// Permission denied (insufficient privileges)
    PermissionDenied,
    /// Operation failed with specific error message
    Failed(String),
}

/// Platform process creation
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Launch `command` with stdout piped to the parent
    ///
    /// Returns as soon as the OS has created the process; never waits for it to exit.
    async fn spawn(&self, command: &CommandLine, identifier: &str) -> Result<LaunchedProcess>;

    /// Make `script` runnable and return the command line that executes it
    async fn prepare_script(&self, script: &Path) -> Result<CommandLine>;

    /// Get the platform name for logging and debugging
    fn platform_name(&self) -> &'static str;
}

/// Signal delivery by pid or by tracked identifier
///
/// Delivery is synchronous; observing the actual exit is left to the caller.
/// No escalation (for example TERM followed by KILL) is ever performed here.
pub trait TerminationController: Send + Sync {
    /// Deliver `signal` to the process, reporting the raw outcome
    fn signal(&self, native_id: NativeId, signal: NativeSignal) -> TerminationResult;

    /// Whether this platform can deliver `signal`
    fn supports(&self, _signal: NativeSignal) -> bool {
        true
    }

    /// Deliver `signal` to exactly one pid, never to its group or process tree
    ///
    /// Used for processes this crate did not launch.
    fn signal_single(&self, pid: u32, signal: NativeSignal) -> TerminationResult {
        self.signal(NativeId::for_host(pid), signal)
    }

    /// Deliver `signal`, treating an already-gone process as success
    fn terminate_by_pid(&self, native_id: NativeId, signal: NativeSignal) -> Result<()> {
        if !self.supports(signal) {
            return Err(ProcessError::InvalidSignal(signal.raw()));
        }
        delivery_outcome(native_id.pid(), signal, self.signal(native_id, signal))
    }

    /// [`TerminationController::terminate_by_pid`] for a pid outside the registry
    fn terminate_single_by_pid(&self, pid: u32, signal: NativeSignal) -> Result<()> {
        if !self.supports(signal) {
            return Err(ProcessError::InvalidSignal(signal.raw()));
        }
        delivery_outcome(pid, signal, self.signal_single(pid, signal))
    }

    /// Signal every running record whose identifier equals `name`
    ///
    /// Matched records move to `Terminating`. A record whose signal could not be
    /// delivered goes back to `Running` and the first such error is returned after all
    /// matches were attempted. An empty result means nothing matched.
    fn terminate_by_name(
        &self,
        registry: &ProcessRegistry,
        name: &str,
        signal: NativeSignal,
    ) -> Result<Vec<RecordKey>> {
        if !self.supports(signal) {
            return Err(ProcessError::InvalidSignal(signal.raw()));
        }

        let targets = registry.begin_termination(name);
        let mut signalled = Vec::with_capacity(targets.len());
        let mut first_error = None;

        for (key, native_id) in targets {
            match self.terminate_by_pid(native_id, signal) {
                Ok(()) => signalled.push(key),
                Err(e) => {
                    warn!(identifier = %key.identifier, pid = %native_id, error = %e, "Failed to signal process");
                    registry.restore_running(&key);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(signalled),
        }
    }
}

fn delivery_outcome(pid: u32, signal: NativeSignal, result: TerminationResult) -> Result<()> {
    match result {
        TerminationResult::Success => Ok(()),
        TerminationResult::ProcessNotFound => {
            info!(pid = pid, "Process already exited before {signal}");
            Ok(())
        }
        TerminationResult::PermissionDenied => Err(ProcessError::PermissionDenied(pid)),
        TerminationResult::Failed(reason) => Err(ProcessError::SignalFailed { pid, reason }),
    }
}

/// One row of the OS process table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
}

/// Query capability over the host process table
pub trait ProcessTable: Send + Sync {
    /// All live processes as `(pid, name)` pairs
    fn snapshot(&self) -> Vec<ProcessEntry>;

    /// Whether `pid` is currently listed
    fn is_alive(&self, pid: u32) -> bool {
        self.snapshot().iter().any(|entry| entry.pid == pid)
    }

    /// Resolve a process name to a pid; lowest pid wins on ties
    fn resolve(&self, name: &str) -> Option<u32> {
        self.snapshot()
            .into_iter()
            .filter(|entry| name_matches(&entry.name, name))
            .map(|entry| entry.pid)
            .min()
    }
}

/// Exact match, or match ignoring a trailing `.exe` on either side
pub fn name_matches(candidate: &str, wanted: &str) -> bool {
    fn stem(name: &str) -> &str {
        let len = name.len();
        if len > 4 && name.is_char_boundary(len - 4) && name[len - 4..].eq_ignore_ascii_case(".exe") {
            &name[..len - 4]
        } else {
            name
        }
    }
    candidate == wanted || stem(candidate) == stem(wanted)
}
