#[cfg(unix)]
mod unix_impl {
    use async_trait::async_trait;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;
    use proclife_core::{
        CommandLine, LaunchedProcess, NativeId, NativeSignal, ProcessError, ProcessLauncher,
        Result, TerminationController, TerminationResult,
    };
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::process::Stdio;
    use tokio::process::Command;
    use tracing::{debug, info, warn};

    /// Unix process launcher
    ///
    /// Shell command lines run under `sh -c`. Every child leads its own process group
    /// so a signal reaches whatever the shell spawned as well.
    #[derive(Debug, Default, Clone)]
    pub struct UnixProcessLauncher;

    impl UnixProcessLauncher {
        pub fn new() -> Self {
            Self
        }

        fn command_for(command: &CommandLine) -> Command {
            match command {
                CommandLine::Shell(line) => {
                    let mut cmd = Command::new("sh");
                    cmd.arg("-c").arg(line);
                    cmd
                }
                CommandLine::Exec { program, args } => {
                    let mut cmd = Command::new(program);
                    cmd.args(args);
                    cmd
                }
            }
        }
    }

    #[async_trait]
    impl ProcessLauncher for UnixProcessLauncher {
        async fn spawn(&self, command: &CommandLine, identifier: &str) -> Result<LaunchedProcess> {
            let command_display = command.display();
            let mut cmd = Self::command_for(command);
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::inherit())
                .process_group(0);

            let mut child = cmd.spawn().map_err(|e| {
                warn!(identifier = %identifier, command = %command_display, error = %e, "Failed to spawn process");
                ProcessError::spawn_failure(&command_display, e)
            })?;

            let pid = child.id().ok_or_else(|| {
                ProcessError::spawn_failure(
                    &command_display,
                    std::io::Error::other("spawned child did not report a pid"),
                )
            })?;

            info!(
                identifier = %identifier,
                pid = pid,
                command = %command_display,
                "Spawned Unix process"
            );

            let stdout = child.stdout.take();
            Ok(LaunchedProcess {
                native_id: NativeId::Unix(pid),
                child,
                stdout,
            })
        }

        async fn prepare_script(&self, script: &Path) -> Result<CommandLine> {
            let script_display = script.display().to_string();
            let metadata = tokio::fs::metadata(script)
                .await
                .map_err(|e| ProcessError::spawn_failure(&script_display, e))?;

            let mut permissions = metadata.permissions();
            if permissions.mode() & 0o111 == 0 {
                permissions.set_mode(permissions.mode() | 0o755);
                tokio::fs::set_permissions(script, permissions)
                    .await
                    .map_err(|e| ProcessError::spawn_failure(&script_display, e))?;
                debug!(script = %script_display, "Marked script executable");
            }

            // A bare file name would be looked up on PATH instead of the working directory
            let program: PathBuf = if script.components().count() == 1 && script.is_relative() {
                Path::new(".").join(script)
            } else {
                script.to_path_buf()
            };

            Ok(CommandLine::Exec {
                program: program.to_string_lossy().into_owned(),
                args: Vec::new(),
            })
        }

        fn platform_name(&self) -> &'static str {
            "unix"
        }
    }

    /// Unix signal delivery through `kill(2)` / `killpg(2)`
    #[derive(Debug, Default, Clone)]
    pub struct UnixTerminationController;

    impl UnixTerminationController {
        pub fn new() -> Self {
            Self
        }

        fn to_nix(signal: NativeSignal) -> Option<Signal> {
            Signal::try_from(signal.raw()).ok()
        }

        /// Pids that `kill(2)` would read as "my group" or "everyone" are refused
        fn to_nix_pid(pid: u32) -> Option<NixPid> {
            match i32::try_from(pid) {
                Ok(raw) if raw > 0 => Some(NixPid::from_raw(raw)),
                _ => None,
            }
        }

        fn prepare(
            pid: u32,
            signal: NativeSignal,
        ) -> std::result::Result<(NixPid, Signal), TerminationResult> {
            let Some(sig) = Self::to_nix(signal) else {
                return Err(TerminationResult::Failed(format!("unsupported {signal}")));
            };
            let Some(pid) = Self::to_nix_pid(pid) else {
                warn!(pid = pid, "Refusing to signal out-of-range pid");
                return Err(TerminationResult::Failed(format!("invalid pid {pid}")));
            };
            Ok((pid, sig))
        }

        fn deliver_single(pid: NixPid, sig: Signal) -> TerminationResult {
            match signal::kill(pid, sig) {
                Ok(()) => {
                    info!(pid = %pid, signal = %sig, "Sent signal to process");
                    TerminationResult::Success
                }
                Err(nix::errno::Errno::ESRCH) => {
                    info!(pid = %pid, "Process not found (already terminated)");
                    TerminationResult::ProcessNotFound
                }
                Err(nix::errno::Errno::EPERM) => {
                    warn!(pid = %pid, "Permission denied to signal process");
                    TerminationResult::PermissionDenied
                }
                Err(e) => {
                    warn!(pid = %pid, signal = %sig, error = %e, "Failed to signal process");
                    TerminationResult::Failed(format!("{sig} failed: {e}"))
                }
            }
        }
    }

    impl TerminationController for UnixTerminationController {
        fn signal(&self, native_id: NativeId, signal: NativeSignal) -> TerminationResult {
            let (pid, sig) = match Self::prepare(native_id.pid(), signal) {
                Ok(target) => target,
                Err(refused) => return refused,
            };

            // Children lead their own group; fall back to the single pid for anything else
            match signal::killpg(pid, sig) {
                Ok(()) => {
                    info!(pgid = %pid, signal = %sig, "Sent signal to process group");
                    TerminationResult::Success
                }
                Err(nix::errno::Errno::ESRCH) => Self::deliver_single(pid, sig),
                Err(nix::errno::Errno::EPERM) => {
                    warn!(pgid = %pid, "Permission denied to signal process group");
                    TerminationResult::PermissionDenied
                }
                Err(e) => {
                    debug!(pgid = %pid, error = %e, "Process group signal failed, trying single process");
                    Self::deliver_single(pid, sig)
                }
            }
        }

        fn signal_single(&self, pid: u32, signal: NativeSignal) -> TerminationResult {
            match Self::prepare(pid, signal) {
                Ok((pid, sig)) => Self::deliver_single(pid, sig),
                Err(refused) => refused,
            }
        }

        fn supports(&self, signal: NativeSignal) -> bool {
            Self::to_nix(signal).is_some()
        }
    }

}

// Re-export the Unix implementation when on Unix systems
#[cfg(unix)]
pub use unix_impl::{UnixProcessLauncher, UnixTerminationController};

// Provide stub implementations for non-Unix systems
#[cfg(not(unix))]
#[derive(Debug, Default, Clone)]
pub struct UnixProcessLauncher;

#[cfg(not(unix))]
#[derive(Debug, Default, Clone)]
pub struct UnixTerminationController;
