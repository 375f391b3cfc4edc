use async_trait::async_trait;
use proclife_core::{
    CommandLine, LaunchedProcess, NativeId, NativeSignal, ProcessError, ProcessLauncher, Result,
    TerminationController, TerminationResult,
};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

/// taskkill exit code when no process matches the pid
const TASKKILL_NOT_FOUND: i32 = 128;

/// Windows process launcher
///
/// Shell command lines run under `cmd /C` without a console window.
#[derive(Debug, Default, Clone)]
pub struct WindowsProcessLauncher;

impl WindowsProcessLauncher {
    pub fn new() -> Self {
        Self
    }

    fn command_for(command: &CommandLine) -> Command {
        match command {
            CommandLine::Shell(line) => {
                let mut cmd = Command::new("cmd");
                cmd.arg("/C").arg(line);
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
impl ProcessLauncher for WindowsProcessLauncher {
    async fn spawn(&self, command: &CommandLine, identifier: &str) -> Result<LaunchedProcess> {
        let command_display = command.display();
        let mut cmd = Self::command_for(command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        #[cfg(windows)]
        {
            // CREATE_NO_WINDOW (0x08000000) - Creates a process without a console window
            cmd.creation_flags(0x08000000);
        }

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
            pid = %pid,
            command = %command_display,
            "Spawned Windows process"
        );

        let stdout = child.stdout.take();
        Ok(LaunchedProcess {
            native_id: NativeId::Windows(pid),
            child,
            stdout,
        })
    }

    async fn prepare_script(&self, script: &Path) -> Result<CommandLine> {
        let display = script.display().to_string();
        tokio::fs::metadata(script)
            .await
            .map_err(|e| ProcessError::spawn_failure(&display, e))?;

        let extension = script
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase());

        Ok(match extension.as_deref() {
            Some("bat") | Some("cmd") => CommandLine::exec("cmd", ["/C", display.as_str()]),
            Some("ps1") => CommandLine::exec(
                "powershell",
                ["-NoProfile", "-ExecutionPolicy", "Bypass", "-File", display.as_str()],
            ),
            _ => CommandLine::exec(display, Vec::<String>::new()),
        })
    }

    fn platform_name(&self) -> &'static str {
        "windows"
    }
}

/// Windows termination: `TerminateProcess` for KILL, `taskkill` for everything else
#[derive(Debug, Default, Clone)]
pub struct WindowsTerminationController;

impl WindowsTerminationController {
    pub fn new() -> Self {
        Self
    }

    /// Use taskkill to terminate a process, with its tree when `tree` is set
    fn taskkill(pid: u32, force: bool, tree: bool) -> TerminationResult {
        let pid_string = pid.to_string();
        let mut args = vec!["/PID", pid_string.as_str()];
        if tree {
            args.push("/T");
        }
        if force {
            args.push("/F");
        }

        match std::process::Command::new("taskkill")
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) if status.success() => {
                info!(pid = %pid, force = force, "taskkill delivered termination");
                TerminationResult::Success
            }
            Ok(status) if status.code() == Some(TASKKILL_NOT_FOUND) => {
                info!(pid = %pid, "Process not found (already terminated)");
                TerminationResult::ProcessNotFound
            }
            Ok(status) => {
                warn!(pid = %pid, status = %status, "taskkill failed");
                TerminationResult::Failed(format!("taskkill exited with {status}"))
            }
            Err(e) => {
                warn!(pid = %pid, error = %e, "Failed to run taskkill");
                TerminationResult::Failed(format!("taskkill could not run: {e}"))
            }
        }
    }

    #[cfg(windows)]
    fn terminate_process(pid: u32) -> TerminationResult {
        use windows::Win32::Foundation::{CloseHandle, ERROR_ACCESS_DENIED, ERROR_INVALID_PARAMETER};
        use windows::Win32::System::Threading::{OpenProcess, PROCESS_TERMINATE, TerminateProcess};

        // SAFETY: the handle is only used within this function and closed before returning
        let handle = match unsafe { OpenProcess(PROCESS_TERMINATE, false, pid) } {
            Ok(handle) => handle,
            Err(e) if e.code() == ERROR_INVALID_PARAMETER.to_hresult() => {
                info!(pid = %pid, "Process not found (already terminated)");
                return TerminationResult::ProcessNotFound;
            }
            Err(e) if e.code() == ERROR_ACCESS_DENIED.to_hresult() => {
                warn!(pid = %pid, "Permission denied to open process");
                return TerminationResult::PermissionDenied;
            }
            Err(e) => return TerminationResult::Failed(format!("OpenProcess failed: {e}")),
        };

        let result = unsafe { TerminateProcess(handle, 1) };
        let _ = unsafe { CloseHandle(handle) };

        match result {
            Ok(()) => {
                info!(pid = %pid, "Force killed process");
                TerminationResult::Success
            }
            Err(e) if e.code() == ERROR_ACCESS_DENIED.to_hresult() => {
                TerminationResult::PermissionDenied
            }
            Err(e) => TerminationResult::Failed(format!("TerminateProcess failed: {e}")),
        }
    }

    #[cfg(not(windows))]
    fn terminate_process(pid: u32) -> TerminationResult {
        Self::taskkill(pid, true, false)
    }
}

impl TerminationController for WindowsTerminationController {
    fn signal(&self, native_id: NativeId, signal: NativeSignal) -> TerminationResult {
        let pid = native_id.pid();
        if signal.is_kill() {
            Self::terminate_process(pid)
        } else {
            Self::taskkill(pid, false, true)
        }
    }

    fn signal_single(&self, pid: u32, signal: NativeSignal) -> TerminationResult {
        if signal.is_kill() {
            Self::terminate_process(pid)
        } else {
            Self::taskkill(pid, false, false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prepare_missing_script_fails() {
        let launcher = WindowsProcessLauncher::new();
        let result = launcher
            .prepare_script(Path::new("C:/no/such/script.bat"))
            .await;
        assert!(matches!(result, Err(ProcessError::SpawnFailure { .. })));
    }

    #[test]
    fn test_shell_command_uses_cmd() {
        let cmd = WindowsProcessLauncher::command_for(&CommandLine::shell("echo hi"));
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "cmd");
        let args: Vec<_> = std_cmd.get_args().collect();
        assert_eq!(args, vec!["/C", "echo hi"]);
    }
}
