use thiserror::Error;

/// Error types for process lifecycle operations
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Capacity exceeded: at most {max} processes may be tracked")]
    CapacityExceeded { max: usize },

    #[error("Duplicate identifier: {0} is already tracked")]
    DuplicateIdentifier(String),

    #[error("Unknown identifier: {0}")]
    UnknownIdentifier(String),

    #[error("Failed to spawn process `{command}`: {source}")]
    SpawnFailure {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No such process: {0}")]
    NoSuchProcess(u32),

    #[error("Output capture closed for {0}")]
    OutputCaptureClosed(String),

    #[error("Permission denied signalling process {0}")]
    PermissionDenied(u32),

    #[error("Failed to signal process {pid}: {reason}")]
    SignalFailed { pid: u32, reason: String },

    #[error("Invalid signal number: {0}")]
    InvalidSignal(i32),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Process manager has been shut down")]
    ManagerShutDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProcessError>;

impl ProcessError {
    /// Build a spawn failure for the given command
    pub fn spawn_failure(command: impl Into<String>, source: std::io::Error) -> Self {
        ProcessError::SpawnFailure {
            command: command.into(),
            source,
        }
    }

    /// Check if this error indicates a permanent failure
    ///
    /// Nothing in this crate retries on its own, so every error is permanent from the
    /// manager's point of view. Admission errors are the one class a caller may
    /// reasonably try again later, see [`ProcessError::is_admission`].
    pub fn is_permanent(&self) -> bool {
        !self.is_admission()
    }

    /// Check if this error was an admission refusal (registry full or id taken)
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            ProcessError::CapacityExceeded { .. } | ProcessError::DuplicateIdentifier(_)
        )
    }

    /// Stable short code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            ProcessError::CapacityExceeded { .. } => "PROC001",
            ProcessError::DuplicateIdentifier(_) => "PROC002",
            ProcessError::UnknownIdentifier(_) => "PROC003",
            ProcessError::SpawnFailure { .. } => "PROC004",
            ProcessError::NoSuchProcess(_) => "PROC005",
            ProcessError::OutputCaptureClosed(_) => "PROC006",
            ProcessError::PermissionDenied(_) => "PROC007",
            ProcessError::SignalFailed { .. } => "PROC008",
            ProcessError::InvalidSignal(_) => "PROC009",
            ProcessError::ConfigurationError(_) => "PROC010",
            ProcessError::Io(_) => "PROC011",
            ProcessError::ManagerShutDown => "PROC012",
        }
    }
}
