//! Error handling for the supervisor.
use thiserror::Error;

/// Stable error kind surfaced over IPC. Names are part of the wire contract (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidSpec,
    SpawnFailed,
    KillTimeout,
    Unhealthy,
    AlreadyRunning,
    IoError,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::AlreadyExists => "AlreadyExists",
            ErrorKind::InvalidSpec => "InvalidSpec",
            ErrorKind::SpawnFailed => "SpawnFailed",
            ErrorKind::KillTimeout => "KillTimeout",
            ErrorKind::Unhealthy => "Unhealthy",
            ErrorKind::AlreadyRunning => "AlreadyRunning",
            ErrorKind::IoError => "IOError",
            ErrorKind::Internal => "Internal",
        }
    }
}

/// Errors that can occur anywhere in the supervision engine.
#[derive(Debug, Error)]
pub enum ProcessManagerError {
    /// Target resolved to no entry for an operation that requires a match.
    #[error("no entry matches target '{target}'")]
    NotFound { target: String },

    /// `start` with a duplicate service name.
    #[error("service '{name}' already exists")]
    AlreadyExists { name: String },

    /// Malformed cron, memory unit, health URL, interpreter, or empty script path.
    #[error("invalid service spec: {0}")]
    InvalidSpec(String),

    /// The OS rejected exec (file not found, not executable, permission denied).
    #[error("failed to spawn service '{service}': {source}")]
    SpawnFailed {
        service: String,
        #[source]
        source: std::io::Error,
    },

    /// Child did not exit within `kill_timeout` even after SIGKILL was reaped.
    #[error("service '{service}' did not exit after kill_timeout")]
    KillTimeout { service: String },

    /// Another supervisor holds the PID file + socket.
    #[error("another supervisor is already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    /// Disk read/write failure for logs, dump file, or config.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Malformed YAML configuration.
    #[error("invalid configuration: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// Malformed dump file or IPC payload.
    #[error("invalid JSON payload: {0}")]
    JsonError(#[from] serde_json::Error),

    /// Unexpected internal condition; implementation bug.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProcessManagerError {
    /// Stable kind used on the IPC wire, per the error taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProcessManagerError::NotFound { .. } => ErrorKind::NotFound,
            ProcessManagerError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            ProcessManagerError::InvalidSpec(_) => ErrorKind::InvalidSpec,
            ProcessManagerError::SpawnFailed { .. } => ErrorKind::SpawnFailed,
            ProcessManagerError::KillTimeout { .. } => ErrorKind::KillTimeout,
            ProcessManagerError::AlreadyRunning { .. } => ErrorKind::AlreadyRunning,
            ProcessManagerError::IoError(_) => ErrorKind::IoError,
            ProcessManagerError::ConfigParseError(_) => ErrorKind::InvalidSpec,
            ProcessManagerError::JsonError(_) => ErrorKind::IoError,
            ProcessManagerError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for ProcessManagerError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ProcessManagerError::Internal(format!("lock poisoned: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, ProcessManagerError>;
