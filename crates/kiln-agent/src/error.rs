use thiserror::Error;

/// Instance-scoped supervisor errors. None of these are fatal to the registry.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("invalid instance name: {0:?}")]
    InvalidName(String),

    #[error("server directory not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    MissingArtifact(String),

    #[error("installer exited with code {}", code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string()))]
    InstallerFailed { code: Option<i32> },

    #[error("failed to spawn process: {0}")]
    Spawn(String),

    #[error("server is not running")]
    NotRunning,

    #[error("failed to write recovery checkpoint: {0}")]
    Checkpoint(#[source] std::io::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SupervisorError {
    /// Stable machine code surfaced to observers.
    pub fn code(&self) -> &'static str {
        match self {
            SupervisorError::InvalidName(_) => "invalid_name",
            SupervisorError::NotFound(_) => "not_found",
            SupervisorError::MissingArtifact(_) => "missing_artifact",
            SupervisorError::InstallerFailed { .. } => "installer_failed",
            SupervisorError::Spawn(_) => "spawn_failed",
            SupervisorError::NotRunning => "not_running",
            SupervisorError::Checkpoint(_) => "checkpoint_failed",
            SupervisorError::Io(_) => "io",
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self {
            SupervisorError::InvalidName(_) => {
                Some("Use only letters, digits, '-' and '_' in instance names.")
            }
            SupervisorError::MissingArtifact(_) => {
                Some("Place a server jar (or run the Forge installer) in the instance directory.")
            }
            SupervisorError::InstallerFailed { .. } => {
                Some("Check the installer output above, then start the server again.")
            }
            SupervisorError::Spawn(_) => {
                Some("Ensure Java is installed and the instance directory is writable.")
            }
            SupervisorError::NotRunning => Some("Start the server first."),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
