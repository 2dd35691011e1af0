use thiserror::Error;

/// Infrastructure failures: anything that prevents an execution attempt from
/// producing an outcome. Surfaced to callers as a generic 500.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Failed to prepare workspace: {0}")]
    Workspace(#[source] std::io::Error),
    #[error("Failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("Archive transfer failed: {0}")]
    Archive(#[source] std::io::Error),
    #[error("Isolation handle has no running step")]
    NotStarted,
    #[error("Output stream already attached for this step")]
    OutputTaken,
    #[error("Exec attach returned a detached session")]
    Detached,
    #[error("Empty command for {0} step")]
    EmptyCommand(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
