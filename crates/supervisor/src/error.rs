use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("capture server is not installed at {0}")]
    NotInstalled(PathBuf),

    #[error("failed to stat capture server: {0}")]
    Stat(#[source] io::Error),

    #[error("failed to reserve socket path: {0}")]
    Socket(#[source] io::Error),

    #[error("failed to start capture server: {0}")]
    Spawn(#[source] io::Error),

    #[error("failed to spawn thread: {0}")]
    Thread(#[source] io::Error),

    #[error("failed to create client: {0}")]
    Client(#[from] ClientError),

    #[error("error starting process: {source}; stderr: {stderr}")]
    StartFailed { source: ProcessError, stderr: String },

    #[error("timed out waiting for process to start; stderr: {stderr}")]
    StartTimeout { stderr: String },

    #[error("failed to kill capture server: {0}")]
    Kill(#[source] nix::Error),

    #[error("user denied permission")]
    PermissionDenied,

    #[error("failed to elevate: {0}")]
    Elevation(#[source] ElevationError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to run capture-config --test: {status}: {line}")]
    CheckFailed { status: ExitStatus, line: String },

    #[error("failed to run capture-config: {status}: {line}")]
    ApplyFailed { status: ExitStatus, line: String },

    #[error("unexpected configuration failure: {0}")]
    ConfigurationFailed(String),

    #[error("unexpected failure running post-install check: {0}")]
    PostInstallCheck(String),
}

impl Error {
    pub(crate) fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> Self {
        let context = context.into();
        move |source| Error::Io { context, source }
    }
}

/// Asynchronous errors of a running capture server.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// A line the capture server printed with the error prefix.
    #[error("{0}")]
    Reported(String),

    #[error("failed to decode stats: {0}")]
    StatsDecode(#[from] serde_json::Error),

    #[error("process died: {0}")]
    Died(ExitStatus),

    #[error("failed to wait for process: {0}")]
    Wait(#[source] io::Error),

    #[error("error reading stderr: {0}")]
    Stderr(#[source] io::Error),

    #[error("{0}")]
    Stopped(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("peer verification failed: {0}")]
    Verification(String),

    #[error("request failed: {0}")]
    Io(#[from] io::Error),

    #[error("malformed message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("server error: {0}")]
    Server(String),

    #[error("connection closed before a response arrived")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    #[error("user declined the elevation prompt")]
    Declined,

    #[error("failed to run elevated command: {0}")]
    Io(#[from] io::Error),
}
