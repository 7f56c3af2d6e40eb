//! Error types shared by the reconciliation components.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while reconciling host state.
#[derive(Debug, Error)]
pub enum Error {
    /// The container engine rejected a request or could not be reached.
    #[error("container runtime error: {0}")]
    Runtime(#[from] bollard::errors::Error),

    /// The engine accepted a request but left things in an unexpected state.
    #[error("container engine: {subject}: {reason}")]
    Engine { subject: String, reason: String },

    /// Remote fetch failed at the transport level.
    #[error("failed to fetch {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Remote fetch returned a non-success status.
    #[error("fetching {url} returned HTTP {status}")]
    FetchStatus { url: String, status: u16 },

    /// Filesystem access failed.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A `/proc` table could not be parsed.
    #[error("failed to parse {}: {detail}", path.display())]
    ProcParse { path: PathBuf, detail: String },

    /// Sending a signal to a process failed.
    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: nix::Error,
    },

    /// An external command exited unsuccessfully.
    #[error("`{command}` failed: {detail}")]
    Command { command: String, detail: String },

    /// The tunnel secret file is missing or empty.
    #[error("secret file {} is missing or empty", .0.display())]
    MissingSecret(PathBuf),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the failure is expected to clear up on its own (network or
    /// engine transport trouble) rather than indicating a broken host.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Fetch { .. } | Error::FetchStatus { .. } => true,
            Error::Runtime(e) => !matches!(
                e,
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 400..=499,
                    ..
                }
            ),
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
