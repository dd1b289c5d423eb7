use thiserror::Error;

pub type ConvoyResult<T> = Result<T, ConvoyError>;

/// Whether a remote failure may succeed on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Network hiccup, timeout, 5xx — retry with backoff.
    Transient,
    /// Validation/authorization rejection — retrying cannot help.
    Permanent,
}

/// An error returned by the remote backend.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn transient(message: impl Into<String>) -> Self {
        RemoteError {
            kind: RemoteErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        RemoteError {
            kind: RemoteErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == RemoteErrorKind::Transient
    }
}

#[derive(Debug, Error)]
pub enum ConvoyError {
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("persistence error: {0}")]
    Persist(String),

    #[error("network offline")]
    Offline,

    #[error("service '{name}' failed to initialize: {message}")]
    ServiceInit { name: String, message: String },

    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("unknown entity type: {0}")]
    UnknownEntity(String),

    #[error("merge policy error: {0}")]
    Policy(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
