use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure classes reported by embedding providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedderErrorKind {
    /// Transport-level failure (connect, timeout, 5xx). Retried with backoff.
    Network,
    /// The provider answered with something we could not interpret.
    Protocol,
    /// Missing or rejected credentials.
    Auth,
    /// A returned vector does not match the declared dimensions.
    Dimensions,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("embedder error ({kind:?}): {message}")]
    Embedder {
        kind: EmbedderErrorKind,
        message: String,
    },

    #[error("store error: {0}")]
    Store(String),

    #[error("path escapes project root: {0}")]
    FailedPath(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(message.into())
    }

    pub fn store(message: impl Into<String>) -> Self {
        Error::Store(message.into())
    }

    pub fn embedder(kind: EmbedderErrorKind, message: impl Into<String>) -> Self {
        Error::Embedder {
            kind,
            message: message.into(),
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Store(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Store(e.to_string())
    }
}
