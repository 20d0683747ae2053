#![forbid(unsafe_code)]

//! Server-side error type.
//!
//! Every failure carries a tag the caller can branch on; the CLI boundary
//! reduces any of these to a single human-readable line and a non-zero exit.

use engram_core::ConfigError;
use engram_fold::FoldError;
use engram_storage::StoreError;

#[derive(Debug)]
pub enum ServerError {
    Io(std::io::Error),
    Config(ConfigError),
    Store(StoreError),
    Fold(FoldError),
    /// Fold agent exited non-zero, could not be spawned, or timed out.
    Agent(String),
    /// Git operation that the caller cannot proceed without.
    Git(String),
    /// Migration precondition or processing failure.
    Migrate(String),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "io: {err}"),
            Self::Config(err) => write!(f, "{err}"),
            Self::Store(err) => write!(f, "{err}"),
            Self::Fold(err) => write!(f, "{err}"),
            Self::Agent(message) => write!(f, "fold agent: {message}"),
            Self::Git(message) => write!(f, "git: {message}"),
            Self::Migrate(message) => write!(f, "migrate: {message}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for ServerError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<ConfigError> for ServerError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<StoreError> for ServerError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<FoldError> for ServerError {
    fn from(value: FoldError) -> Self {
        Self::Fold(value)
    }
}
