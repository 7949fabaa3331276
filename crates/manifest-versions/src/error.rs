use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum Error {
    Msg(String),
    VersionParse(String),
    MissingVersionFile(PathBuf),
    GenerateBuildSpec { attempts: usize, last: String },
    PromoteCandidate { attempts: usize, last: String },
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::Msg(msg.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Msg(msg) => write!(f, "{msg}"),
            Error::VersionParse(s) => write!(f, "could not parse version string '{s}'"),
            Error::MissingVersionFile(p) => {
                write!(f, "version file {} is missing or unreadable", p.display())
            }
            Error::GenerateBuildSpec { attempts, last } => write!(
                f,
                "failed to generate build spec after {attempts} attempts: {last}"
            ),
            Error::PromoteCandidate { attempts, last } => write!(
                f,
                "failed to promote candidate after {attempts} attempts: {last}"
            ),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::msg(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of a single publish attempt against the shared spec remote.
///
/// `Conflict` means another writer advanced the remote (or already owns the
/// target path); the caller fixes this by re-syncing and recomputing, not by
/// repeating the same push. `Transient` covers infrastructure failures that
/// survived the git layer's own retry. `Fatal` is neither and is never
/// retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    Conflict(String),
    Transient(String),
    Fatal(String),
}

impl PublishError {
    pub fn message(&self) -> &str {
        match self {
            PublishError::Conflict(m) | PublishError::Transient(m) | PublishError::Fatal(m) => m,
        }
    }
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::Conflict(m) => write!(f, "publish conflict: {m}"),
            PublishError::Transient(m) => write!(f, "transient publish failure: {m}"),
            PublishError::Fatal(m) => write!(f, "publish failed: {m}"),
        }
    }
}

impl std::error::Error for PublishError {}

impl From<PublishError> for Error {
    fn from(err: PublishError) -> Self {
        Error::msg(err.to_string())
    }
}
