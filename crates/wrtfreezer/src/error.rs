use std::fmt;

/// Failure classes surfaced in the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    ManifestUnavailable,
    ToolchainNotFound,
    Integrity,
    BuildFailure,
    Filesystem,
    Network,
    Cancelled,
    Aborted,
    Other,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::ManifestUnavailable => "manifest-unavailable",
            ErrorKind::ToolchainNotFound => "toolchain-not-found",
            ErrorKind::Integrity => "integrity",
            ErrorKind::BuildFailure => "build-failure",
            ErrorKind::Filesystem => "filesystem",
            ErrorKind::Network => "network",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Aborted => "aborted",
            ErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Other, msg)
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Configuration, msg)
    }

    pub fn manifest<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::ManifestUnavailable, msg)
    }

    pub fn toolchain_not_found<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::ToolchainNotFound, msg)
    }

    pub fn integrity<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Integrity, msg)
    }

    pub fn build<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::BuildFailure, msg)
    }

    pub fn fs<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Filesystem, msg)
    }

    pub fn network<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Network, msg)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled")
    }

    pub fn aborted<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Aborted, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.msg
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::fs(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::network(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
