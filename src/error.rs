use std::fmt;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors in featherchat. String payloads keep the type cheap to clone
/// across task and RPC boundaries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Configuration could not be loaded or parsed.
    Config(String),
    /// A caller-supplied value was rejected before any state change.
    InvalidInput(String),
    /// The referenced user or message does not exist.
    NotFound(String),
    /// The node handling the request is not the leader; the payload names
    /// the leader when known.
    NotLeader(String),
    /// A quorum of alive peers did not acknowledge the mutation.
    Replication(String),
    /// The embedded store failed at the engine level.
    Storage(String),
    /// An RPC could not be delivered.
    Transport(String),
    /// Everything else.
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(s) => write!(f, "configuration error: {}", s),
            Error::InvalidInput(s) => write!(f, "invalid input: {}", s),
            Error::NotFound(s) => write!(f, "not found: {}", s),
            Error::NotLeader(s) => write!(f, "not leader: {}", s),
            Error::Replication(s) => write!(f, "replication failed: {}", s),
            Error::Storage(s) => write!(f, "storage error: {}", s),
            Error::Transport(s) => write!(f, "transport error: {}", s),
            Error::Internal(s) => write!(f, "internal error: {}", s),
        }
    }
}

impl std::error::Error for Error {}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<bcrypt::BcryptError> for Error {
    fn from(err: bcrypt::BcryptError) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        Error::Transport(status.message().to_string())
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(err: tonic::transport::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(err: std::net::AddrParseError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Transport("request timed out".to_string())
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        match err {
            Error::InvalidInput(s) => tonic::Status::invalid_argument(s),
            Error::NotFound(s) => tonic::Status::not_found(s),
            other => tonic::Status::internal(other.to_string()),
        }
    }
}
