use serde_derive::{Deserialize, Serialize};

/// Result type used across the crate.
pub type CResult<T> = std::result::Result<T, Error>;

/// Errors propagated by the storage, graph, consensus, and transport layers.
///
/// The split mirrors how the errors are handled: `Conflict` is retryable by
/// the caller, `ProposalRejected` is retried internally by the proposer,
/// `Cancelled` unwinds workers to shutdown, and everything else surfaces to
/// the operation that triggered it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Serialization failure in the backend; the caller may retry.
    Conflict,
    /// Medium error in the backend; fatal to the operation.
    Io(String),
    /// A persisted record failed checksum or decode validation.
    Corrupt(String),
    /// The backend ran out of transactions or queue capacity.
    ResourceExhausted,
    /// A wanted version beyond the node's current version was requested.
    InvalidVersion(u64),
    /// An operation was attempted in a state that forbids it (e.g. nested
    /// range transactions).
    InvalidState(String),

    /// Graph errors.
    NodeNotFound(String),
    NodeExists(String),
    EdgeNotFound(String),
    IncorrectNodeType(String),
    InvalidEnvironment(String),
    CreateNodeError(String),

    /// A prepare or propose round was rejected with a higher promised number.
    ProposalRejected(u64),
    /// The proposer gave up after exhausting its prepare rounds.
    QuorumUnreachable,

    /// Transport errors.
    ResolveFailed(String),
    Timeout,
    Decode(String),
    CrcMismatch { stored: u32, actual: u32 },

    /// Shutdown was requested while waiting.
    Cancelled,

    /// Anything else.
    Value(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Conflict => write!(f, "serialization conflict, retry transaction"),
            Error::Io(s) => write!(f, "io error: {}", s),
            Error::Corrupt(s) => write!(f, "corrupt record: {}", s),
            Error::ResourceExhausted => write!(f, "resource exhausted"),
            Error::InvalidVersion(v) => write!(f, "invalid wanted version {}", v),
            Error::InvalidState(s) => write!(f, "invalid state: {}", s),
            Error::NodeNotFound(n) => write!(f, "node not found: {}", n),
            Error::NodeExists(n) => write!(f, "node exists: {}", n),
            Error::EdgeNotFound(e) => write!(f, "edge not found: {}", e),
            Error::IncorrectNodeType(s) => write!(f, "incorrect node type: {}", s),
            Error::InvalidEnvironment(e) => write!(f, "invalid environment: {}", e),
            Error::CreateNodeError(n) => write!(f, "unable to create node: {}", n),
            Error::ProposalRejected(n) => write!(f, "proposal rejected, promised {}", n),
            Error::QuorumUnreachable => write!(f, "quorum unreachable"),
            Error::ResolveFailed(h) => write!(f, "unable to resolve: {}", h),
            Error::Timeout => write!(f, "timed out"),
            Error::Decode(s) => write!(f, "decode error: {}", s),
            Error::CrcMismatch { stored, actual } => {
                write!(f, "crc mismatch: stored {:08x} actual {:08x}", stored, actual)
            }
            Error::Cancelled => write!(f, "cancelled"),
            Error::Value(s) => write!(f, "{}", s),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Value(err.to_string())
    }
}

/// Stable result codes carried back to clients in `Ack.code`.
///
/// These values are part of the wire contract; do not renumber.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ErrorCode {
    Ok = 0,
    CreateNodeError = 1,
    EdgeNotFound = 2,
    IncorrectNodeType = 3,
    InvalidEnvironment = 4,
    NodeExists = 5,
    NodeNotFound = 6,
    Unknown = 255,
}

impl Error {
    /// The stable result code for this error.
    pub fn code(&self) -> u32 {
        let code = match self {
            Error::CreateNodeError(_) => ErrorCode::CreateNodeError,
            Error::EdgeNotFound(_) => ErrorCode::EdgeNotFound,
            Error::IncorrectNodeType(_) => ErrorCode::IncorrectNodeType,
            Error::InvalidEnvironment(_) => ErrorCode::InvalidEnvironment,
            Error::NodeExists(_) => ErrorCode::NodeExists,
            Error::NodeNotFound(_) => ErrorCode::NodeNotFound,
            _ => ErrorCode::Unknown,
        };
        code as u32
    }
}
