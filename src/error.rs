//! Error types for the discovery crate

use crate::types::Instance;
use std::{error::Error as StdError, fmt};

/// Integer reply code carried by every discovery endpoint.
///
/// `0` is success; well-known negative values name protocol outcomes, any
/// other non-zero value is a generic failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Code(pub i64);

impl Code {
    /// Success.
    pub const OK: Code = Code(0);
    /// No watched app changed since the supplied baselines.
    pub const NOT_MODIFIED: Code = Code(-304);
    /// The server holds no record of the target.
    pub const NOTHING_FOUND: Code = Code(-404);
    /// A replica holds a conflicting, newer record.
    pub const CONFLICT: Code = Code(-409);
    /// Server-side failure.
    pub const SERVER_ERR: Code = Code(-500);

    /// Whether this code signals success.
    pub fn is_ok(self) -> bool {
        self == Code::OK
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Code::OK => write!(f, "0 (ok)"),
            Code::NOT_MODIFIED => write!(f, "-304 (not modified)"),
            Code::NOTHING_FOUND => write!(f, "-404 (nothing found)"),
            Code::CONFLICT => write!(f, "-409 (conflict)"),
            Code::SERVER_ERR => write!(f, "-500 (server error)"),
            Code(other) => write!(f, "{other}"),
        }
    }
}

/// The primary error type for the discovery crate
#[derive(Debug)]
pub enum Error {
    /// The appid is already registered by this client.
    Duplication,
    /// The client has been closed; background tasks have stopped.
    Closed,
    /// Invalid configuration.
    Config(String),
    /// The server answered with a non-OK reply code.
    Code(Code),
    /// A peer rejected a replicated mutation because it holds a newer
    /// record. The winning record is attached when the reply body could be
    /// decoded.
    Conflict(Option<Box<Instance>>),
    /// Transport-level failure.
    Transport(reqwest::Error),
}

impl Error {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// The wire code behind this error, if it carries one.
    pub fn code(&self) -> Option<Code> {
        match self {
            Self::Code(code) => Some(*code),
            Self::Conflict(_) => Some(Code::CONFLICT),
            _ => None,
        }
    }

    /// Whether the server answered `NothingFound`.
    pub fn is_nothing_found(&self) -> bool {
        self.code() == Some(Code::NOTHING_FOUND)
    }

    /// Whether the server answered `NotModified`.
    pub fn is_not_modified(&self) -> bool {
        self.code() == Some(Code::NOT_MODIFIED)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Duplication => write!(f, "discovery: instance duplicate registration"),
            Self::Closed => write!(f, "discovery: client closed"),
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Code(code) => write!(f, "discovery: server code {code}"),
            Self::Conflict(Some(winning)) => {
                write!(f, "discovery: conflict, winning record appid({})", winning.app_id)
            }
            Self::Conflict(None) => write!(f, "discovery: conflict"),
            Self::Transport(err) => write!(f, "transport error: {err}"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Transport(err) => Some(err),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err)
    }
}

/// Common result type for crate operations
pub type Result<T> = std::result::Result<T, Error>;
