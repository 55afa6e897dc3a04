use std::convert::From;
use toml;

#[derive(Debug)]
pub enum Error {
    IOError(std::io::Error),
    SetLoggerError(log::SetLoggerError),
    TOMLDeError(toml::de::Error),
    PopenError(subprocess::PopenError),
    XMLError(roxmltree::Error),
    JSONError(serde_json::Error),
    JoinError(tokio::task::JoinError),
    RegexError(regex::Error),
    SyscommandTimeoutError {
        stdout: Option<String>,
        stderr: Option<String>,
    },
    SyscommandOutputLimitExceededError {
        limit: usize,
        stdout: Option<String>,
        stderr: Option<String>,
    },
    /// The requested timeout did not match the accepted format.
    TimeoutFormatError(String),
    /// The workspace for an execution could not be allocated or written.
    SetupError(String),
    RawError(String),
}

impl std::error::Error for Error {}
impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IOError(e) => {
                write!(f, "[IOError] {e}")
            }
            Error::SetLoggerError(e) => {
                write!(f, "[SetLoggerError] {e}")
            }
            Error::TOMLDeError(e) => {
                write!(f, "[TOMLDeError] {e}")
            }
            Error::PopenError(e) => {
                write!(f, "[PopenError] {e}")
            }
            Error::XMLError(e) => {
                write!(f, "[XMLError] {e}")
            }
            Error::JSONError(e) => {
                write!(f, "[JSONError] {e}")
            }
            Error::JoinError(e) => {
                write!(f, "[JoinError] {e}")
            }
            Error::RegexError(e) => {
                write!(f, "[RegexError] {e}")
            }
            Error::SyscommandTimeoutError { .. } => {
                write!(f, "[SyscommandTimeoutError]")
            }
            Error::SyscommandOutputLimitExceededError { limit, .. } => {
                write!(f, "[SyscommandOutputLimitExceededError] limit: {limit}")
            }
            Error::TimeoutFormatError(s) => {
                write!(f, "[TimeoutFormatError] Timeout is not in the right format: \"{s}\"")
            }
            Error::SetupError(s) => {
                write!(f, "[SetupError] {s}")
            }
            Error::RawError(s) => {
                write!(f, "{s}")
            }
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::IOError(e)
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(e: log::SetLoggerError) -> Self {
        Error::SetLoggerError(e)
    }
}

impl From<fern::InitError> for Error {
    fn from(e: fern::InitError) -> Self {
        match e {
            fern::InitError::Io(e) => Self::from(e),
            fern::InitError::SetLoggerError(e) => Self::from(e),
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::TOMLDeError(e)
    }
}

impl From<subprocess::PopenError> for Error {
    fn from(e: subprocess::PopenError) -> Self {
        Error::PopenError(e)
    }
}

impl From<roxmltree::Error> for Error {
    fn from(e: roxmltree::Error) -> Self {
        Error::XMLError(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::JSONError(e)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::JoinError(e)
    }
}

impl From<regex::Error> for Error {
    fn from(e: regex::Error) -> Self {
        Error::RegexError(e)
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::RawError(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::RawError(String::from(s))
    }
}

impl Error {
    /// Wraps an error that happened while preparing a workspace, so that it
    /// is reported as an infrastructure failure.
    pub fn setup<E: std::fmt::Display>(context: &str, e: E) -> Self {
        Error::SetupError(format!("{context}: {e}"))
    }

    pub fn output_limit(limit: usize) -> Self {
        Error::SyscommandOutputLimitExceededError {
            limit: limit,
            stdout: None,
            stderr: None,
        }
    }
}
