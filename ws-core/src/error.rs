pub use anyhow::bail;
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    Config(String),
    Runtime(String),
    Io(#[from] std::io::Error),
    Command(String),
    Dependency(String),
    Network(String),
    Timeout(String),
    NotFound(String),
    Validation(String),
    Serialization(String),
    Internal(String),
    Other(#[from] anyhow::Error),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Error::Config(s) => write!(f, "Configuration error: {}", s),
            Error::Runtime(s) => write!(f, "Runtime error: {}", s),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Command(s) => write!(f, "Command failed: {}", s),
            Error::Dependency(s) => {
                write!(f, "Dependency not found: {}\n\n", s)?;
                write!(f, "Fix:\n")?;
                write!(f, "  • Install '{}' and make sure it is on PATH", s)
            }
            Error::Network(s) => write!(f, "Network error: {}", s),
            Error::Timeout(s) => write!(f, "Timed out: {}", s),
            Error::NotFound(s) => write!(f, "Not found: {}", s),
            Error::Validation(s) => write!(f, "Validation error: {}", s),
            Error::Serialization(s) => write!(f, "Serialization error: {}", s),
            Error::Internal(s) => write!(f, "Internal error: {}", s),
            Error::Other(e) => write!(f, "Other error: {}", e),
        }
    }
}

impl From<serde_yaml_ng::Error> for Error {
    fn from(err: serde_yaml_ng::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Internal(format!("blocking task failed: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
