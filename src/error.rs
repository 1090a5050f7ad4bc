use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::config::NodeAddr;

/// emberkv errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// An I/O failure. Fatal to the operation that hit it; the caller decides
    /// whether to retry.
    Io(String),
    /// Malformed on-disk data: a truncated SST, an inconsistent index block,
    /// a bad manifest. Fatal on open.
    Corruption(String),
    /// A write was attempted on a read-only structure (frozen memtable).
    ReadOnly,
    /// An operation was attempted on a component in the wrong state.
    InvalidOperation(String),
    /// The replicated log's ring buffer is full. Retriable.
    LogFull,
    /// The operation must be served by the leader. Carries the believed
    /// leader address when one is known.
    NotLeader(Option<NodeAddr>),
    /// A peer RPC did not respond within its deadline.
    Timeout,
    /// The component has been shut down.
    Stopped,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::ReadOnly => write!(f, "write attempted on read-only structure"),
            Error::InvalidOperation(msg) => write!(f, "invalid operation: {msg}"),
            Error::LogFull => write!(f, "replicated log is full"),
            Error::NotLeader(Some(addr)) => write!(f, "not leader, redirect to {addr}"),
            Error::NotLeader(None) => write!(f, "not leader, no known leader"),
            Error::Timeout => write!(f, "peer rpc timed out"),
            Error::Stopped => write!(f, "component is shut down"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

/// An emberkv Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;
