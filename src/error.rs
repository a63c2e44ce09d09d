//! Status taxonomy (§7) and setup-time error type.

use std::fmt;

/// Per-operation result status, propagated end-to-end from the KV index and
/// backend chain out to the wire response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    NotFound,
    ValueTooBig,
    NoSpace,
    Timeout,
    Error,
}

impl Status {
    pub fn is_ok(self) -> bool {
        matches!(self, Status::Ok)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Ok => "OK",
            Status::NotFound => "NOT_FOUND",
            Status::ValueTooBig => "VALUE_TOO_BIG",
            Status::NoSpace => "NO_SPACE",
            Status::Timeout => "TIMEOUT",
            Status::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Setup-time failures that have no caller to report a `Status` to: bad
/// config, a rejected arena path, a malformed backend address string.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("arena error: {0}")]
    Arena(String),

    #[error("invalid backend address: {0}")]
    BackendAddress(String),
}
