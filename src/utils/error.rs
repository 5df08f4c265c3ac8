//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

/// Customized error type for gridkv.
///
/// Most run-time failures end up in the `Msg` catch-all; the named variants
/// form the error taxonomy that callers are expected to match on.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum GridError {
    /// A command was performed against an entry that was never wrapped into
    /// the invocation context. Programming-contract violation, fatal.
    EntryNotWrapped(String),

    /// The write-skew check detected a conflicting concurrent write; the
    /// transaction was rolled back and may be retried by the caller.
    WriteSkew(String),

    /// The requested operation is not allowed under the current
    /// configuration (e.g. explicit locking on an optimistic cache).
    InvalidUsage(String),

    /// A remote or transport failure surfaced through the clustered lock,
    /// or an internal lock invariant violation.
    ClusteredLock(String),

    /// The command was built under an outdated cluster topology; the
    /// evaluator re-stamps and retries before surfacing this.
    StaleTopology { seen: u64, current: u64 },

    /// Any other run-time error.
    Msg(String),
}

impl GridError {
    pub fn msg(msg: impl ToString) -> Self {
        GridError::Msg(msg.to_string())
    }
}

impl fmt::Display for GridError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GridError::EntryNotWrapped(s) => {
                write!(f, "entry not wrapped: {}", s)
            }
            GridError::WriteSkew(s) => write!(f, "write skew: {}", s),
            GridError::InvalidUsage(s) => write!(f, "invalid usage: {}", s),
            GridError::ClusteredLock(s) => {
                write!(f, "clustered lock: {}", s)
            }
            GridError::StaleTopology { seen, current } => {
                write!(f, "stale topology: seen {} current {}", seen, current)
            }
            GridError::Msg(s) => write!(f, "{}", s), // no literal quotes
        }
    }
}

impl error::Error for GridError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `GridError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for GridError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                GridError::Msg(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `GridError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for GridError {
            fn from(e: $error) -> GridError {
                GridError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(num::ParseFloatError);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::oneshot::error::RecvError);
impl_from_error!(tokio::sync::mpsc::error::TryRecvError);
impl_from_error!(tokio::time::error::Elapsed);
impl_from_error!(tokio::task::JoinError);

impl_from_error_generic!(tokio::sync::SetError<T>);
impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = GridError::msg("what the heck?");
        assert_eq!(format!("{}", e), String::from("what the heck?"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = GridError::from(io_error);
        assert!(matches!(e, GridError::Msg(s) if s.contains("oh no!")));
    }

    #[test]
    fn taxonomy_display() {
        let e = GridError::StaleTopology { seen: 3, current: 5 };
        assert_eq!(format!("{}", e), "stale topology: seen 3 current 5");
    }
}
