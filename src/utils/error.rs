//! Customized unified error type.

use std::fmt;
use std::io;
use std::net;

use tokio::sync::{mpsc, watch};

/// Customized error type for paxkv.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PaxkvError(pub String);

impl PaxkvError {
    /// Wraps anything that can be stringified into a `PaxkvError`.
    pub fn msg(e: impl ToString) -> Self {
        PaxkvError(e.to_string())
    }
}

impl fmt::Display for PaxkvError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl std::error::Error for PaxkvError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `PaxkvError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for PaxkvError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                PaxkvError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(net::AddrParseError);
impl_from_error!(std::num::ParseIntError);
impl_from_error!(std::string::FromUtf8Error);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(mpsc::error::TryRecvError);

impl<T> From<mpsc::error::SendError<T>> for PaxkvError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        PaxkvError(e.to_string())
    }
}

impl<T> From<watch::error::SendError<T>> for PaxkvError {
    fn from(e: watch::error::SendError<T>) -> Self {
        PaxkvError(e.to_string())
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = PaxkvError("what the heck?".into());
        assert_eq!(format!("{}", e), String::from("what the heck?"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = PaxkvError::from(io_error);
        assert!(e.0.contains("oh no!"));
    }

    #[test]
    fn from_msg() {
        let e = PaxkvError::msg("bad things");
        assert_eq!(e, PaxkvError("bad things".into()));
    }
}
