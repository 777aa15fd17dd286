//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

use serde::{Serialize, Deserialize};

/// Customized error type for Tandem. The closed set of variants is the
/// protocol's error taxonomy; replies carry these over the wire, so client
/// code can branch on exact error identity rather than on message text.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum TandemError {
    /// Key missing or empty.
    InvalidKey,
    /// Value missing or empty.
    InvalidValue,
    /// Key longer than the accepted bound.
    OversizedKey,
    /// Value longer than the accepted bound.
    OversizedValue,
    /// Key not present in storage.
    NoSuchKey,
    /// Malformed registration string or unexpected wire message.
    InvalidFormat,
    /// A network call did not complete within its timeout.
    SocketTimeout,
    /// Could not establish a connection to the remote end.
    CouldNotConnect,
    /// Could not create a local socket.
    CouldNotCreateSocket,
    /// Anything else (I/O, serialization, channel failures, ...).
    Other(String),
}

impl TandemError {
    pub fn msg(msg: impl ToString) -> Self {
        TandemError::Other(msg.to_string())
    }
}

impl fmt::Display for TandemError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // stable short strings; clients match on these
        match self {
            Self::InvalidKey => write!(f, "invalid key"),
            Self::InvalidValue => write!(f, "invalid value"),
            Self::OversizedKey => write!(f, "oversized key"),
            Self::OversizedValue => write!(f, "oversized value"),
            Self::NoSuchKey => write!(f, "no such key"),
            Self::InvalidFormat => write!(f, "invalid format"),
            Self::SocketTimeout => write!(f, "socket timeout"),
            Self::CouldNotConnect => write!(f, "could not connect"),
            Self::CouldNotCreateSocket => write!(f, "could not create socket"),
            Self::Other(msg) => write!(f, "{}", msg), // no literal quotes
        }
    }
}

impl error::Error for TandemError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `TandemError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for TandemError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                TandemError::Other(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `TandemError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for TandemError {
            fn from(e: $error) -> TandemError {
                TandemError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::mpsc::error::TryRecvError);
impl_from_error!(tokio::sync::watch::error::RecvError);
impl_from_error!(tokio::task::JoinError);

impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = TandemError::Other("what the heck?".into());
        assert_eq!(format!("{}", e), String::from("what the heck?"));
    }

    #[test]
    fn kind_display_stable() {
        assert_eq!(format!("{}", TandemError::NoSuchKey), "no such key");
        assert_eq!(format!("{}", TandemError::OversizedKey), "oversized key");
        assert_eq!(
            format!("{}", TandemError::CouldNotConnect),
            "could not connect"
        );
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = TandemError::from(io_error);
        assert!(format!("{}", e).contains("oh no!"));
    }
}
