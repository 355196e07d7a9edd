//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::num;
use std::string;

/// Customized error type for raproxy.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct RapError(String);

impl RapError {
    pub fn msg(msg: impl ToString) -> Self {
        RapError(msg.to_string())
    }
}

impl fmt::Display for RapError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl error::Error for RapError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `RapError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for RapError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                RapError(e.to_string())
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `RapError`.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for RapError {
            fn from(e: $error) -> RapError {
                RapError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(num::ParseFloatError);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::mpsc::error::TryRecvError);
impl_from_error!(tokio::task::JoinError);

impl_from_error_generic!(tokio::sync::SetError<T>);
impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);
