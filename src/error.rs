//! Status codes and error types for the native-extension ABI.
//!
//! Every ABI operation reports one of the [`Status`] codes. Inside the crate
//! failures travel as [`Error`] (the non-ok statuses) so they compose with `?`;
//! the environment records the last one so callers can read it back through
//! `get_last_error_info`.

use serde::{Deserialize, Serialize};
use tracing::error;

/// ABI status codes, in ABI order.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Success
    #[default]
    Ok = 0,
    /// Invalid argument
    InvalidArg,
    /// An object was expected
    ObjectExpected,
    /// A string was expected
    StringExpected,
    /// A string or symbol was expected
    NameExpected,
    /// A function was expected
    FunctionExpected,
    /// A number was expected
    NumberExpected,
    /// A boolean was expected
    BooleanExpected,
    /// An array was expected
    ArrayExpected,
    /// Unknown failure
    GenericFailure,
    /// An exception is pending
    PendingException,
    /// The async work item was cancelled
    Cancelled,
    /// Escape was already called on the scope
    EscapeCalledTwice,
    /// Invalid handle scope usage
    HandleScopeMismatch,
    /// Invalid callback scope usage
    CallbackScopeMismatch,
    /// Thread-safe function queue is full
    QueueFull,
    /// Thread-safe function handle is closing
    Closing,
    /// A bigint was expected
    BigintExpected,
}

/// Canonical messages indexed by status code. Append-only.
const ERROR_MESSAGES: [Option<&str>; 18] = [
    None,
    Some("Invalid argument"),
    Some("An object was expected"),
    Some("A string was expected"),
    Some("A string or symbol was expected"),
    Some("A function was expected"),
    Some("A number was expected"),
    Some("A boolean was expected"),
    Some("An array was expected"),
    Some("Unknown failure"),
    Some("An exception is pending"),
    Some("The async work item was cancelled"),
    Some("napi_escape_handle already called on scope"),
    Some("Invalid handle scope usage"),
    Some("Invalid callback scope usage"),
    Some("Thread-safe function queue is full"),
    Some("Thread-safe function handle is closing"),
    Some("A bigint was expected"),
];

impl Status {
    /// Canonical message for this status, `None` for [`Status::Ok`]
    pub fn message(self) -> Option<&'static str> {
        ERROR_MESSAGES[self as usize]
    }

    /// Raw ABI value
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Collapse a result into its status
    pub fn of<T>(result: &Result<T>) -> Status {
        match result {
            Ok(_) => Status::Ok,
            Err(e) => e.status(),
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Status::Ok => "napi_ok",
            Status::InvalidArg => "napi_invalid_arg",
            Status::ObjectExpected => "napi_object_expected",
            Status::StringExpected => "napi_string_expected",
            Status::NameExpected => "napi_name_expected",
            Status::FunctionExpected => "napi_function_expected",
            Status::NumberExpected => "napi_number_expected",
            Status::BooleanExpected => "napi_boolean_expected",
            Status::ArrayExpected => "napi_array_expected",
            Status::GenericFailure => "napi_generic_failure",
            Status::PendingException => "napi_pending_exception",
            Status::Cancelled => "napi_cancelled",
            Status::EscapeCalledTwice => "napi_escape_called_twice",
            Status::HandleScopeMismatch => "napi_handle_scope_mismatch",
            Status::CallbackScopeMismatch => "napi_callback_scope_mismatch",
            Status::QueueFull => "napi_queue_full",
            Status::Closing => "napi_closing",
            Status::BigintExpected => "napi_bigint_expected",
        };
        f.write_str(name)
    }
}

/// Failure of an ABI operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Invalid argument
    #[error("Invalid argument")]
    InvalidArg,
    /// An object was expected
    #[error("An object was expected")]
    ObjectExpected,
    /// A string was expected
    #[error("A string was expected")]
    StringExpected,
    /// A string or symbol was expected
    #[error("A string or symbol was expected")]
    NameExpected,
    /// A function was expected
    #[error("A function was expected")]
    FunctionExpected,
    /// A number was expected
    #[error("A number was expected")]
    NumberExpected,
    /// A boolean was expected
    #[error("A boolean was expected")]
    BooleanExpected,
    /// An array was expected
    #[error("An array was expected")]
    ArrayExpected,
    /// Unknown failure
    #[error("Unknown failure")]
    GenericFailure,
    /// An engine exception was captured into the pending-exception slot
    #[error("An exception is pending")]
    PendingException,
    /// The async work item was cancelled
    #[error("The async work item was cancelled")]
    Cancelled,
    /// Escape was already called on the scope
    #[error("napi_escape_handle already called on scope")]
    EscapeCalledTwice,
    /// Invalid handle scope usage
    #[error("Invalid handle scope usage")]
    HandleScopeMismatch,
    /// Invalid callback scope usage
    #[error("Invalid callback scope usage")]
    CallbackScopeMismatch,
    /// Thread-safe function queue is full
    #[error("Thread-safe function queue is full")]
    QueueFull,
    /// Thread-safe function handle is closing
    #[error("Thread-safe function handle is closing")]
    Closing,
    /// A bigint was expected
    #[error("A bigint was expected")]
    BigintExpected,
}

impl Error {
    /// ABI status for this error
    pub fn status(self) -> Status {
        match self {
            Error::InvalidArg => Status::InvalidArg,
            Error::ObjectExpected => Status::ObjectExpected,
            Error::StringExpected => Status::StringExpected,
            Error::NameExpected => Status::NameExpected,
            Error::FunctionExpected => Status::FunctionExpected,
            Error::NumberExpected => Status::NumberExpected,
            Error::BooleanExpected => Status::BooleanExpected,
            Error::ArrayExpected => Status::ArrayExpected,
            Error::GenericFailure => Status::GenericFailure,
            Error::PendingException => Status::PendingException,
            Error::Cancelled => Status::Cancelled,
            Error::EscapeCalledTwice => Status::EscapeCalledTwice,
            Error::HandleScopeMismatch => Status::HandleScopeMismatch,
            Error::CallbackScopeMismatch => Status::CallbackScopeMismatch,
            Error::QueueFull => Status::QueueFull,
            Error::Closing => Status::Closing,
            Error::BigintExpected => Status::BigintExpected,
        }
    }
}

impl From<Error> for Status {
    fn from(e: Error) -> Self {
        e.status()
    }
}

/// Result type alias for ABI operations
pub type Result<T> = std::result::Result<T, Error>;

/// Detailed information about the last failed ABI call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtendedErrorInfo {
    /// Canonical message, attached when the info is read
    pub error_message: Option<&'static str>,
    /// Engine specific error code, zero when unused
    pub engine_error_code: u32,
    /// Status of the last call
    pub error_code: Status,
}

/// Embedder-level failures that are not part of the ABI status table
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Configuration could not be read or is invalid
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// No live environment with this id on the current thread
    #[error("Environment {0} not found on this thread")]
    EnvironmentNotFound(crate::env::EnvId),

    /// Tracing subscriber could not be installed
    #[error("Logging setup failed: {0:#}")]
    Logging(#[source] anyhow::Error),
}

/// Result type alias for embedder-level operations
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// Abort on a capability this binding does not provide.
///
/// These are not recoverable statuses: a caller that reaches one is using a
/// feature the engine binding cannot express.
#[track_caller]
pub fn fatal_error(location: &str, message: &str) -> ! {
    error!(location, message, "Fatal error in native extension bridge");
    panic!("FATAL ERROR: {} {}", location, message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_order_matches_abi() {
        assert_eq!(Status::Ok.code(), 0);
        assert_eq!(Status::InvalidArg.code(), 1);
        assert_eq!(Status::PendingException.code(), 10);
        assert_eq!(Status::Closing.code(), 16);
        assert_eq!(Status::BigintExpected.code(), 17);
    }

    #[test]
    fn test_message_table() {
        assert_eq!(Status::Ok.message(), None);
        assert_eq!(Status::ArrayExpected.message(), Some("An array was expected"));
        assert_eq!(
            Status::Closing.message(),
            Some("Thread-safe function handle is closing")
        );
    }

    #[test]
    fn test_error_display_matches_table() {
        for err in [
            Error::InvalidArg,
            Error::NameExpected,
            Error::PendingException,
            Error::EscapeCalledTwice,
            Error::QueueFull,
            Error::BigintExpected,
        ] {
            assert_eq!(Some(err.to_string().as_str()), err.status().message());
        }
    }

    #[test]
    fn test_status_display() {
        assert_eq!(Status::Ok.to_string(), "napi_ok");
        assert_eq!(Status::NameExpected.to_string(), "napi_name_expected");
    }

    #[test]
    fn test_status_of_result() {
        let ok: Result<u32> = Ok(1);
        let failed: Result<u32> = Err(Error::Closing);
        assert_eq!(Status::of(&ok), Status::Ok);
        assert_eq!(Status::of(&failed), Status::Closing);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&Status::PendingException).unwrap();
        assert_eq!(json, "\"PENDING_EXCEPTION\"");
    }

    #[test]
    #[should_panic(expected = "FATAL ERROR")]
    fn test_fatal_error_panics() {
        fatal_error("napi_create_buffer", "not supported");
    }
}
