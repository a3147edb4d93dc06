//! Error handling for booster.
//!
//! Provides a unified error handling system based on gRPC status codes,
//! with mapping from various underlying errors to appropriate categories.
//!
//! # Error Categories
//!
//! Errors are categorized into standard types that map to HTTP status codes:
//! * Authentication/authorization failures (401, 403)
//! * Resource state (404, 409)
//! * Client errors (400, 429)
//! * Server errors (500, 501, 503)
//! * Timeouts and cancellation (499, 504)
//!
//! The credential lifecycle narrows these kinds down further: see
//! [`refresh::Reason`](crate::refresh::Reason) for how a failed refresh is
//! classified as either requiring a new login or being worth a retry.
//!
//! # Example
//!
//! ```rust
//! use booster::error::{Error, ErrorKind, Result};
//!
//! fn do_something() -> Result<()> {
//!     if condition {
//!         return Err(Error::not_found("no such device"));
//!     }
//!
//!     // Convert from standard errors
//!     let file = std::fs::File::open("session.toml")?;
//!
//!     Ok(())
//! }
//! ```

#![allow(clippy::enum_glob_use)]

use std::fmt;

use http::StatusCode;
use thiserror::Error;

/// Main error type combining error kind and details.
#[derive(Debug)]
pub struct Error {
    /// Classification of the error
    pub kind: ErrorKind,

    /// Details of the underlying error
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

/// Standard result type for booster operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories based on gRPC status codes.
///
/// See [gRPC status codes](https://github.com/googleapis/googleapis/blob/master/google/rpc/code.proto)
/// for the original definitions.
#[expect(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum ErrorKind {
    /// HTTP Mapping: 499 Client Closed Request
    #[error("operation was cancelled")]
    Cancelled = 1,

    /// HTTP Mapping: 500 Internal Server Error
    #[error("unknown error")]
    Unknown = 2,

    /// HTTP Mapping: 400 Bad Request
    #[error("invalid argument specified")]
    InvalidArgument = 3,

    /// HTTP Mapping: 504 Gateway Timeout
    #[error("operation timed out")]
    DeadlineExceeded = 4,

    /// HTTP Mapping: 404 Not Found
    #[error("not found")]
    NotFound = 5,

    /// HTTP Mapping: 409 Conflict
    #[error("attempt to create what already exists")]
    AlreadyExists = 6,

    /// HTTP Mapping: 403 Forbidden
    #[error("permission denied")]
    PermissionDenied = 7,

    /// HTTP Mapping: 401 Unauthorized
    #[error("no valid authentication credentials")]
    Unauthenticated = 16,

    /// HTTP Mapping: 429 Too Many Requests
    #[error("resource has been exhausted")]
    ResourceExhausted = 8,

    /// HTTP Mapping: 400 Bad Request
    #[error("invalid state")]
    FailedPrecondition = 9,

    /// HTTP Mapping: 409 Conflict
    #[error("operation aborted")]
    Aborted = 10,

    /// HTTP Mapping: 501 Not Implemented
    #[error("not implemented")]
    Unimplemented = 12,

    /// HTTP Mapping: 500 Internal Server Error
    #[error("internal error")]
    Internal = 13,

    /// HTTP Mapping: 503 Service Unavailable
    #[error("service unavailable")]
    Unavailable = 14,

    /// HTTP Mapping: 500 Internal Server Error
    #[error("unrecoverable data loss or corruption")]
    DataLoss = 15,
}

impl ErrorKind {
    /// Whether the failure means the user has to log in again.
    ///
    /// Only a rejected credential does. A refusal like `PermissionDenied`
    /// leaves the credential usable, so it counts as transient along with
    /// everything else.
    #[must_use]
    pub fn requires_login(self) -> bool {
        self == Self::Unauthenticated
    }
}

macro_rules! constructors {
    ($($(#[$meta:meta])* $name:ident => $kind:ident,)*) => {
        impl Error {
            $(
                $(#[$meta])*
                pub fn $name<E>(error: E) -> Self
                where
                    E: Into<Box<dyn std::error::Error + Send + Sync>>,
                {
                    Self::new(ErrorKind::$kind, error)
                }
            )*
        }
    };
}

impl Error {
    /// Creates a new error with specified kind and details.
    ///
    /// # Examples
    ///
    /// ```rust
    /// let err = Error::new(ErrorKind::NotFound, "device not found");
    /// assert_eq!(err.kind, ErrorKind::NotFound);
    /// ```
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            error: error.into(),
        }
    }

    /// Creates an error from an unsuccessful HTTP response.
    ///
    /// Maps the status code onto the closest [`ErrorKind`]:
    /// * 400 -> `InvalidArgument`
    /// * 401 -> `Unauthenticated`
    /// * 403 -> `PermissionDenied`
    /// * 404 -> `NotFound`
    /// * 408, 504 -> `DeadlineExceeded`
    /// * 409 -> `Aborted`
    /// * 429 -> `ResourceExhausted`
    /// * 501 -> `Unimplemented`
    /// * other 5xx -> `Unavailable`
    pub fn from_status(status: StatusCode, detail: impl fmt::Display) -> Self {
        let error = format!("{status}: {detail}");
        let kind = match status {
            StatusCode::BAD_REQUEST => ErrorKind::InvalidArgument,
            StatusCode::UNAUTHORIZED => ErrorKind::Unauthenticated,
            StatusCode::FORBIDDEN => ErrorKind::PermissionDenied,
            StatusCode::NOT_FOUND => ErrorKind::NotFound,
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
                ErrorKind::DeadlineExceeded
            }
            StatusCode::CONFLICT => ErrorKind::Aborted,
            StatusCode::TOO_MANY_REQUESTS => ErrorKind::ResourceExhausted,
            StatusCode::NOT_IMPLEMENTED => ErrorKind::Unimplemented,
            status if status.is_server_error() => ErrorKind::Unavailable,
            _ => ErrorKind::Unknown,
        };

        Self::new(kind, error)
    }
}

constructors! {
    /// Creates an error for operations that were interrupted mid-execution.
    aborted => Aborted,

    /// Creates an error for attempts to create what already exists.
    already_exists => AlreadyExists,

    /// Creates an error for cancelled operations.
    cancelled => Cancelled,

    /// Creates an error for corrupted or truncated data.
    data_loss => DataLoss,

    /// Creates an error for operations that did not finish in time.
    ///
    /// Maps to HTTP 504 Gateway Timeout.
    deadline_exceeded => DeadlineExceeded,

    /// Creates an error for internal errors.
    internal => Internal,

    /// Creates an error for invalid arguments.
    ///
    /// Maps to HTTP 400 Bad Request. Configuration that is rejected at the
    /// boundary, like a schedule window that ends before it starts, uses this
    /// kind.
    invalid_argument => InvalidArgument,

    /// Creates an error for missing resources.
    not_found => NotFound,

    /// Creates an error for permission denied conditions.
    permission_denied => PermissionDenied,

    /// Creates an error for exhausted resources.
    resource_exhausted => ResourceExhausted,

    /// Creates an error for authentication failures.
    ///
    /// Maps to HTTP 401 Unauthorized. Use when:
    /// * Credentials are invalid
    /// * The refresh token is missing or was revoked
    /// * Authentication is required but missing
    unauthenticated => Unauthenticated,

    /// Creates an error for unavailable services.
    unavailable => Unavailable,

    /// Creates an error for unimplemented features.
    unimplemented => Unimplemented,

    /// Creates an error for unknown errors.
    unknown => Unknown,
}

/// Returns the underlying error source.
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

/// Formats the error for display, showing both kind and details.
///
/// Format: "{kind}: {details}"
impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}: ", self.kind)?;
        self.error.fmt(fmt)
    }
}

/// Converts IO errors into appropriate error kinds.
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            NotFound => Self::not_found(err),
            PermissionDenied => Self::permission_denied(err),
            AddrInUse | AlreadyExists => Self::already_exists(err),
            AddrNotAvailable | ConnectionRefused | NotConnected => Self::unavailable(err),
            BrokenPipe | ConnectionReset | ConnectionAborted => Self::aborted(err),
            Interrupted | WouldBlock => Self::cancelled(err),
            UnexpectedEof => Self::data_loss(err),
            TimedOut => Self::deadline_exceeded(err),
            InvalidInput | InvalidData => Self::invalid_argument(err),
            WriteZero => Self::resource_exhausted(err),
            _ => Self::unknown(err),
        }
    }
}

/// Converts HTTP client errors into appropriate error kinds.
///
/// Maps HTTP errors based on their nature:
/// * Status errors -> mapped like [`Error::from_status`]
/// * Timeout errors -> `DeadlineExceeded`
/// * Connect errors -> `Unavailable`
/// * Body errors -> `DataLoss`
/// * Decode errors -> `InvalidArgument`
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status, err);
        }

        if err.is_timeout() {
            return Self::deadline_exceeded(err);
        }

        if err.is_connect() || err.is_request() {
            return Self::unavailable(err);
        }

        if err.is_body() {
            return Self::data_loss(err);
        }

        if err.is_decode() {
            return Self::invalid_argument(err);
        }

        if err.is_builder() {
            return Self::internal(err);
        }

        if err.is_redirect() {
            return Self::resource_exhausted(err);
        }

        Self::unknown(err)
    }
}

/// Converts WebSocket errors into appropriate error kinds.
///
/// * `ConnectionClosed` -> `Cancelled`
/// * `AlreadyClosed` -> `Unavailable`
/// * `Io` -> mapped like IO errors
/// * `Capacity` -> `ResourceExhausted`
impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error::*;
        match err {
            ConnectionClosed => Self::cancelled(err),
            AlreadyClosed => Self::unavailable(err),
            Io(err) => err.into(),
            Capacity(err) => Self::resource_exhausted(err),
            _ => Self::unknown(err),
        }
    }
}

/// Converts JSON errors through IO error mapping.
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        std::io::Error::from(err).into()
    }
}

/// Converts TOML parsing errors to `InvalidArgument`.
impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::invalid_argument(e)
    }
}

/// Converts TOML serialization errors to `Internal`.
impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Self::internal(e)
    }
}

/// Converts invalid header errors to `Internal`.
impl From<http::header::InvalidHeaderValue> for Error {
    fn from(e: http::header::InvalidHeaderValue) -> Self {
        Self::internal(e.to_string())
    }
}

/// Converts URL parsing errors to `Internal`.
impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::internal(e.to_string())
    }
}

/// Converts date and time parsing errors to `InvalidArgument`.
impl From<time::error::Parse> for Error {
    fn from(e: time::error::Parse) -> Self {
        Self::invalid_argument(e)
    }
}

/// Converts timeout errors to `DeadlineExceeded`.
impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Self::deadline_exceeded(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_kinds() {
        let kind = |status| Error::from_status(status, "test").kind;

        assert_eq!(kind(StatusCode::UNAUTHORIZED), ErrorKind::Unauthenticated);
        assert_eq!(kind(StatusCode::FORBIDDEN), ErrorKind::PermissionDenied);
        assert_eq!(kind(StatusCode::TOO_MANY_REQUESTS), ErrorKind::ResourceExhausted);
        assert_eq!(kind(StatusCode::BAD_GATEWAY), ErrorKind::Unavailable);
        assert_eq!(kind(StatusCode::GATEWAY_TIMEOUT), ErrorKind::DeadlineExceeded);
    }

    #[test]
    fn only_rejected_credentials_require_login() {
        assert!(ErrorKind::Unauthenticated.requires_login());
        assert!(!ErrorKind::PermissionDenied.requires_login());
        assert!(!ErrorKind::Unavailable.requires_login());
        assert!(!ErrorKind::DeadlineExceeded.requires_login());
    }

    #[test]
    fn display_includes_kind_and_detail() {
        let err = Error::from_status(StatusCode::SERVICE_UNAVAILABLE, "try later");
        assert_eq!(
            err.to_string(),
            "service unavailable: 503 Service Unavailable: try later"
        );
    }
}
