//! OAuth token endpoint types.
//!
//! Both the authorization code grant and the refresh token grant answer with
//! the same token response.
//!
//! # Example Response
//!
//! ```json
//! {
//!     "access_token": "BQD...",
//!     "token_type": "Bearer",
//!     "scope": "user-read-playback-state user-modify-playback-state",
//!     "expires_in": 3600,
//!     "refresh_token": "AQB..."
//! }
//! ```
//!
//! A refresh may leave out `refresh_token`, in which case the refresh token
//! that was sent stays valid.
//!
//! Failures answer with an error object:
//!
//! ```json
//! {
//!     "error": "invalid_grant",
//!     "error_description": "Refresh token revoked"
//! }
//! ```

use std::{fmt, time::Duration};

use serde::Deserialize;
use serde_with::{formats::Flexible, serde_as, DurationSeconds};
use veil::Redact;

/// Grant types understood by the token endpoint.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Grant {
    AuthorizationCode,
    RefreshToken,
}

impl fmt::Display for Grant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthorizationCode => write!(f, "authorization_code"),
            Self::RefreshToken => write!(f, "refresh_token"),
        }
    }
}

/// Successful token endpoint response.
#[serde_as]
#[derive(Clone, Eq, PartialEq, Deserialize, Redact)]
pub struct TokenResponse {
    #[redact]
    pub access_token: String,

    #[serde(default)]
    pub token_type: Option<String>,

    #[serde(default)]
    pub scope: Option<String>,

    /// How long the access token is valid from the moment it was issued.
    #[serde_as(as = "DurationSeconds<u64, Flexible>")]
    pub expires_in: Duration,

    #[serde(default)]
    #[redact]
    pub refresh_token: Option<String>,
}

/// Error object of the token endpoint.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
pub struct ErrorResponse {
    pub error: String,

    #[serde(default)]
    pub error_description: Option<String>,
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_description {
            Some(description) => write!(f, "{} ({description})", self.error),
            None => write!(f, "{}", self.error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_response_without_refresh_token() {
        let body = r#"{"access_token":"abc","token_type":"Bearer","expires_in":3600,"scope":"streaming"}"#;
        let response: TokenResponse = serde_json::from_str(body).unwrap();

        assert_eq!(response.expires_in, Duration::from_secs(3600));
        assert!(response.refresh_token.is_none());
        assert!(!format!("{response:?}").contains("abc"));
    }

    #[test]
    fn error_response_displays_description() {
        let body = r#"{"error":"invalid_grant","error_description":"Refresh token revoked"}"#;
        let response: ErrorResponse = serde_json::from_str(body).unwrap();

        assert_eq!(response.to_string(), "invalid_grant (Refresh token revoked)");
    }
}
