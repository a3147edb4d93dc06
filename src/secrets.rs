//! Client credentials of the registered application.
//!
//! The secrets file is a small TOML document:
//!
//! ```toml
//! client_id = "0123456789abcdef0123456789abcdef"
//! client_secret = "fedcba9876543210fedcba9876543210"
//! redirect_uri = "http://127.0.0.1:8888/callback"
//! ```
//!
//! Keep it out of version control: the client secret lets anyone act as this
//! application.

use std::{fs, io, path::Path, str::FromStr};

use serde::Deserialize;
use url::Url;
use veil::Redact;

/// OAuth client registration used against the accounts service.
#[derive(Clone, PartialEq, Eq, Deserialize, Redact)]
pub struct ClientCredentials {
    pub client_id: String,

    #[redact]
    pub client_secret: String,

    pub redirect_uri: Url,
}

impl ClientCredentials {
    /// Files larger than this are rejected before reading them.
    const MAX_FILE_SIZE: u64 = 1024;

    /// Loads the credentials from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an `io::Error` when the file is missing, unreadable, too large
    /// or does not hold valid credentials.
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();

        // Prevent out-of-memory condition: the secrets file should be small.
        let file_size = fs::metadata(path)?.len();
        if file_size > Self::MAX_FILE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} is too large", path.display()),
            ));
        }

        let contents = fs::read_to_string(path)?;
        contents.parse().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} format is invalid: {e}", path.display()),
            )
        })
    }
}

impl FromStr for ClientCredentials {
    type Err = io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let credentials: Self = toml::from_str(s)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        let illegal = |value: &str| value.is_empty() || value.contains(char::is_whitespace);
        if illegal(&credentials.client_id) || illegal(&credentials.client_secret) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "client id and secret must be non-empty and without whitespace",
            ));
        }

        Ok(credentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_redacts() {
        let credentials: ClientCredentials = r#"
            client_id = "id"
            client_secret = "very-secret"
            redirect_uri = "http://127.0.0.1:8888/callback"
        "#
        .parse()
        .unwrap();

        assert_eq!(credentials.client_id, "id");
        assert_eq!(credentials.redirect_uri.path(), "/callback");
        assert!(!format!("{credentials:?}").contains("very-secret"));
    }

    #[test]
    fn rejects_missing_and_blank_fields() {
        assert!(r#"client_id = "id""#.parse::<ClientCredentials>().is_err());

        let blank = r#"
            client_id = ""
            client_secret = "secret"
            redirect_uri = "http://127.0.0.1:8888/callback"
        "#;
        assert!(blank.parse::<ClientCredentials>().is_err());
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = ClientCredentials::from_file("/nonexistent/secrets.toml").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
