//! OAuth credential held for one logged-in session.
//!
//! A [`Credential`] bundles the access token, the refresh token and the
//! instant the access token stops being accepted. It is immutable: a renewal
//! produces a new `Credential` that replaces the old one as a whole, so that
//! the two tokens always stem from the same issuance.

use std::time::{Duration, SystemTime};

use veil::Redact;

/// Access and refresh token pair with its computed expiry.
#[derive(Clone, PartialEq, Eq, Hash, Redact)]
pub struct Credential {
    #[redact]
    access_token: String,

    #[redact]
    refresh_token: String,

    expires_at: SystemTime,
}

impl Credential {
    /// Creates a credential that was issued at `issued_at` and is valid for
    /// `expires_in`.
    ///
    /// An `expires_in` that would overflow the clock yields a credential that
    /// is expired from the start.
    #[must_use]
    pub fn issued(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        issued_at: SystemTime,
        expires_in: Duration,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at: issued_at.checked_add(expires_in).unwrap_or(issued_at),
        }
    }

    #[must_use]
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    #[must_use]
    pub fn refresh_token(&self) -> &str {
        &self.refresh_token
    }

    #[must_use]
    pub fn expires_at(&self) -> SystemTime {
        self.expires_at
    }

    /// Whether the access token is still accepted at `now`.
    #[must_use]
    pub fn is_valid_at(&self, now: SystemTime) -> bool {
        now < self.expires_at
    }

    /// Remaining lifetime as seen from `now`, or zero when expired.
    #[must_use]
    pub fn time_to_live(&self, now: SystemTime) -> Duration {
        self.expires_at
            .duration_since(now)
            .unwrap_or(Duration::ZERO)
    }
}
