//! Issuance of credentials by the accounts service.
//!
//! [`CredentialIssuer`] is the seam between the credential lifecycle and the
//! network: the refresh coordinator only knows this trait, tests substitute
//! their own implementation.
//!
//! [`Accounts`] implements it with the OAuth 2.0 authorization code grant and
//! refresh token grant of the Spotify accounts service.
//!
//! # Failure classification
//!
//! * 4xx responses (except 408 and 429) reject the code or refresh token for
//!   good: `Unauthenticated`, the user has to log in again.
//! * 408, 429, 5xx, timeouts and connection failures are transient.

use std::time::SystemTime;

use async_trait::async_trait;
use http::StatusCode;
use url::Url;

use crate::{
    config::Config,
    credential::Credential,
    error::{Error, Result},
    http::Client as HttpClient,
    protocol::{
        self,
        auth::{ErrorResponse, Grant, TokenResponse},
    },
};

#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    /// Exchanges an authorization code for a new credential.
    async fn exchange_code(&self, code: &str) -> Result<Credential>;

    /// Renews the credential with a refresh token.
    async fn refresh(&self, refresh_token: &str) -> Result<Credential>;
}

pub struct Accounts {
    http_client: HttpClient,
    client_id: String,
    client_secret: String,
    redirect_uri: Url,
    scopes: Vec<String>,
    authorize_url: Url,
    token_url: Url,
}

impl Accounts {
    /// Creates a new issuer from the configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built or the configured
    /// accounts URL cannot be joined with the endpoint paths.
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            http_client: HttpClient::new(config)?,
            client_id: config.credentials.client_id.clone(),
            client_secret: config.credentials.client_secret.clone(),
            redirect_uri: config.credentials.redirect_uri.clone(),
            scopes: config.scopes.clone(),
            authorize_url: config.accounts_url.join("authorize")?,
            token_url: config.accounts_url.join("api/token")?,
        })
    }

    /// URL to send the user to for granting access.
    ///
    /// `state` is echoed back on the redirect and should be checked by
    /// whoever receives it.
    #[must_use]
    pub fn authorize_url(&self, state: &str) -> Url {
        let mut url = self.authorize_url.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", self.redirect_uri.as_str())
            .append_pair("scope", &self.scopes.join(" "))
            .append_pair("state", state);
        url
    }

    async fn request_token(&self, grant: Grant, pairs: &[(&str, &str)]) -> Result<TokenResponse> {
        let grant_type = grant.to_string();
        let mut form = vec![
            ("grant_type", grant_type.as_str()),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        form.extend_from_slice(pairs);

        let request = self.http_client.post(self.token_url.clone()).form(form);
        let response = self.http_client.execute(request).await?;
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            return protocol::json(&body, "token");
        }

        let detail = serde_json::from_str::<ErrorResponse>(&body)
            .map_or_else(|_| body.trim().to_owned(), |e| e.to_string());
        Err(classify(status, detail))
    }
}

/// Maps a token endpoint failure onto an error kind.
fn classify(status: StatusCode, detail: String) -> Error {
    if status.is_client_error()
        && status != StatusCode::REQUEST_TIMEOUT
        && status != StatusCode::TOO_MANY_REQUESTS
    {
        return Error::unauthenticated(format!("{status}: {detail}"));
    }

    Error::from_status(status, detail)
}

#[async_trait]
impl CredentialIssuer for Accounts {
    async fn exchange_code(&self, code: &str) -> Result<Credential> {
        let issued_at = SystemTime::now();
        let response = self
            .request_token(
                Grant::AuthorizationCode,
                &[("code", code), ("redirect_uri", self.redirect_uri.as_str())],
            )
            .await?;

        if let Some(scope) = &response.scope {
            debug!("granted scopes: {scope}");
        }

        let refresh_token = response.refresh_token.ok_or_else(|| {
            Error::data_loss("authorization code exchange did not return a refresh token")
        })?;

        Ok(Credential::issued(
            response.access_token,
            refresh_token,
            issued_at,
            response.expires_in,
        ))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Credential> {
        let issued_at = SystemTime::now();
        let response = self
            .request_token(Grant::RefreshToken, &[("refresh_token", refresh_token)])
            .await?;

        // The refresh token may be rotated; otherwise the old one stays valid.
        let refresh_token = response
            .refresh_token
            .unwrap_or_else(|| refresh_token.to_owned());

        Ok(Credential::issued(
            response.access_token,
            refresh_token,
            issued_at,
            response.expires_in,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::ErrorKind, secrets::ClientCredentials};

    fn config() -> Config {
        Config::with_credentials(ClientCredentials {
            client_id: "client".to_owned(),
            client_secret: "secret".to_owned(),
            redirect_uri: Url::parse("http://127.0.0.1:8888/callback").unwrap(),
        })
    }

    #[test]
    fn rejected_grants_require_login() {
        let err = classify(StatusCode::BAD_REQUEST, "invalid_grant".to_owned());
        assert_eq!(err.kind, ErrorKind::Unauthenticated);

        let err = classify(StatusCode::UNAUTHORIZED, "invalid_client".to_owned());
        assert_eq!(err.kind, ErrorKind::Unauthenticated);
    }

    #[test]
    fn server_trouble_is_transient() {
        for status in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::REQUEST_TIMEOUT,
        ] {
            assert!(!classify(status, String::new()).kind.requires_login());
        }
    }

    #[test]
    fn authorize_url_carries_client_and_scopes() {
        let accounts = Accounts::new(&config()).unwrap();
        let url = accounts.authorize_url("xyz");

        assert_eq!(url.path(), "/authorize");
        let pairs: Vec<_> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("client_id".to_owned(), "client".to_owned())));
        assert!(pairs.contains(&("response_type".to_owned(), "code".to_owned())));
        assert!(pairs.contains(&("state".to_owned(), "xyz".to_owned())));
        assert!(pairs
            .iter()
            .any(|(key, value)| key == "scope" && value.contains("user-modify-playback-state")));
    }
}
