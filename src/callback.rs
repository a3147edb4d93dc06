//! Receives the authorization code at the redirect URI.
//!
//! After the user grants access, the accounts service redirects the browser to
//! the registered redirect URI, passing either a `code` or an `error`, and the
//! `state` that was put into the authorization URL. When the redirect URI
//! points at this host, [`Callback`] serves it: it checks the state, exchanges
//! the code for a credential and hands the credential to its consumer.
//!
//! The redirect URI has to use a different port than the push server, which
//! only speaks WebSocket.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Router,
};
use serde::Deserialize;
use tokio::{net::TcpListener, sync::mpsc};
use url::Url;

use crate::{
    credential::Credential,
    error::{Error, Result},
    issuer::CredentialIssuer,
};

/// Serves the redirect URI on the local host.
pub struct Callback {
    listener: TcpListener,
    path: String,
    expected_state: String,
    issuer: Arc<dyn CredentialIssuer>,
}

#[derive(Clone)]
struct Shared {
    expected_state: Arc<str>,
    issuer: Arc<dyn CredentialIssuer>,
    credentials: mpsc::Sender<Credential>,
}

/// Query parameters of the redirect.
#[derive(Debug, Deserialize)]
struct Params {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

impl Callback {
    /// Binds to the address of `redirect_uri`.
    ///
    /// Only redirects carrying `expected_state` are accepted.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the redirect URI does not use plain HTTP
    /// on a loopback address, or an I/O error if the address cannot be bound.
    pub async fn bind(
        redirect_uri: &Url,
        expected_state: impl Into<String>,
        issuer: Arc<dyn CredentialIssuer>,
    ) -> Result<Self> {
        let addr = loopback_addr(redirect_uri)?;
        let listener = TcpListener::bind(addr).await?;

        Ok(Self {
            listener,
            path: redirect_uri.path().to_owned(),
            expected_state: expected_state.into(),
            issuer,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Into::into)
    }

    /// Serves redirects until the task is dropped, sending every credential
    /// obtained to `credentials`.
    ///
    /// # Errors
    ///
    /// Returns error if the server stops accepting connections.
    pub async fn run(self, credentials: mpsc::Sender<Credential>) -> Result<()> {
        if let Ok(addr) = self.local_addr() {
            info!("serving redirect URI on http://{addr}{}", self.path);
        }

        let shared = Shared {
            expected_state: self.expected_state.into(),
            issuer: self.issuer,
            credentials,
        };
        let app = Router::new()
            .route(&self.path, get(redirected))
            .with_state(shared);

        axum::serve(self.listener, app).await?;
        Ok(())
    }
}

/// The loopback address `redirect_uri` points at.
fn loopback_addr(redirect_uri: &Url) -> Result<SocketAddr> {
    if redirect_uri.scheme() != "http" {
        return Err(Error::invalid_argument(format!(
            "redirect URI {redirect_uri} is not plain http"
        )));
    }

    redirect_uri
        .socket_addrs(|| None)?
        .into_iter()
        .find(|addr| addr.ip().is_loopback())
        .ok_or_else(|| {
            Error::invalid_argument(format!("redirect URI {redirect_uri} is not on this host"))
        })
}

async fn redirected(
    State(shared): State<Shared>,
    Query(params): Query<Params>,
) -> (StatusCode, &'static str) {
    if let Some(error) = params.error {
        warn!("access was not granted: {error}");
        return (StatusCode::FORBIDDEN, "Access was not granted.\n");
    }

    if params.state.as_deref() != Some(&*shared.expected_state) {
        warn!("ignoring redirect with unexpected state");
        return (
            StatusCode::BAD_REQUEST,
            "Unexpected state; start logging in again.\n",
        );
    }

    let Some(code) = params.code else {
        return (StatusCode::BAD_REQUEST, "Missing authorization code.\n");
    };

    match shared.issuer.exchange_code(&code).await {
        Ok(credential) => {
            if shared.credentials.send(credential).await.is_err() {
                return (StatusCode::SERVICE_UNAVAILABLE, "Not accepting logins.\n");
            }
            info!("logged in through the redirect URI");
            (StatusCode::OK, "Logged in. You can close this window.\n")
        }
        Err(e) => {
            error!("exchanging the authorization code failed: {e}");
            (StatusCode::BAD_GATEWAY, "Logging in failed; see the log.\n")
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::{Duration, SystemTime},
    };

    use async_trait::async_trait;

    use super::*;

    #[derive(Default)]
    struct TestIssuer {
        exchanges: AtomicUsize,
    }

    #[async_trait]
    impl CredentialIssuer for TestIssuer {
        async fn exchange_code(&self, code: &str) -> Result<Credential> {
            self.exchanges.fetch_add(1, Ordering::SeqCst);
            if code != "granted" {
                return Err(Error::unauthenticated("invalid_grant"));
            }
            Ok(Credential::issued(
                "access",
                "refresh",
                SystemTime::now(),
                Duration::from_secs(3600),
            ))
        }

        async fn refresh(&self, _refresh_token: &str) -> Result<Credential> {
            Err(Error::unimplemented("not used"))
        }
    }

    async fn serve(issuer: Arc<TestIssuer>) -> (Url, mpsc::Receiver<Credential>) {
        let redirect_uri = Url::parse("http://127.0.0.1:0/callback").unwrap();
        let callback = Callback::bind(&redirect_uri, "xyz", issuer).await.unwrap();
        let addr = callback.local_addr().unwrap();

        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(callback.run(tx));

        (Url::parse(&format!("http://{addr}/callback")).unwrap(), rx)
    }

    #[tokio::test]
    async fn granted_code_yields_credential() {
        let issuer = Arc::new(TestIssuer::default());
        let (url, mut rx) = serve(Arc::clone(&issuer)).await;

        let response = reqwest::get(format!("{url}?code=granted&state=xyz")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        let credential = rx.recv().await.unwrap();
        assert_eq!(credential.access_token(), "access");
        assert_eq!(issuer.exchanges.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unexpected_state_is_not_exchanged() {
        let issuer = Arc::new(TestIssuer::default());
        let (url, mut rx) = serve(Arc::clone(&issuer)).await;

        let response = reqwest::get(format!("{url}?code=granted&state=forged")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

        let response = reqwest::get(format!("{url}?error=access_denied&state=xyz")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);

        assert_eq!(issuer.exchanges.load(Ordering::SeqCst), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rejected_code_is_reported() {
        let issuer = Arc::new(TestIssuer::default());
        let (url, mut rx) = serve(Arc::clone(&issuer)).await;

        let response = reqwest::get(format!("{url}?code=stale&state=xyz")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn redirect_uri_must_be_local_http() {
        let remote = Url::parse("https://example.com/callback").unwrap();
        assert!(loopback_addr(&remote).is_err());

        let local = Url::parse("http://127.0.0.1:8888/callback").unwrap();
        assert_eq!(loopback_addr(&local).unwrap(), SocketAddr::from(([127, 0, 0, 1], 8888)));
    }
}
