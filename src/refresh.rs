//! Keeps the credential valid, with at most one renewal in flight.
//!
//! [`RefreshCoordinator::ensure_valid`] is what every component calls when it
//! needs a usable credential. When the stored credential has more than the
//! threshold left to live it is returned as-is. Otherwise a refresh is due and
//! the coordinator makes sure that, however many callers arrive at the same
//! time, only one refresh request goes out:
//!
//! * the first caller registers a refresh request and spawns it;
//! * later callers find the registered request and wait for its outcome;
//! * the request itself stores the new credential, deregisters, hands the
//!   outcome to every waiter and broadcasts [`Event::Renewed`].
//!
//! The request runs as its own task so that a caller giving up (for example,
//! because it was cancelled by a shutdown) does not abandon the other waiters.
//!
//! A credential installed from elsewhere, or a logout, supersedes the request
//! in flight: its late result is discarded.
//!
//! On failure the store is left untouched and every waiter receives the same
//! [`RefreshError`]. The coordinator never retries by itself; whether and when
//! to try again is up to the caller.

use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, SystemTime},
};

use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::{
    credential::Credential,
    error::{self, ErrorKind},
    events::Event,
    hub::NotificationHub,
    issuer::CredentialIssuer,
    store::CredentialStore,
};

/// Why a refresh failed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Reason {
    /// No refresh token, or the issuer rejected it. The user has to log in
    /// again; retrying will not help.
    Unauthenticated,

    /// Network trouble, a timeout or a server error. A later attempt may
    /// succeed.
    Transient,
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthenticated => write!(f, "unauthenticated"),
            Self::Transient => write!(f, "transient"),
        }
    }
}

impl From<ErrorKind> for Reason {
    fn from(kind: ErrorKind) -> Self {
        if kind.requires_login() {
            Self::Unauthenticated
        } else {
            Self::Transient
        }
    }
}

/// Outcome of a failed refresh, shared by every caller that waited on it.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("refresh failed ({reason}): {detail}")]
pub struct RefreshError {
    pub reason: Reason,
    detail: Arc<str>,
}

impl RefreshError {
    pub fn new(reason: Reason, detail: impl fmt::Display) -> Self {
        Self {
            reason,
            detail: detail.to_string().into(),
        }
    }

    pub fn unauthenticated(detail: impl fmt::Display) -> Self {
        Self::new(Reason::Unauthenticated, detail)
    }

    pub fn transient(detail: impl fmt::Display) -> Self {
        Self::new(Reason::Transient, detail)
    }

    #[must_use]
    pub fn requires_login(&self) -> bool {
        self.reason == Reason::Unauthenticated
    }
}

impl From<error::Error> for RefreshError {
    fn from(e: error::Error) -> Self {
        Self::new(e.kind.into(), e)
    }
}

impl From<RefreshError> for error::Error {
    fn from(e: RefreshError) -> Self {
        match e.reason {
            Reason::Unauthenticated => Self::unauthenticated(e),
            Reason::Transient => Self::unavailable(e),
        }
    }
}

pub type Outcome = Result<Arc<Credential>, RefreshError>;

/// The refresh request currently in flight.
struct InFlight {
    id: Uuid,
    outcome: watch::Receiver<Option<Outcome>>,
}

#[derive(Clone)]
pub struct RefreshCoordinator {
    store: Arc<CredentialStore>,
    issuer: Arc<dyn CredentialIssuer>,
    hub: Arc<NotificationHub>,
    in_flight: Arc<Mutex<Option<InFlight>>>,
    timeout: Duration,
}

impl RefreshCoordinator {
    /// Creates a coordinator whose refresh requests give up after `timeout`.
    pub fn new(
        store: Arc<CredentialStore>,
        issuer: Arc<dyn CredentialIssuer>,
        hub: Arc<NotificationHub>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            issuer,
            hub,
            in_flight: Arc::new(Mutex::new(None)),
            timeout,
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    #[must_use]
    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    /// Returns a credential that is valid for at least `threshold` after
    /// `now`, refreshing it first if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Reason::Unauthenticated`] when there is no refresh token or
    /// the issuer rejected it, and [`Reason::Transient`] when the refresh could
    /// not complete. Callers that were waiting on the same refresh receive the
    /// same error.
    pub async fn ensure_valid(&self, now: SystemTime, threshold: Duration) -> Outcome {
        let deadline = now.checked_add(threshold).unwrap_or(now);
        if let Some(credential) = self.store.usable_at(deadline) {
            return Ok(credential);
        }

        let (id, mut outcome) = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match in_flight.as_ref() {
                Some(request) => {
                    debug!("waiting on refresh request {}", request.id);
                    (request.id, request.outcome.clone())
                }
                None => {
                    // A request may have completed between the check above and
                    // taking the lock. It stores its credential before it
                    // deregisters, so checking again here is conclusive.
                    if let Some(credential) = self.store.usable_at(deadline) {
                        return Ok(credential);
                    }

                    let refresh_token = match self.store.get() {
                        Some(credential) if !credential.refresh_token().is_empty() => {
                            credential.refresh_token().to_owned()
                        }
                        _ => {
                            return Err(RefreshError::unauthenticated(
                                "no refresh token; log in first",
                            ))
                        }
                    };

                    let id = Uuid::new_v4();
                    let (tx, rx) = watch::channel(None);
                    *in_flight = Some(InFlight {
                        id,
                        outcome: rx.clone(),
                    });

                    debug!("starting refresh request {id}");
                    tokio::spawn(self.clone().refresh(id, refresh_token, tx));
                    (id, rx)
                }
            }
        };

        let settled = outcome
            .wait_for(Option::is_some)
            .await
            .map(|outcome| outcome.clone());
        match settled {
            Ok(Some(outcome)) => outcome,
            Ok(None) | Err(_) => {
                // The request task is gone without settling; let the next
                // caller start over.
                self.deregister(id);
                Err(RefreshError::transient("refresh request was abandoned"))
            }
        }
    }

    fn deregister(&self, id: Uuid) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if in_flight.as_ref().is_some_and(|request| request.id == id) {
            *in_flight = None;
        }
    }

    /// Performs refresh request `id` and settles it.
    async fn refresh(
        self,
        id: Uuid,
        refresh_token: String,
        tx: watch::Sender<Option<Outcome>>,
    ) {
        let refreshed = match tokio::time::timeout(self.timeout, self.issuer.refresh(&refresh_token)).await {
            Ok(Ok(credential)) => Ok(credential),
            Ok(Err(e)) => Err(RefreshError::from(e)),
            Err(e) => Err(RefreshError::transient(e)),
        };

        let Some(outcome) = self.settle(id, refreshed) else {
            // Waiters get whatever replaced the request.
            debug!("refresh request {id} was superseded");
            let current = self
                .store
                .get()
                .ok_or_else(|| RefreshError::unauthenticated("logged out"));
            tx.send_replace(Some(current));
            return;
        };

        let renewed = match &outcome {
            Ok(credential) => {
                info!(
                    "credential renewed; valid until {}",
                    crate::util::format_time(credential.expires_at())
                );
                true
            }
            Err(e) if e.requires_login() => {
                error!("{e}; log in again to continue");
                false
            }
            Err(e) => {
                warn!("{e}");
                false
            }
        };

        tx.send_replace(Some(outcome));

        // Outside of the in-flight lock: the hub has its own.
        if renewed {
            self.hub.broadcast(Event::Renewed);
        }
    }

    /// Stores the result of request `id` and deregisters it.
    ///
    /// Returns `None` without storing anything when the request is no longer
    /// registered, because [`install`](Self::install) or
    /// [`logout`](Self::logout) replaced the credential in the meantime.
    fn settle(&self, id: Uuid, refreshed: Result<Credential, RefreshError>) -> Option<Outcome> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !in_flight.as_ref().is_some_and(|request| request.id == id) {
            return None;
        }

        *in_flight = None;
        Some(refreshed.map(|credential| self.store.set(credential)))
    }

    /// Drops the registration of the request in flight, if any, so that its
    /// result is not stored.
    fn supersede(in_flight: &mut Option<InFlight>) {
        if let Some(request) = in_flight.take() {
            debug!("superseding refresh request {}", request.id);
        }
    }

    /// Installs a credential obtained outside of a refresh, such as from a
    /// code exchange or a reloaded session file, and announces it.
    ///
    /// A refresh still in flight is superseded: its waiters receive this
    /// credential and its own result is discarded.
    pub fn install(&self, credential: Credential) -> Arc<Credential> {
        let credential = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            Self::supersede(&mut in_flight);
            self.store.set(credential)
        };

        self.hub.broadcast(Event::Renewed);
        credential
    }

    /// Forgets the credential, returning it.
    ///
    /// A refresh still in flight is superseded and its waiters fail as
    /// unauthenticated.
    pub fn logout(&self) -> Option<Arc<Credential>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        Self::supersede(&mut in_flight);
        self.store.clear()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::error::{Error, Result};

    const HOUR: Duration = Duration::from_secs(3600);
    const THRESHOLD: Duration = Duration::from_secs(300);

    fn at(secs: f64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000) + Duration::from_secs_f64(secs)
    }

    /// Issuer that counts refreshes and holds each one until released.
    struct TestIssuer {
        calls: AtomicUsize,
        gate: Semaphore,
        response: fn(usize) -> Result<Credential>,
    }

    impl TestIssuer {
        fn new(response: fn(usize) -> Result<Credential>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Semaphore::new(0),
                response,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn release(&self) {
            self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    #[async_trait]
    impl CredentialIssuer for TestIssuer {
        async fn exchange_code(&self, _code: &str) -> Result<Credential> {
            Err(Error::unimplemented("not used"))
        }

        async fn refresh(&self, refresh_token: &str) -> Result<Credential> {
            assert_eq!(refresh_token, "refresh-0");
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let _permit = self.gate.acquire().await.map_err(Error::internal)?;
            (self.response)(call)
        }
    }

    fn renewed(call: usize) -> Result<Credential> {
        Ok(Credential::issued(
            format!("access-{call}"),
            "refresh-0",
            at(3000.0),
            HOUR,
        ))
    }

    fn coordinator(issuer: Arc<TestIssuer>) -> RefreshCoordinator {
        let store = Arc::new(CredentialStore::with_credential(Credential::issued(
            "access-0",
            "refresh-0",
            at(0.0),
            HOUR,
        )));
        RefreshCoordinator::new(store, issuer, Arc::new(NotificationHub::new()), Duration::from_secs(10))
    }

    #[tokio::test]
    async fn valid_credential_is_returned_without_refresh() {
        let issuer = TestIssuer::new(renewed);
        let coordinator = coordinator(Arc::clone(&issuer));

        let credential = coordinator.ensure_valid(at(1000.0), THRESHOLD).await.unwrap();
        assert_eq!(credential.access_token(), "access-0");
        assert_eq!(issuer.calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_refresh() {
        let issuer = TestIssuer::new(renewed);
        let coordinator = coordinator(Arc::clone(&issuer));
        let mut subscription = coordinator.hub().subscribe();

        let callers: Vec<_> = (0..16)
            .map(|_| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.ensure_valid(at(3000.0), THRESHOLD).await })
            })
            .collect();

        // Let every caller attach before the refresh completes.
        while issuer.calls() == 0 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        issuer.release();

        let mut credentials = Vec::new();
        for caller in callers {
            credentials.push(caller.await.unwrap().unwrap());
        }

        assert_eq!(issuer.calls(), 1);
        assert!(credentials.iter().all(|c| Arc::ptr_eq(c, &credentials[0])));
        assert_eq!(credentials[0].access_token(), "access-1");
        assert_eq!(subscription.recv().await, Some(Event::Renewed));
    }

    #[tokio::test]
    async fn refresh_within_threshold_then_reuse() {
        let issuer = TestIssuer::new(renewed);
        issuer.release();
        let coordinator = coordinator(Arc::clone(&issuer));

        // Issued at T0 for an hour, threshold five minutes: T0+3000 is due.
        let first = coordinator.ensure_valid(at(3000.0), THRESHOLD).await.unwrap();
        let second = coordinator.ensure_valid(at(3000.1), THRESHOLD).await.unwrap();

        assert_eq!(issuer.calls(), 1);
        assert_eq!(first, second);
        assert_eq!(coordinator.store().get().unwrap().access_token(), "access-1");
    }

    #[tokio::test]
    async fn rejected_refresh_leaves_store_unchanged() {
        let issuer = TestIssuer::new(|_| {
            Err(Error::from_status(http::StatusCode::UNAUTHORIZED, "invalid_grant"))
        });
        issuer.release();
        let coordinator = coordinator(Arc::clone(&issuer));
        let mut subscription = coordinator.hub().subscribe();

        let err = coordinator.ensure_valid(at(3000.0), THRESHOLD).await.unwrap_err();
        assert_eq!(err.reason, Reason::Unauthenticated);
        assert_eq!(coordinator.store().get().unwrap().access_token(), "access-0");

        // Nothing was renewed, so nothing was announced.
        let announced = tokio::time::timeout(Duration::from_millis(20), subscription.recv()).await;
        assert!(announced.is_err());
    }

    #[tokio::test]
    async fn waiters_share_a_transient_failure() {
        let issuer = TestIssuer::new(|_| Err(Error::unavailable("502 Bad Gateway")));
        let coordinator = coordinator(Arc::clone(&issuer));

        let first = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.ensure_valid(at(3500.0), THRESHOLD).await }
        });
        while issuer.calls() == 0 {
            tokio::task::yield_now().await;
        }
        let second = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.ensure_valid(at(3500.0), THRESHOLD).await }
        });
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        issuer.release();

        let first = first.await.unwrap().unwrap_err();
        let second = second.await.unwrap().unwrap_err();
        assert_eq!(first.reason, Reason::Transient);
        assert_eq!(first, second);
        assert_eq!(issuer.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_issuer_times_out_as_transient() {
        // Never released: the refresh only ends through the timeout.
        let issuer = TestIssuer::new(renewed);
        let coordinator = coordinator(Arc::clone(&issuer));

        let err = coordinator.ensure_valid(at(3500.0), THRESHOLD).await.unwrap_err();
        assert_eq!(err.reason, Reason::Transient);
        assert_eq!(coordinator.store().get().unwrap().access_token(), "access-0");
    }

    #[tokio::test]
    async fn install_supersedes_refresh_in_flight() {
        let issuer = TestIssuer::new(renewed);
        let coordinator = coordinator(Arc::clone(&issuer));

        let waiter = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.ensure_valid(at(3500.0), THRESHOLD).await }
        });
        while issuer.calls() == 0 {
            tokio::task::yield_now().await;
        }

        let installed = coordinator.install(Credential::issued("logged-in", "refresh-0", at(3500.0), HOUR));
        issuer.release();

        let credential = waiter.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&credential, &installed));
        assert_eq!(coordinator.store().get().unwrap().access_token(), "logged-in");

        // The late result of the superseded request was discarded.
        let again = coordinator.ensure_valid(at(3500.0), THRESHOLD).await.unwrap();
        assert_eq!(again.access_token(), "logged-in");
        assert_eq!(issuer.calls(), 1);
    }

    #[tokio::test]
    async fn logout_clears_and_fails_waiters() {
        let issuer = TestIssuer::new(renewed);
        let coordinator = coordinator(Arc::clone(&issuer));

        let waiter = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.ensure_valid(at(3500.0), THRESHOLD).await }
        });
        while issuer.calls() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(coordinator.logout().is_some());
        issuer.release();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.requires_login());
        assert!(coordinator.store().get().is_none());

        let err = coordinator.ensure_valid(at(3500.0), THRESHOLD).await.unwrap_err();
        assert!(err.requires_login());
        assert_eq!(issuer.calls(), 1);
    }

    #[tokio::test]
    async fn missing_refresh_token_fails_without_network() {
        let issuer = TestIssuer::new(renewed);
        let coordinator = RefreshCoordinator::new(
            Arc::new(CredentialStore::new()),
            Arc::clone(&issuer) as Arc<dyn CredentialIssuer>,
            Arc::new(NotificationHub::new()),
            Duration::from_secs(10),
        );

        let err = coordinator.ensure_valid(at(0.0), THRESHOLD).await.unwrap_err();
        assert!(err.requires_login());
        assert_eq!(issuer.calls(), 0);
    }
}
