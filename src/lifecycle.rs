//! Chores that keep the session alive between schedule windows.
//!
//! * [`keep_alive`] renews the credential ahead of expiry and tells when to
//!   come back.
//! * [`persist`] writes the session file after every renewal.
//! * [`reload`] picks up a session file changed by another process, or its
//!   removal on logout.

use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use crate::{
    credential::Credential,
    error::Result,
    hub::Subscription,
    refresh::RefreshCoordinator,
    session::SessionFile,
    store::CredentialStore,
    util::with_jitter,
};

/// Delay before a transient failure is retried.
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Lower bound between two renewals, for issuers that hand out credentials
/// shorter-lived than the refresh threshold.
pub const MIN_RENEWAL_INTERVAL: Duration = Duration::from_secs(30);

/// What the keep-alive should do next.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum KeepAlive {
    /// The credential is fine; look again after this long.
    RenewIn(Duration),
    /// Renewing failed for now; try again after this long.
    RetryIn(Duration),
    /// Renewing needs a new login. Nothing to do until a credential is
    /// installed.
    Parked,
}

/// When `credential` should be renewed, as seen from `now`.
#[must_use]
pub fn renewal_delay(credential: &Credential, now: SystemTime, threshold: Duration) -> Duration {
    credential
        .time_to_live(now)
        .saturating_sub(threshold)
        .max(MIN_RENEWAL_INTERVAL)
}

/// Makes sure the credential stays valid for `threshold` after `now`.
pub async fn keep_alive(
    coordinator: &RefreshCoordinator,
    now: SystemTime,
    threshold: Duration,
) -> KeepAlive {
    match coordinator.ensure_valid(now, threshold).await {
        Ok(credential) => {
            let delay = renewal_delay(&credential, now, threshold);
            debug!("next renewal in {}s", delay.as_secs());
            KeepAlive::RenewIn(delay)
        }
        Err(e) if e.requires_login() => {
            error!("{e}; log in to continue");
            KeepAlive::Parked
        }
        Err(e) => {
            let delay = with_jitter(RETRY_DELAY, Duration::from_secs(1));
            warn!("keep-alive failed: {e}; retrying in {:.1}s", delay.as_secs_f32());
            KeepAlive::RetryIn(delay)
        }
    }
}

/// Writes the live credential to `session` on every event of `renewals`.
///
/// Returns once the hub drops the subscription.
pub async fn persist(mut renewals: Subscription, store: Arc<CredentialStore>, session: SessionFile) {
    while let Some(event) = renewals.recv().await {
        trace!("persisting after {event}");
        if let Some(credential) = store.get() {
            if let Err(e) = session.save(&credential, SystemTime::now()) {
                error!("cannot write {}: {e}", session.path().display());
            }
        }
    }
}

/// Reads `session` back into the coordinator.
///
/// A missing file means the user logged out: the live credential is
/// forgotten and `None` returned.
///
/// # Errors
///
/// Returns error if the file cannot be read; the live credential is kept.
pub fn reload(coordinator: &RefreshCoordinator, session: &SessionFile) -> Result<Option<Arc<Credential>>> {
    match session.load()? {
        Some(credential) => Ok(Some(coordinator.install(credential))),
        None => {
            if coordinator.logout().is_some() {
                info!("{} is gone; logged out", session.path().display());
            }
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use uuid::Uuid;

    use super::*;
    use crate::{
        error::{Error, ErrorKind},
        events::Event,
        hub::NotificationHub,
        issuer::CredentialIssuer,
    };

    const HOUR: Duration = Duration::from_secs(3600);
    const THRESHOLD: Duration = Duration::from_secs(300);

    fn at(offset: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + offset)
    }

    /// Issuer that renews for another hour, fails for now, or rejects.
    #[derive(Default)]
    struct TestIssuer {
        calls: AtomicUsize,
        unavailable: AtomicBool,
        reject: AtomicBool,
    }

    #[async_trait]
    impl CredentialIssuer for TestIssuer {
        async fn exchange_code(&self, _code: &str) -> Result<Credential> {
            Err(Error::unimplemented("not used"))
        }

        async fn refresh(&self, refresh_token: &str) -> Result<Credential> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.reject.load(Ordering::SeqCst) {
                return Err(Error::unauthenticated("invalid_grant"));
            }
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(Error::unavailable("503 Service Unavailable"));
            }
            Ok(Credential::issued("renewed", refresh_token, at(3000), HOUR))
        }
    }

    fn coordinator(issuer: &Arc<TestIssuer>) -> RefreshCoordinator {
        let store = Arc::new(CredentialStore::with_credential(Credential::issued(
            "access", "refresh", at(0), HOUR,
        )));
        RefreshCoordinator::new(
            store,
            Arc::clone(issuer) as Arc<dyn CredentialIssuer>,
            Arc::new(NotificationHub::new()),
            Duration::from_secs(10),
        )
    }

    fn temp_session() -> SessionFile {
        SessionFile::new(std::env::temp_dir().join(format!("booster-{}.toml", Uuid::new_v4())))
    }

    #[test]
    fn renewal_is_due_ahead_of_expiry() {
        let credential = Credential::issued("access", "refresh", at(0), HOUR);

        assert_eq!(renewal_delay(&credential, at(0), THRESHOLD), HOUR - THRESHOLD);
        assert_eq!(renewal_delay(&credential, at(3000), THRESHOLD), MIN_RENEWAL_INTERVAL);
        assert_eq!(renewal_delay(&credential, at(7200), THRESHOLD), MIN_RENEWAL_INTERVAL);
    }

    #[tokio::test]
    async fn valid_credential_is_left_alone() {
        let issuer = Arc::new(TestIssuer::default());
        let coordinator = coordinator(&issuer);

        let next = keep_alive(&coordinator, at(600), THRESHOLD).await;
        assert_eq!(next, KeepAlive::RenewIn(HOUR - THRESHOLD - Duration::from_secs(600)));
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn due_credential_is_renewed() {
        let issuer = Arc::new(TestIssuer::default());
        let coordinator = coordinator(&issuer);

        // Renewed at T0+3000 for an hour: next due at T0+6300.
        let next = keep_alive(&coordinator, at(3400), THRESHOLD).await;
        assert_eq!(next, KeepAlive::RenewIn(Duration::from_secs(6300 - 3400)));
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_soon() {
        let issuer = Arc::new(TestIssuer::default());
        issuer.unavailable.store(true, Ordering::SeqCst);
        let coordinator = coordinator(&issuer);

        let KeepAlive::RetryIn(delay) = keep_alive(&coordinator, at(3400), THRESHOLD).await else {
            panic!("expected a retry");
        };
        assert!(delay >= RETRY_DELAY && delay <= RETRY_DELAY + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn rejected_refresh_parks() {
        let issuer = Arc::new(TestIssuer::default());
        issuer.reject.store(true, Ordering::SeqCst);
        let coordinator = coordinator(&issuer);

        assert_eq!(keep_alive(&coordinator, at(3400), THRESHOLD).await, KeepAlive::Parked);

        // Without any credential there is nothing to renew with either.
        coordinator.logout();
        assert_eq!(keep_alive(&coordinator, at(3400), THRESHOLD).await, KeepAlive::Parked);
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn renewals_are_persisted() {
        let issuer = Arc::new(TestIssuer::default());
        let coordinator = coordinator(&issuer);
        let session = temp_session();

        let persisting = tokio::spawn(persist(
            coordinator.hub().subscribe(),
            Arc::clone(coordinator.store()),
            session.clone(),
        ));

        coordinator.ensure_valid(at(3400), THRESHOLD).await.unwrap();

        let saved = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(Some(saved)) = session.load() {
                    break saved;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        persisting.abort();
        session.remove().unwrap();

        assert_eq!(saved.access_token(), "renewed");
        assert_eq!(saved.refresh_token(), "refresh");
    }

    #[tokio::test]
    async fn reload_installs_and_announces() {
        let issuer = Arc::new(TestIssuer::default());
        let coordinator = coordinator(&issuer);
        let mut subscription = coordinator.hub().subscribe();
        let session = temp_session();

        let fresh = Credential::issued("logged-in", "refresh-2", at(100), HOUR);
        session.save(&fresh, at(100)).unwrap();

        let installed = reload(&coordinator, &session).unwrap().unwrap();
        session.remove().unwrap();

        assert_eq!(*installed, fresh);
        assert_eq!(coordinator.store().get().unwrap().access_token(), "logged-in");
        assert_eq!(subscription.recv().await, Some(Event::Renewed));
    }

    #[tokio::test]
    async fn reload_without_session_logs_out() {
        let issuer = Arc::new(TestIssuer::default());
        let coordinator = coordinator(&issuer);
        let session = temp_session();

        assert!(reload(&coordinator, &session).unwrap().is_none());
        assert!(coordinator.store().get().is_none());

        let err = coordinator.ensure_valid(at(0), THRESHOLD).await.unwrap_err();
        assert!(err.requires_login());
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unreadable_session_keeps_credential() {
        let issuer = Arc::new(TestIssuer::default());
        let coordinator = coordinator(&issuer);
        let session = temp_session();
        fs::write(session.path(), "access_token = 1\n").unwrap();

        let err = reload(&coordinator, &session).unwrap_err();
        session.remove().unwrap();

        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        assert_eq!(coordinator.store().get().unwrap().access_token(), "access");
    }
}
