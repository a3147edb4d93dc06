//! In-memory holder of the live [`Credential`].
//!
//! The store keeps at most one credential behind an `Arc`. Writers replace the
//! `Arc` as a whole, so readers always get a complete credential from a single
//! issuance, never an access token of one and a refresh token of another.
//!
//! The store performs no I/O. Loading from and saving to disk is handled by
//! [`session::SessionFile`](crate::session::SessionFile).

use std::{
    sync::{Arc, PoisonError, RwLock},
    time::SystemTime,
};

use crate::credential::Credential;

#[derive(Debug, Default)]
pub struct CredentialStore {
    live: RwLock<Option<Arc<Credential>>>,
}

impl CredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_credential(credential: Credential) -> Self {
        Self {
            live: RwLock::new(Some(Arc::new(credential))),
        }
    }

    /// The live credential, if any.
    #[must_use]
    pub fn get(&self) -> Option<Arc<Credential>> {
        // A writer cannot leave a half-replaced value behind, so the data
        // behind a poisoned lock is still consistent.
        self.live
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the live credential.
    pub fn set(&self, credential: Credential) -> Arc<Credential> {
        let credential = Arc::new(credential);
        *self.live.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&credential));
        credential
    }

    /// Forgets the live credential, returning it.
    pub fn clear(&self) -> Option<Arc<Credential>> {
        self.live
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Whether a credential is present and valid at `now`.
    ///
    /// Never triggers a refresh.
    #[must_use]
    pub fn is_valid(&self, now: SystemTime) -> bool {
        self.usable_at(now).is_some()
    }

    /// The live credential if it is still valid at `instant`.
    #[must_use]
    pub fn usable_at(&self, instant: SystemTime) -> Option<Arc<Credential>> {
        self.get()
            .filter(|credential| credential.is_valid_at(instant))
    }
}
