//! Persisted session: the credential as last issued.
//!
//! The session file is rewritten in full after every successful refresh or
//! code exchange, and read back at startup or when another process announces
//! a renewal. It is a small TOML document:
//!
//! ```toml
//! access_token = "BQD..."
//! refresh_token = "AQC..."
//! expires_in = 3600
//! issued_at = 1733072400
//! ```
//!
//! `expires_in` is counted from `issued_at`, both in seconds. A file without
//! `issued_at` has an unknown age, so its access token is treated as expired
//! and renewed with the refresh token on first use.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds, TimestampSeconds};

use crate::{
    credential::Credential,
    error::{Error, Result},
};

#[serde_as]
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
struct Record {
    access_token: String,
    refresh_token: String,

    #[serde_as(as = "DurationSeconds<u64>")]
    expires_in: Duration,

    #[serde_as(as = "Option<TimestampSeconds<i64>>")]
    #[serde(skip_serializing_if = "Option::is_none")]
    issued_at: Option<SystemTime>,
}

/// Location of the session file on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionFile {
    path: PathBuf,
}

impl SessionFile {
    /// Files larger than this are rejected before reading them.
    const MAX_FILE_SIZE: u64 = 16 * 1024;

    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the credential back.
    ///
    /// Returns `Ok(None)` if there is no session file yet.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, is too large or is malformed.
    pub fn load(&self) -> Result<Option<Credential>> {
        let file_size = match fs::metadata(&self.path) {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if file_size > Self::MAX_FILE_SIZE {
            return Err(Error::resource_exhausted(format!(
                "{} is too large",
                self.path.display()
            )));
        }

        let contents = fs::read_to_string(&self.path)?;
        let record: Record = toml::from_str(&contents)?;

        // Unknown age: consider it expired.
        let issued_at = record.issued_at.unwrap_or(SystemTime::UNIX_EPOCH);
        let credential = Credential::issued(
            record.access_token,
            record.refresh_token,
            issued_at,
            record.expires_in,
        );

        debug!(
            "loaded session from {}; valid until {}",
            self.path.display(),
            crate::util::format_time(credential.expires_at())
        );
        Ok(Some(credential))
    }

    /// Writes `credential` as seen from `now`, replacing the file as a whole.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written.
    pub fn save(&self, credential: &Credential, now: SystemTime) -> Result<()> {
        let record = Record {
            access_token: credential.access_token().to_owned(),
            refresh_token: credential.refresh_token().to_owned(),
            expires_in: credential.time_to_live(now),
            issued_at: Some(now),
        };
        let contents = toml::to_string(&record)?;

        // Write next to the target and rename over it, so that readers see
        // either the old or the new session.
        let mut temp = self.path.clone().into_os_string();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);

        {
            let mut file = Self::create(&temp)?;
            file.write_all(contents.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;

        debug!("saved session to {}", self.path.display());
        Ok(())
    }

    /// Forgets the session, returning whether there was one.
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be removed.
    pub fn remove(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("removed {}", self.path.display());
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    #[cfg(unix)]
    fn create(path: &Path) -> io::Result<fs::File> {
        use std::os::unix::fs::OpenOptionsExt;

        // Tokens are secrets: owner only.
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
    }

    #[cfg(not(unix))]
    fn create(path: &Path) -> io::Result<fs::File> {
        fs::File::create(path)
    }
}
