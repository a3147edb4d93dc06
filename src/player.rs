//! Playback control through the Web API.
//!
//! The scheduler drives playback through the [`PlaybackBackend`] trait so that
//! it can be exercised without a network. [`WebApi`] is the implementation
//! that talks to the Spotify Web API player endpoints.
//!
//! # Soft success
//!
//! Starting or pausing playback may be refused with `403 Forbidden` (e.g.
//! pausing something that is already paused, or a restricted device) or
//! `404 Not Found` (no active device). Neither means the credential is bad,
//! and retrying right away will not change the answer, so both are reported as
//! [`Outcome::Soft`] instead of an error. A `401 Unauthorized` is always an
//! error.

use std::fmt;

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
        player::{Device, Devices, Play, PlaybackInfo},
    },
};

/// How a playback command was received.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The command took effect.
    Applied,

    /// The command was refused in a way that does not warrant a retry.
    Soft(String),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Applied => write!(f, "applied"),
            Self::Soft(reason) => write!(f, "refused ({reason})"),
        }
    }
}

#[async_trait]
pub trait PlaybackBackend: Send + Sync {
    /// Starts playback of `track` on `device`, or resumes the current context
    /// on the active device when neither is given.
    async fn start(
        &self,
        credential: &Credential,
        device: Option<&str>,
        track: Option<&str>,
    ) -> Result<Outcome>;

    /// Pauses playback.
    async fn pause(&self, credential: &Credential) -> Result<Outcome>;

    /// Lists the devices available to the account.
    async fn devices(&self, credential: &Credential) -> Result<Vec<Device>>;

    /// What is playing right now, if anything.
    async fn currently_playing(&self, credential: &Credential) -> Result<Option<PlaybackInfo>>;
}

pub struct WebApi {
    http_client: HttpClient,
    api_url: Url,
}

impl WebApi {
    /// Creates a new Web API client from the configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            http_client: HttpClient::new(config)?,
            api_url: config.api_url.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.api_url.join(path).map_err(Into::into)
    }

    /// Sends a playback command and classifies the answer.
    async fn command(&self, request: crate::http::Request) -> Result<Outcome> {
        let url = request.url().clone();
        let response = self.http_client.execute(request).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(Outcome::Applied);
        }

        let body = response.text().await.unwrap_or_default();
        soft_or_error(status, body.trim()).inspect_err(|e| debug!("{} {url}: {e}", status.as_u16()))
    }
}

/// Maps a refused command onto [`Outcome::Soft`] where appropriate.
fn soft_or_error(status: StatusCode, detail: &str) -> Result<Outcome> {
    match status {
        StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
            Ok(Outcome::Soft(format!("{status}: {detail}")))
        }
        _ => Err(Error::from_status(status, detail)),
    }
}

#[async_trait]
impl PlaybackBackend for WebApi {
    async fn start(
        &self,
        credential: &Credential,
        device: Option<&str>,
        track: Option<&str>,
    ) -> Result<Outcome> {
        let mut url = self.endpoint("me/player/play")?;
        if let Some(device) = device {
            url.query_pairs_mut().append_pair("device_id", device);
        }

        let request = self.http_client.put(url).bearer(credential.access_token())?;
        let request = match track {
            Some(track) => request.json(&Play {
                uris: Some(vec![track.to_owned()]),
            })?,
            None => request.empty(),
        };

        self.command(request).await
    }

    async fn pause(&self, credential: &Credential) -> Result<Outcome> {
        let url = self.endpoint("me/player/pause")?;
        let request = self
            .http_client
            .put(url)
            .bearer(credential.access_token())?
            .empty();

        self.command(request).await
    }

    async fn devices(&self, credential: &Credential) -> Result<Vec<Device>> {
        let url = self.endpoint("me/player/devices")?;
        let request = self.http_client.get(url).bearer(credential.access_token())?;

        let response = self.http_client.execute(request).await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(Error::from_status(status, body.trim()));
        }

        let devices: Devices = protocol::json(&body, "devices")?;
        Ok(devices.devices)
    }

    async fn currently_playing(&self, credential: &Credential) -> Result<Option<PlaybackInfo>> {
        let url = self.endpoint("me/player/currently-playing")?;
        let request = self.http_client.get(url).bearer(credential.access_token())?;

        let response = self.http_client.execute(request).await?;
        let status = response.status();
        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }

        let body = response.text().await?;
        if !status.is_success() {
            return Err(Error::from_status(status, body.trim()));
        }

        protocol::json(&body, "currently playing").map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn refusals_are_soft() {
        for status in [StatusCode::FORBIDDEN, StatusCode::NOT_FOUND] {
            assert!(matches!(
                soft_or_error(status, "restriction violated"),
                Ok(Outcome::Soft(_))
            ));
        }
    }

    #[test]
    fn rejected_token_is_an_error() {
        let err = soft_or_error(StatusCode::UNAUTHORIZED, "The access token expired").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthenticated);

        let err = soft_or_error(StatusCode::BAD_GATEWAY, "").unwrap_err();
        assert!(!err.kind.requires_login());
    }
}
