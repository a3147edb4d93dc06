//! Player endpoint types of the Web API.
//!
//! # Wire Format
//!
//! `GET /me/player/devices`:
//! ```json
//! {
//!     "devices": [
//!         {
//!             "id": "5fbb3ba6aa454b5534c4ba43a8c7e8e45a63ad0e",
//!             "is_active": false,
//!             "is_restricted": false,
//!             "name": "Living Room",
//!             "type": "Speaker",
//!             "volume_percent": 70
//!         }
//!     ]
//! }
//! ```
//!
//! `GET /me/player/currently-playing` answers `204 No Content` when nothing is
//! playing, otherwise:
//! ```json
//! {
//!     "is_playing": true,
//!     "progress_ms": 44272,
//!     "item": { "uri": "spotify:track:...", "name": "...", "duration_ms": 207959 }
//! }
//! ```

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize)]
pub struct Devices {
    #[serde(default)]
    pub devices: Vec<Device>,
}

/// A Connect device that can play back.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
pub struct Device {
    /// Missing for devices that cannot be targeted by the Web API.
    #[serde(default)]
    pub id: Option<String>,

    pub name: String,

    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub is_active: bool,

    #[serde(default)]
    pub is_restricted: bool,

    #[serde(default)]
    pub volume_percent: Option<u8>,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.kind)?;
        if let Some(id) = &self.id {
            write!(f, " [{id}]")?;
        }
        if self.is_active {
            write!(f, " *active*")?;
        }
        Ok(())
    }
}

/// What the account is currently playing.
#[serde_as]
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
pub struct PlaybackInfo {
    #[serde(default)]
    pub is_playing: bool,

    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub progress_ms: Option<Duration>,

    #[serde(default)]
    pub item: Option<Item>,
}

impl fmt::Display for PlaybackInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_playing { "playing" } else { "paused" };
        match &self.item {
            Some(item) => write!(f, "{state}: {}", item.name),
            None => write!(f, "{state}"),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
pub struct Item {
    pub uri: String,
    pub name: String,
}

/// Body of `PUT /me/player/play`.
///
/// An empty body resumes whatever the device had queued.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct Play {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uris: Option<Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn devices_parse_and_display() {
        let body = r#"{"devices":[{"id":"abc","is_active":true,"is_restricted":false,"name":"Desk","type":"Computer","volume_percent":40}]}"#;
        let devices: Devices = serde_json::from_str(body).unwrap();

        assert_eq!(devices.devices.len(), 1);
        assert_eq!(devices.devices[0].to_string(), "Desk (Computer) [abc] *active*");
    }

    #[test]
    fn play_body_omits_missing_uris() {
        assert_eq!(serde_json::to_string(&Play::default()).unwrap(), "{}");

        let play = Play {
            uris: Some(vec!["spotify:track:1".to_owned()]),
        };
        assert_eq!(serde_json::to_string(&play).unwrap(), r#"{"uris":["spotify:track:1"]}"#);
    }

    #[test]
    fn playback_info_tolerates_missing_item() {
        let info: PlaybackInfo = serde_json::from_str(r#"{"is_playing":false}"#).unwrap();
        assert_eq!(info.to_string(), "paused");
    }
}
