//! Events broadcast to connected clients.
//!
//! Events travel over the push transport as plain text frames holding the
//! event name, e.g. `renewed`.
//!
//! # Example
//!
//! ```rust
//! use booster::events::Event;
//!
//! let event: Event = "renewed".parse()?;
//! assert_eq!(event, Event::Renewed);
//! assert_eq!(event.to_string(), "renewed");
//! ```

use std::{fmt, str::FromStr};

use crate::error::Error;

/// Events emitted by the credential lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    /// The credential was renewed.
    ///
    /// Emitted after a successful refresh or code exchange, once the new
    /// credential is in the store. Consumers re-read the session file or ask
    /// the coordinator for the current credential; the event itself carries no
    /// tokens.
    Renewed,
}

impl Event {
    const RENEWED: &'static str = "renewed";
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Renewed => write!(f, "{}", Self::RENEWED),
        }
    }
}

impl FromStr for Event {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            Self::RENEWED => Ok(Self::Renewed),
            other => Err(Error::invalid_argument(format!("unknown event: {other}"))),
        }
    }
}
