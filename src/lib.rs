//! Keeps an OAuth session to a streaming service alive and starts and stops
//! playback on a schedule.
//!
//! # Overview
//!
//! * [`store::CredentialStore`] holds the live credential, replaced as a whole
//!   on every renewal.
//! * [`refresh::RefreshCoordinator`] hands out valid credentials, renewing
//!   them with at most one request in flight.
//! * [`hub::NotificationHub`] tells subscribers that the credential was
//!   renewed; [`push`] carries that over WebSocket to other processes.
//! * [`scheduler::Scheduler`] starts playback when a window opens and stops it
//!   when the window ends.
//! * [`lifecycle`] renews ahead of expiry and persists every renewal;
//!   [`callback`] completes a login at the redirect URI.
//!
//! Everything that talks to the network sits behind a trait
//! ([`issuer::CredentialIssuer`], [`player::PlaybackBackend`]) so that the
//! lifecycle can be driven with synthetic clocks in tests.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

#[macro_use]
extern crate log;

pub mod callback;
pub mod config;
pub mod credential;
pub mod error;
pub mod events;
pub mod http;
pub mod hub;
pub mod issuer;
pub mod lifecycle;
pub mod player;
pub mod protocol;
pub mod push;
pub mod refresh;
pub mod scheduler;
pub mod secrets;
pub mod session;
pub mod signal;
pub mod store;
pub mod util;
