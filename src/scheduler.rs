//! Starts and stops playback according to a schedule window.
//!
//! The [`Scheduler`] does not own a timer. Whoever drives it calls
//! [`Scheduler::tick`] periodically with the current time; each tick compares
//! the desired state (inside or outside the window) with the actual state and
//! acts on the difference. Ticks are idempotent, so calling them more often
//! than needed is harmless, and tests drive them with synthetic instants.
//!
//! # States
//!
//! ```text
//!         window open, credential usable
//!   Idle ──────────────> Starting ──────────────> Running
//!    ^                       │ start failed          │
//!    └───────────────────────┘                       │
//!    ^      window ended, stop issued                │
//!    └───────────────────────────────────────────────┘
//! ```
//!
//! # Precedence
//!
//! 1. Without a window nothing happens.
//! 2. Once `now >= end` the stop path runs, even if the tick lands exactly on
//!    the end instant.
//! 3. Before `start` nothing happens.
//! 4. While running, the only work is the one-shot credential recheck.
//! 5. Otherwise playback is started, unless an earlier attempt in the same
//!    window found that the user has to log in again.
//!
//! # Recheck
//!
//! Some time after a start, the credential is validated once more. When it can
//! no longer be obtained the state is demoted to `Idle` so that the next tick
//! reacts. The recheck never stops playback by itself: stopping is left to the
//! window end, which still pauses playback that this scheduler started.

use std::{
    fmt,
    future::Future,
    sync::Arc,
    time::{Duration, SystemTime},
};

use crate::{
    config::Config,
    error::{Error, Result},
    player::{Outcome, PlaybackBackend},
    refresh::RefreshCoordinator,
    util::format_time,
};

/// Half-open interval `[start, end)` during which playback should run.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ScheduleWindow {
    start: SystemTime,
    end: SystemTime,
}

impl ScheduleWindow {
    /// Creates a window.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `end` is not after `start`.
    pub fn new(start: SystemTime, end: SystemTime) -> Result<Self> {
        if end <= start {
            return Err(Error::invalid_argument(format!(
                "schedule window must end after it starts ({} - {})",
                format_time(start),
                format_time(end)
            )));
        }

        Ok(Self { start, end })
    }

    #[must_use]
    pub fn start(&self) -> SystemTime {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> SystemTime {
        self.end
    }

    #[must_use]
    pub fn contains(&self, instant: SystemTime) -> bool {
        self.start <= instant && instant < self.end
    }
}

impl fmt::Display for ScheduleWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", format_time(self.start), format_time(self.end))
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum PlaybackState {
    #[default]
    Idle,
    Starting,
    Running,
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
        }
    }
}

/// What a single tick did.
#[derive(Debug)]
pub enum Tick {
    /// No window is configured.
    Idle,
    /// The window has not opened yet.
    Pending,
    Started(Outcome),
    StartFailed(Error),
    /// Skipped: playback is already running inside the window.
    AlreadyRunning,
    /// Skipped: starting needs a new login first.
    Blocked,
    /// The credential recheck found nothing wrong.
    Rechecked,
    /// The credential recheck failed and the state was demoted to idle.
    Demoted(Error),
    Stopped(Outcome),
    StopFailed(Error),
    /// The window ended without playback to stop.
    Expired,
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "no window"),
            Self::Pending => write!(f, "window not yet open"),
            Self::Started(outcome) => write!(f, "started playback: {outcome}"),
            Self::StartFailed(e) => write!(f, "start failed: {e}"),
            Self::AlreadyRunning => write!(f, "skip, already running"),
            Self::Blocked => write!(f, "skip, login required"),
            Self::Rechecked => write!(f, "credential rechecked"),
            Self::Demoted(e) => write!(f, "demoted to idle: {e}"),
            Self::Stopped(outcome) => write!(f, "stopped playback: {outcome}"),
            Self::StopFailed(e) => write!(f, "stop failed: {e}"),
            Self::Expired => write!(f, "window expired"),
        }
    }
}

/// The configured window and what happened in it so far.
#[derive(Debug)]
struct Active {
    window: ScheduleWindow,
    /// Set when the credential needs a new login; cleared by a new window.
    blocked: bool,
    /// Set once playback was started in this window.
    owes_stop: bool,
}

pub struct Scheduler {
    coordinator: RefreshCoordinator,
    player: Arc<dyn PlaybackBackend>,

    device: Option<String>,
    track: Option<String>,

    threshold: Duration,
    recheck_delay: Duration,
    action_timeout: Duration,

    window: Option<Active>,
    state: PlaybackState,
    recheck_at: Option<SystemTime>,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        coordinator: RefreshCoordinator,
        player: Arc<dyn PlaybackBackend>,
        config: &Config,
    ) -> Self {
        Self {
            coordinator,
            player,

            device: config.device_id.clone(),
            track: config.track_uri.clone(),

            threshold: config.refresh_threshold,
            recheck_delay: config.recheck_delay,
            action_timeout: config.request_timeout,

            window: None,
            state: PlaybackState::Idle,
            recheck_at: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> PlaybackState {
        self.state
    }

    #[must_use]
    pub fn window(&self) -> Option<ScheduleWindow> {
        self.window.as_ref().map(|active| active.window)
    }

    /// When the pending credential recheck is due, if one is pending.
    #[must_use]
    pub fn recheck_at(&self) -> Option<SystemTime> {
        self.recheck_at
    }

    /// Validates and sets the window.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `end` is not after `start`. The window
    /// configured before, if any, stays in place.
    pub fn configure(&mut self, start: SystemTime, end: SystemTime) -> Result<()> {
        let window = ScheduleWindow::new(start, end)?;
        self.set_window(window);
        Ok(())
    }

    /// Replaces the window.
    ///
    /// Playback started under the previous window is still stopped when the
    /// new window ends.
    pub fn set_window(&mut self, window: ScheduleWindow) {
        if self.window().is_some_and(|current| current == window) {
            return;
        }

        let owes_stop = self.window.as_ref().is_some_and(|active| active.owes_stop);
        info!("schedule window set to {window}");
        self.window = Some(Active {
            window,
            blocked: false,
            owes_stop,
        });
    }

    /// Forgets the window without touching playback.
    ///
    /// Cancels a pending recheck.
    pub fn clear_window(&mut self) {
        if let Some(active) = self.window.take() {
            info!("schedule window {} cleared", active.window);
        }
        self.reset();
    }

    /// Stops playback right away and forgets the window.
    ///
    /// Cancels a pending recheck, whether or not the stop succeeds.
    ///
    /// # Errors
    ///
    /// Returns error if no usable credential could be obtained or the pause
    /// command failed.
    pub async fn stop_now(&mut self, now: SystemTime) -> Result<Outcome> {
        self.clear_window();

        let credential = self.coordinator.ensure_valid(now, self.threshold).await?;
        let outcome = bounded(self.action_timeout, self.player.pause(&credential)).await?;
        info!("playback stopped manually: {outcome}");
        Ok(outcome)
    }

    /// Runs one reconciliation step at `now`.
    ///
    /// Errors are contained in the returned [`Tick`]; a failing tick leaves
    /// the scheduler ready for the next one.
    pub async fn tick(&mut self, now: SystemTime) -> Tick {
        let Some(active) = &self.window else {
            self.reset();
            return Tick::Idle;
        };
        let (window, blocked, owes_stop) = (active.window, active.blocked, active.owes_stop);

        if now >= window.end() {
            if self.state == PlaybackState::Running || owes_stop {
                return self.stop(now).await;
            }

            info!("schedule window {window} ended");
            self.clear_window();
            return Tick::Expired;
        }

        if now < window.start() {
            return Tick::Pending;
        }

        if self.state == PlaybackState::Running {
            if self.recheck_at.is_some_and(|at| now >= at) {
                return self.recheck(now).await;
            }
            return Tick::AlreadyRunning;
        }

        // A tick cancelled while starting leaves `Starting` behind; it is
        // retried like `Idle`.
        if blocked {
            return Tick::Blocked;
        }

        self.start(now).await
    }

    async fn start(&mut self, now: SystemTime) -> Tick {
        self.state = PlaybackState::Starting;

        let credential = match self.coordinator.ensure_valid(now, self.threshold).await {
            Ok(credential) => credential,
            Err(e) => {
                self.state = PlaybackState::Idle;
                if e.requires_login() {
                    error!("not starting playback: {e}; log in again");
                    self.block();
                } else {
                    warn!("not starting playback: {e}");
                }
                return Tick::StartFailed(e.into());
            }
        };

        let started = bounded(
            self.action_timeout,
            self.player
                .start(&credential, self.device.as_deref(), self.track.as_deref()),
        )
        .await;

        match started {
            Ok(outcome) => {
                info!("playback started: {outcome}");
                self.state = PlaybackState::Running;
                self.recheck_at = now.checked_add(self.recheck_delay);
                if let Some(active) = self.window.as_mut() {
                    active.owes_stop = true;
                }
                Tick::Started(outcome)
            }
            Err(e) => {
                warn!("starting playback failed: {e}");
                self.state = PlaybackState::Idle;
                Tick::StartFailed(e)
            }
        }
    }

    async fn stop(&mut self, now: SystemTime) -> Tick {
        let credential = match self.coordinator.ensure_valid(now, self.threshold).await {
            Ok(credential) => credential,
            Err(e) if e.requires_login() => {
                error!("cannot stop playback: {e}; log in again");
                self.clear_window();
                return Tick::StopFailed(e.into());
            }
            Err(e) => {
                warn!("cannot stop playback yet: {e}");
                return Tick::StopFailed(e.into());
            }
        };

        match bounded(self.action_timeout, self.player.pause(&credential)).await {
            Ok(outcome) => {
                info!("playback stopped: {outcome}");
                self.clear_window();
                Tick::Stopped(outcome)
            }
            Err(e) => {
                warn!("stopping playback failed: {e}");
                Tick::StopFailed(e)
            }
        }
    }

    async fn recheck(&mut self, now: SystemTime) -> Tick {
        self.recheck_at = None;

        let credential = match self.coordinator.ensure_valid(now, self.threshold).await {
            Ok(credential) => credential,
            Err(e) => {
                warn!("credential recheck failed: {e}");
                self.demote(e.requires_login());
                return Tick::Demoted(e.into());
            }
        };

        match bounded(self.action_timeout, self.player.currently_playing(&credential)).await {
            Ok(Some(info)) => debug!("recheck: {info}"),
            Ok(None) => debug!("recheck: nothing playing"),
            Err(e) if e.kind.requires_login() => {
                warn!("credential recheck rejected: {e}");
                self.demote(true);
                return Tick::Demoted(e);
            }
            Err(e) => debug!("recheck: playback state unknown: {e}"),
        }

        Tick::Rechecked
    }

    fn demote(&mut self, requires_login: bool) {
        self.state = PlaybackState::Idle;
        if requires_login {
            self.block();
        }
    }

    fn block(&mut self) {
        if let Some(active) = self.window.as_mut() {
            active.blocked = true;
        }
    }

    fn reset(&mut self) {
        self.state = PlaybackState::Idle;
        self.recheck_at = None;
    }
}

/// Awaits a playback command for at most `timeout`.
async fn bounded<T>(timeout: Duration, action: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(timeout, action)
        .await
        .unwrap_or_else(|e| Err(e.into()))
}
