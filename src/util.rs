use std::time::{Duration, SystemTime};

use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::error::Result;

/// Formats an instant as RFC 3339 in UTC for log output.
///
/// Falls back to seconds since the epoch if the instant cannot be represented.
#[must_use]
pub fn format_time(instant: SystemTime) -> String {
    let datetime = match instant.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(after) => time::Duration::try_from(after)
            .ok()
            .and_then(|offset| OffsetDateTime::UNIX_EPOCH.checked_add(offset)),
        Err(e) => time::Duration::try_from(e.duration())
            .ok()
            .and_then(|offset| OffsetDateTime::UNIX_EPOCH.checked_sub(offset)),
    };

    datetime
        .and_then(|datetime| datetime.format(&Rfc3339).ok())
        .unwrap_or_else(|| format!("{}s", to_unix(instant)))
}

/// Parses an RFC 3339 timestamp like `2024-12-01T18:00:00+01:00`.
///
/// # Errors
///
/// Returns `InvalidArgument` if the input is not a valid RFC 3339 timestamp.
pub fn parse_time(input: &str) -> Result<SystemTime> {
    let parsed = OffsetDateTime::parse(input.trim(), &Rfc3339)?;
    Ok(parsed.into())
}

/// Seconds since the epoch, saturating at zero for instants before it.
#[must_use]
pub fn to_unix(instant: SystemTime) -> u64 {
    instant
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Adds up to `spread` of random delay to `duration`.
///
/// Spreads out retries of many clients that failed at the same moment.
#[must_use]
pub fn with_jitter(duration: Duration, spread: Duration) -> Duration {
    let spread_ms = u64::try_from(spread.as_millis()).unwrap_or(u64::MAX);
    duration + Duration::from_millis(fastrand::u64(0..=spread_ms))
}
