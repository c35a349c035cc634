//! A [`Duration`] which can be parsed from and displayed as human-readable
//! strings, like `90d`, `8760h` or `1h 30m`.
//!
//! Certificate lifetimes are configured by operators in YAML, so the string
//! representation is the primary interface of this type. Internally it is a
//! plain [`std::time::Duration`] and dereferences to it.
use std::{fmt::Display, ops::Deref, str::FromStr};

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

const SECONDS_PER_MINUTE: u64 = 60;
const SECONDS_PER_HOUR: u64 = 60 * SECONDS_PER_MINUTE;
const SECONDS_PER_DAY: u64 = 24 * SECONDS_PER_HOUR;

#[derive(Debug, PartialEq, Snafu)]
pub enum DurationParseError {
    #[snafu(display("failed to parse \"{input}\" as a duration"))]
    InvalidInput {
        source: humantime::DurationError,
        input: String,
    },
}

/// A thin wrapper around [`std::time::Duration`] with human-readable
/// [`FromStr`] and [`Display`] implementations.
///
/// Serializes as its [`Display`] string and deserializes through [`FromStr`].
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct Duration(std::time::Duration);

impl FromStr for Duration {
    type Err = DurationParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let duration = humantime::parse_duration(input.trim()).context(InvalidInputSnafu {
            input: input.to_owned(),
        })?;

        Ok(Self(duration))
    }
}

impl Display for Duration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_zero() {
            return write!(f, "0s");
        }

        write!(f, "{}", humantime::format_duration(self.0))
    }
}

impl TryFrom<String> for Duration {
    type Error = DurationParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Duration> for String {
    fn from(value: Duration) -> Self {
        value.to_string()
    }
}

impl Deref for Duration {
    type Target = std::time::Duration;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<std::time::Duration> for Duration {
    fn from(value: std::time::Duration) -> Self {
        Self(value)
    }
}

impl From<Duration> for std::time::Duration {
    fn from(value: Duration) -> Self {
        value.0
    }
}

impl Duration {
    /// Creates a new [`Duration`] containing the given number of seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Self(std::time::Duration::from_secs(secs))
    }

    /// Creates a new [`Duration`] from the given number of minutes. Panics if
    /// the number of seconds overflows a [`u64`].
    pub const fn from_minutes_unchecked(minutes: u64) -> Self {
        Self::from_secs(minutes * SECONDS_PER_MINUTE)
    }

    /// Creates a new [`Duration`] from the given number of hours. Panics if
    /// the number of seconds overflows a [`u64`].
    pub const fn from_hours_unchecked(hours: u64) -> Self {
        Self::from_secs(hours * SECONDS_PER_HOUR)
    }

    /// Creates a new [`Duration`] from the given number of days. Panics if
    /// the number of seconds overflows a [`u64`].
    pub const fn from_days_unchecked(days: u64) -> Self {
        Self::from_secs(days * SECONDS_PER_DAY)
    }
}
