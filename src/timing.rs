//! Timeouts that may be switched off.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use std::{
    fmt::{self, Debug},
    time::Duration,
};

/// An optional duration: an empty duration means that there should be no
/// timeout at all.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OptionalDuration(Option<Duration>);

impl OptionalDuration {
    /// The special constant representing "no timeout".
    pub const NONE: Self = Self(None);

    /// Convenience method to create an `OptionalDuration` of the given number of seconds
    #[must_use]
    pub const fn from_secs(duration: u64) -> Self {
        Self(Some(Duration::from_secs(duration)))
    }

    /// Convenience method to create an `OptionalDuration` of the given number of milliseconds
    #[must_use]
    pub const fn from_millis(duration: u64) -> Self {
        Self(Some(Duration::from_millis(duration)))
    }

    /// Use the optional duration to timeout a future
    ///
    /// # Errors
    /// Returns an `Err` variant if the future does not finish in the specified duration.
    pub async fn timeout<T>(&self, future: T) -> Result<T::Output, tokio::time::error::Elapsed>
    where
        T: std::future::Future,
    {
        match self.0 {
            Some(duration) => tokio::time::timeout(duration, future).await,
            None => Ok(future.await),
        }
    }
}

impl From<Duration> for OptionalDuration {
    fn from(duration: Duration) -> Self {
        if duration.is_zero() {
            Self::NONE
        } else {
            Self(Some(duration))
        }
    }
}

impl std::str::FromStr for OptionalDuration {
    type Err = std::num::ParseIntError;

    /// Parse a number of seconds; `0` disables the timeout.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.parse::<u64>()?;
        if value == 0 {
            Ok(Self::NONE)
        } else {
            Ok(Self::from_secs(value))
        }
    }
}

impl fmt::Display for OptionalDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(duration) => duration.fmt(f),
            None => write!(f, "indefinite"),
        }
    }
}
