//! Rate and TTL strings.
//!
//! Rates are written as `"<limit>/<period>"` where the period is one of
//! `second`, `minute`, `hour` or `day`. They are parsed once, when the
//! governor is configured, so a malformed string never reaches the hot path.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Error returned when a rate string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid rate string '{input}': expected '<limit>/<second|minute|hour|day>'")]
pub struct RateParseError {
    input: String,
}

impl RateParseError {
    fn new(input: &str) -> Self {
        Self {
            input: input.to_string(),
        }
    }

    /// The string that failed to parse.
    pub fn input(&self) -> &str {
        &self.input
    }
}

/// Error returned when a TTL string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid duration '{input}': expected seconds or a number suffixed with s, m, h or d")]
pub struct TtlParseError {
    input: String,
}

/// A limit of `limit` operations per `period`.
///
/// # Example
/// ```
/// use request_governance::Rate;
/// use std::time::Duration;
///
/// let rate: Rate = "3/minute".parse().unwrap();
/// assert_eq!(rate.limit(), 3);
/// assert_eq!(rate.period(), Duration::from_secs(60));
/// assert!("3/fortnight".parse::<Rate>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rate {
    limit: u64,
    period_secs: u64,
}

impl Rate {
    /// Create a rate directly from a limit and a period in seconds.
    ///
    /// # Errors
    /// Returns an error if `period_secs` is zero.
    pub fn new(limit: u64, period_secs: u64) -> Result<Self, RateParseError> {
        if period_secs == 0 {
            return Err(RateParseError::new(&format!("{}/0s", limit)));
        }
        Ok(Self { limit, period_secs })
    }

    /// `limit` operations per second.
    pub fn per_second(limit: u64) -> Self {
        Self {
            limit,
            period_secs: 1,
        }
    }

    /// `limit` operations per minute.
    pub fn per_minute(limit: u64) -> Self {
        Self {
            limit,
            period_secs: 60,
        }
    }

    /// `limit` operations per hour.
    pub fn per_hour(limit: u64) -> Self {
        Self {
            limit,
            period_secs: 3_600,
        }
    }

    /// `limit` operations per day.
    pub fn per_day(limit: u64) -> Self {
        Self {
            limit,
            period_secs: 86_400,
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub fn period_secs(&self) -> u64 {
        self.period_secs
    }
}

fn period_seconds(unit: &str) -> Option<u64> {
    match unit {
        "second" => Some(1),
        "minute" => Some(60),
        "hour" => Some(3_600),
        "day" => Some(86_400),
        _ => None,
    }
}

impl FromStr for Rate {
    type Err = RateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        let (count, unit) = lowered
            .split_once('/')
            .ok_or_else(|| RateParseError::new(s))?;

        let limit = count
            .trim()
            .parse::<u64>()
            .map_err(|_| RateParseError::new(s))?;
        let period_secs = period_seconds(unit.trim()).ok_or_else(|| RateParseError::new(s))?;

        Ok(Self { limit, period_secs })
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.period_secs {
            1 => write!(f, "{}/second", self.limit),
            60 => write!(f, "{}/minute", self.limit),
            3_600 => write!(f, "{}/hour", self.limit),
            86_400 => write!(f, "{}/day", self.limit),
            other => write!(f, "{}/{}s", self.limit, other),
        }
    }
}

/// Parse a TTL such as `"24h"`, `"30m"`, `"90s"`, `"1.5d"` or `"3600"`.
///
/// Fractional values are truncated to whole seconds.
pub fn parse_ttl(input: &str) -> Result<Duration, TtlParseError> {
    let err = || TtlParseError {
        input: input.to_string(),
    };
    let s = input.trim().to_ascii_lowercase();
    if s.is_empty() {
        return Err(err());
    }

    let (number, factor) = match s.as_bytes()[s.len() - 1] {
        b's' => (&s[..s.len() - 1], 1.0),
        b'm' => (&s[..s.len() - 1], 60.0),
        b'h' => (&s[..s.len() - 1], 3_600.0),
        b'd' => (&s[..s.len() - 1], 86_400.0),
        _ => (s.as_str(), 1.0),
    };

    let value: f64 = number.trim().parse().map_err(|_| err())?;
    if !value.is_finite() || value < 0.0 {
        return Err(err());
    }
    Ok(Duration::from_secs((value * factor) as u64))
}
