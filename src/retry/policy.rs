use crate::core::ConfigError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Multiplicative jitter bounds: each delay is scaled by a value drawn
/// uniformly from `[low, high)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JitterRange {
    pub low: f64,
    pub high: f64,
}

impl JitterRange {
    pub const fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    /// No jitter: every delay equals its expected value.
    pub const fn none() -> Self {
        Self { low: 1.0, high: 1.0 }
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        if self.high <= self.low {
            self.low
        } else {
            rng.gen_range(self.low..self.high)
        }
    }
}

impl Default for JitterRange {
    fn default() -> Self {
        Self::new(0.5, 1.5)
    }
}

/// Retry policy for a [`TransactionRunner`](crate::TransactionRunner).
///
/// The delay before attempt `r + 1` (after attempt `r` hit a conflict) is
/// `backoff_factor^r * backoff_base * u`, with `u` drawn from the jitter
/// range and the result capped at `max_backoff` when set.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use txretry::RetryPolicy;
///
/// let policy = RetryPolicy::new()
///     .max_retries(5)
///     .backoff_base(Duration::from_millis(20))
///     .max_backoff(Duration::from_secs(1));
///
/// assert!(policy.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempt ceiling, >= 1.
    pub max_retries: u32,

    #[serde(with = "millis")]
    pub backoff_base: Duration,

    /// Exponential growth rate, > 1.
    pub backoff_factor: f64,

    pub jitter: JitterRange,

    /// Upper bound for a single backoff wait.
    #[serde(with = "opt_millis")]
    pub max_backoff: Option<Duration>,

    /// Bound on the whole invocation, attempts and waits included.
    #[serde(with = "opt_millis")]
    pub deadline: Option<Duration>,
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_millis(100),
            backoff_factor: 2.0,
            jitter: JitterRange::default(),
            max_backoff: None,
            deadline: None,
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn jitter(mut self, jitter: JitterRange) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_backoff(mut self, max: Duration) -> Self {
        self.max_backoff = Some(max);
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::ZeroRetries);
        }

        if self.backoff_base.is_zero() {
            return Err(ConfigError::ZeroBackoffBase);
        }

        if !(self.backoff_factor > 1.0) || !self.backoff_factor.is_finite() {
            return Err(ConfigError::InvalidBackoffFactor(self.backoff_factor));
        }

        let JitterRange { low, high } = self.jitter;
        let fixed = low == high && low > 0.0;
        if !low.is_finite() || !high.is_finite() || low < 0.0 || (high <= low && !fixed) {
            return Err(ConfigError::InvalidJitter { low, high });
        }

        if let Some(max) = self.max_backoff {
            if max < self.backoff_base {
                return Err(ConfigError::BackoffCapBelowBase {
                    base: self.backoff_base,
                    max,
                });
            }
        }

        if self.deadline.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::ZeroDeadline);
        }

        Ok(())
    }

    /// Expected delay after a conflict on `attempt`, before jitter and cap.
    pub fn jitterless_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scale = self.backoff_factor.powi(exponent);
        saturating_secs(self.backoff_base.as_secs_f64() * scale)
    }

    /// `[lower, upper)` envelope of the delay after `attempt`, cap applied.
    ///
    /// With a fixed jitter factor (`low == high`, e.g. [`JitterRange::none`])
    /// the envelope collapses to `(d, d)` and every delay equals `d`. The cap
    /// can collapse it the same way.
    pub fn delay_bounds(&self, attempt: u32) -> (Duration, Duration) {
        let expected = self.jitterless_delay(attempt).as_secs_f64();
        let lower = self.cap(saturating_secs(expected * self.jitter.low));
        let upper = self.cap(saturating_secs(expected * self.jitter.high));
        (lower, upper)
    }

    /// Delay after a conflict on `attempt`, jitter drawn from `rng`.
    pub fn backoff_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let expected = self.jitterless_delay(attempt).as_secs_f64();
        let factor = self.jitter.sample(rng);
        self.cap(saturating_secs(expected * factor))
    }

    /// Delay after a conflict on `attempt`, jitter drawn from the thread-local RNG.
    pub fn random_backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff_delay(attempt, &mut rand::thread_rng())
    }

    fn cap(&self, delay: Duration) -> Duration {
        match self.max_backoff {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

fn saturating_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().try_into().unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
