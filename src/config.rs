use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff between retry attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    #[serde(with = "millis")]
    pub initial: Duration,
    pub multiplier: f64,
    #[serde(with = "millis")]
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(200),
            multiplier: 2.0,
            max: Duration::from_secs(2),
        }
    }
}

impl Backoff {
    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.saturating_sub(1) as i32);
        let delay = self.initial.as_secs_f64() * factor;

        if delay.is_finite() && delay < self.max.as_secs_f64() {
            Duration::from_secs_f64(delay)
        } else {
            self.max
        }
    }
}

/// Per-capability overrides of the uniform defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Override {
    #[serde(with = "millis_opt")]
    pub timeout: Option<Duration>,
    pub retry_budget: Option<u32>,
}

/// Knobs of the scheduler. Durations are (de)serialized as milliseconds.
///
/// ```rust
/// use std::time::Duration;
/// use locus::Config;
///
/// let config = Config::default()
///     .with_timeout(Duration::from_secs(5))
///     .with_retry_budget(1)
///     .with_max_concurrency(4);
///
/// assert_eq!(config.policy("weather").retry_budget, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Deadline of a single provider attempt.
    #[serde(with = "millis")]
    pub timeout: Duration,
    /// Number of retries after the first attempt, for retryable failures.
    pub retry_budget: u32,
    pub backoff: Backoff,
    /// Maximum number of provider calls in flight, unbounded when `None`.
    pub max_concurrency: Option<usize>,
    /// Overall deadline of a request, acts like a cancellation.
    #[serde(with = "millis_opt")]
    pub request_deadline: Option<Duration>,
    /// How long running calls may still finish after cancellation.
    #[serde(with = "millis")]
    pub grace_period: Duration,
    pub overrides: HashMap<String, Override>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retry_budget: 2,
            backoff: Backoff::default(),
            max_concurrency: None,
            request_deadline: None,
            grace_period: Duration::from_millis(250),
            overrides: HashMap::new(),
        }
    }
}

impl Config {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_budget(mut self, retry_budget: u32) -> Self {
        self.retry_budget = retry_budget;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit.max(1));
        self
    }

    pub fn with_request_deadline(mut self, deadline: Duration) -> Self {
        self.request_deadline = Some(deadline);
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_override(mut self, capability: impl Into<String>, value: Override) -> Self {
        self.overrides.insert(capability.into(), value);
        self
    }

    /// Effective policy of one capability.
    pub fn policy(&self, capability: &str) -> Policy {
        let custom = self.overrides.get(capability);

        Policy {
            timeout: custom
                .and_then(|o| o.timeout)
                .unwrap_or(self.timeout),
            retry_budget: custom
                .and_then(|o| o.retry_budget)
                .unwrap_or(self.retry_budget),
            backoff: self.backoff.clone(),
        }
    }
}

/// Resolved timeout and retry settings of a single node.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub timeout: Duration,
    pub retry_budget: u32,
    pub backoff: Backoff,
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod millis_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.serialize_some(&(value.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = Backoff {
            initial: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_millis(350),
        };

        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(350));
        assert_eq!(backoff.delay(30), Duration::from_millis(350));
    }

    #[test]
    fn test_override_policy() {
        let config = Config::default().with_override(
            "navigator",
            Override {
                timeout: Some(Duration::from_secs(30)),
                retry_budget: None,
            },
        );

        let navigator = config.policy("navigator");
        assert_eq!(navigator.timeout, Duration::from_secs(30));
        assert_eq!(navigator.retry_budget, 2);

        let weather = config.policy("weather");
        assert_eq!(weather.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: Config = serde_json::from_str(
            r#"{
                "timeout": 1500,
                "max_concurrency": 3,
                "request_deadline": 20000,
                "overrides": { "weather": { "retry_budget": 5 } }
            }"#,
        )
        .unwrap();

        assert_eq!(config.timeout, Duration::from_millis(1500));
        assert_eq!(config.max_concurrency, Some(3));
        assert_eq!(config.request_deadline, Some(Duration::from_secs(20)));
        assert_eq!(config.retry_budget, 2);
        assert_eq!(config.policy("weather").retry_budget, 5);
        assert_eq!(config.backoff, Backoff::default());
    }
}
