use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings for a [ConditionalExecutor](crate::core::executor::ConditionalExecutor).
///
/// The default waits for connectivity without a deadline and retries transient failures
/// forever without pausing.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
  /// Deadline, in milliseconds from the start of the call, after which a call that is still
  /// waiting for a connection gives up. Time spent running the task and pausing between
  /// retries counts toward it.
  #[serde(default)]
  pub await_timeout_ms: Option<u64>,
  #[serde(default)]
  pub retry: RetryConfig,
}

impl ExecutorConfig {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_await_timeout(mut self, timeout: Duration) -> Self {
    self.await_timeout_ms = Some(as_millis(timeout));
    self
  }

  pub fn with_retry(mut self, retry: RetryConfig) -> Self {
    self.retry = retry;
    self
  }

  pub fn await_timeout(&self) -> Option<Duration> {
    self.await_timeout_ms.map(Duration::from_millis)
  }
}

impl FromStr for ExecutorConfig {
  type Err = serde_json::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    serde_json::from_str(s)
  }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
  /// Maximum number of re-runs after a transient failure. `None` retries forever.
  #[serde(default)]
  pub max_retries: Option<u32>,
  /// Pause before the first retry, in milliseconds. Zero retries immediately.
  #[serde(default)]
  pub base_delay_ms: u64,
  #[serde(default = "default_max_delay")]
  pub max_delay_ms: u64,
  #[serde(default)]
  pub exponential_backoff: bool,
}

fn default_max_delay() -> u64 {
  30_000
}

/// Saturates instead of truncating durations that do not fit in a `u64` of milliseconds.
fn as_millis(duration: Duration) -> u64 {
  u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_retries: None,
      base_delay_ms: 0,
      max_delay_ms: default_max_delay(),
      exponential_backoff: false,
    }
  }
}

impl RetryConfig {
  pub fn with_max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = Some(max_retries);
    self
  }

  pub fn with_delay(mut self, base_delay: Duration) -> Self {
    self.base_delay_ms = as_millis(base_delay);
    self
  }

  pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
    self.max_delay_ms = as_millis(max_delay);
    self
  }

  pub fn with_exponential_backoff(mut self, exponential_backoff: bool) -> Self {
    self.exponential_backoff = exponential_backoff;
    self
  }

  /// Whether another run is allowed after `retries` retries have already happened.
  pub fn allows_retry(&self, retries: u32) -> bool {
    self.max_retries.is_none_or(|max| retries < max)
  }

  /// Pause before retry number `retry` (1-based). `None` means retry at once.
  pub fn delay_for(&self, retry: u32) -> Option<Duration> {
    if self.base_delay_ms == 0 {
      return None;
    }

    let mut delay = self.base_delay_ms;
    if self.exponential_backoff {
      let factor = 1u64.checked_shl(retry.saturating_sub(1)).unwrap_or(u64::MAX);
      delay = delay.saturating_mul(factor);
    }
    Some(Duration::from_millis(delay.min(self.max_delay_ms)))
  }
}
