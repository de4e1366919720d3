use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::CoreError;
use crate::failure::FailureCode;

/// Serde helper to serialize/deserialize `std::time::Duration` as milliseconds (u64).
mod duration_ms {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

/// What an HTLC is failed with when the interceptor does not decide in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InterceptTimeoutPolicy {
    /// Fail with a retryable reason; the sender may try another path.
    #[default]
    Temporary,
    /// Fail with a permanent reason.
    Permanent,
}

impl InterceptTimeoutPolicy {
    pub fn failure_code(&self) -> FailureCode {
        match self {
            Self::Temporary => FailureCode::InterceptorTimeout,
            Self::Permanent => FailureCode::PermanentChannelFailure,
        }
    }
}

/// Policy knobs of the switch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchConfig {
    /// How long an intercepted HTLC waits for a decision.
    #[serde(default = "default_intercept_timeout", with = "duration_ms")]
    pub intercept_timeout: Duration,
    /// Failure used when the interception timeout elapses.
    #[serde(default)]
    pub intercept_timeout_policy: InterceptTimeoutPolicy,
    /// How long a circuit may stay unresolved before it is failed back.
    #[serde(default = "default_circuit_timeout", with = "duration_ms")]
    pub circuit_timeout: Duration,
    /// Delay between attempts to deliver a resolution the incoming channel
    /// refused.
    #[serde(default = "default_redelivery_interval", with = "duration_ms")]
    pub redelivery_interval: Duration,
    /// Capacity of each link's outgoing HTLC mailbox.
    #[serde(default = "default_mailbox_capacity")]
    pub link_mailbox_capacity: usize,
    /// Capacity of each link's report queue into the switch.
    #[serde(default = "default_report_capacity")]
    pub link_report_capacity: usize,
    /// Capacity of the queue handing forwards to the interceptor.
    #[serde(default = "default_interceptor_queue")]
    pub interceptor_queue_capacity: usize,
}

fn default_intercept_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_circuit_timeout() -> Duration {
    Duration::from_secs(3600)
}
fn default_redelivery_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_mailbox_capacity() -> usize {
    483
}
fn default_report_capacity() -> usize {
    256
}
fn default_interceptor_queue() -> usize {
    256
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            intercept_timeout: default_intercept_timeout(),
            intercept_timeout_policy: InterceptTimeoutPolicy::default(),
            circuit_timeout: default_circuit_timeout(),
            redelivery_interval: default_redelivery_interval(),
            link_mailbox_capacity: default_mailbox_capacity(),
            link_report_capacity: default_report_capacity(),
            interceptor_queue_capacity: default_interceptor_queue(),
        }
    }
}

impl SwitchConfig {
    /// Reject values the switch cannot run with.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.intercept_timeout.is_zero() {
            return Err(CoreError::InvalidConfig("intercept_timeout must be non-zero".into()));
        }
        if self.circuit_timeout.is_zero() {
            return Err(CoreError::InvalidConfig("circuit_timeout must be non-zero".into()));
        }
        if self.redelivery_interval.is_zero() {
            return Err(CoreError::InvalidConfig("redelivery_interval must be non-zero".into()));
        }
        if self.link_mailbox_capacity == 0
            || self.link_report_capacity == 0
            || self.interceptor_queue_capacity == 0
        {
            return Err(CoreError::InvalidConfig("queue capacities must be non-zero".into()));
        }
        Ok(())
    }
}
