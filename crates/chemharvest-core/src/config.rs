//! Pacing and retry knobs shared by every job

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::retry::RetryPolicy;

/// Default bound on the producer→lane channel
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Rate-limit and retry configuration of one job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobConfig {
    /// Concurrent worker lanes
    pub worker_count: usize,
    /// Minimum spacing between two consecutive calls of one lane
    pub request_delay: Duration,
    /// Successful items between two batch pauses (0 = never pause)
    pub batch_size: usize,
    /// Pause applied to all lanes after every `batch_size` successes
    pub batch_delay: Duration,
    /// Wait after a retryable failure
    pub cooldown_time: Duration,
    /// Retry bound per item; unset retries until shutdown
    pub max_retries: Option<u32>,
    /// Timeout of one remote call
    pub call_timeout: Duration,
    /// Items buffered between enumeration and the lanes
    pub queue_capacity: usize,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            request_delay: Duration::from_secs(1),
            batch_size: 0,
            batch_delay: Duration::ZERO,
            cooldown_time: Duration::from_secs(60),
            max_retries: None,
            call_timeout: Duration::from_secs(60),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl JobConfig {
    /// Reject settings that would deadlock or spin.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.worker_count == 0 {
            return Err(JobError::Config("worker_count must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(JobError::Config("queue_capacity must be at least 1".into()));
        }
        if self.call_timeout.is_zero() {
            return Err(JobError::Config("call_timeout must be positive".into()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.cooldown_time, self.max_retries)
    }
}

/// Stage section of a config file. Unset fields keep the stage's own
/// defaults; durations are seconds, fractions allowed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobOverrides {
    pub worker_count: Option<usize>,
    pub request_delay: Option<f64>,
    pub batch_size: Option<usize>,
    pub batch_delay: Option<f64>,
    pub cooldown_time: Option<f64>,
    /// Retry bound. Leaving it unset keeps the stage's bound, so a file can
    /// tighten or loosen a bounded stage but cannot make it retry without
    /// limit; stages that default to unbounded stay unbounded when unset.
    pub max_retries: Option<u32>,
    pub call_timeout: Option<f64>,
    pub queue_capacity: Option<usize>,
}

impl JobOverrides {
    /// Layer these settings over `base`. Unset fields, `max_retries`
    /// included, fall back to `base`.
    pub fn apply(&self, base: JobConfig) -> Result<JobConfig, JobError> {
        let secs = |name: &str, v: Option<f64>, default: Duration| match v {
            None => Ok(default),
            Some(v) => Duration::try_from_secs_f64(v)
                .map_err(|e| JobError::Config(format!("{name} = {v}: {e}"))),
        };
        Ok(JobConfig {
            worker_count: self.worker_count.unwrap_or(base.worker_count),
            request_delay: secs("request_delay", self.request_delay, base.request_delay)?,
            batch_size: self.batch_size.unwrap_or(base.batch_size),
            batch_delay: secs("batch_delay", self.batch_delay, base.batch_delay)?,
            cooldown_time: secs("cooldown_time", self.cooldown_time, base.cooldown_time)?,
            max_retries: self.max_retries.or(base.max_retries),
            call_timeout: secs("call_timeout", self.call_timeout, base.call_timeout)?,
            queue_capacity: self.queue_capacity.unwrap_or(base.queue_capacity),
        })
    }
}

/// Async batch submission settings.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    /// Maximum items per submitted shard
    pub shard_size: usize,
    /// Wait between two status polls of pending shards
    pub poll_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            shard_size: 50_000,
            poll_interval: Duration::from_secs(60),
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<(), JobError> {
        if self.shard_size == 0 {
            return Err(JobError::Config("shard_size must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(JobConfig::default().validate().is_ok());
        assert!(BatchConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_workers_rejected() {
        let cfg = JobConfig {
            worker_count: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(JobError::Config(_))));
    }

    #[test]
    fn overrides_keep_unset_fields() {
        let base = JobConfig {
            batch_size: 1000,
            request_delay: Duration::from_secs(3),
            ..Default::default()
        };
        let over: JobOverrides =
            serde_json::from_str(r#"{"request_delay": 0.5, "max_retries": 3}"#).unwrap();
        let cfg = over.apply(base).unwrap();
        assert_eq!(cfg.request_delay, Duration::from_millis(500));
        assert_eq!(cfg.max_retries, Some(3));
        assert_eq!(cfg.batch_size, 1000);
    }

    #[test]
    fn unset_retry_bound_keeps_stage_bound() {
        let bounded = JobConfig {
            max_retries: Some(5),
            ..Default::default()
        };
        let over: JobOverrides = serde_json::from_str(r#"{"worker_count": 2}"#).unwrap();
        assert_eq!(over.apply(bounded).unwrap().max_retries, Some(5));
        assert_eq!(over.apply(JobConfig::default()).unwrap().max_retries, None);
    }

    #[test]
    fn negative_delay_rejected() {
        let over = JobOverrides {
            batch_delay: Some(-1.0),
            ..Default::default()
        };
        assert!(matches!(
            over.apply(JobConfig::default()),
            Err(JobError::Config(_))
        ));
    }

    #[test]
    fn unknown_stage_key_rejected() {
        let res: Result<JobOverrides, _> = serde_json::from_str(r#"{"workers": 4}"#);
        assert!(res.is_err());
    }
}
