use std::time::Duration;

use crate::error::{LeaseGateError, Result};

pub const DEFAULT_LONG_POLLING_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MIN_EMPTY_RESPONSES: u32 = 3;

/// Long polling behaviour of the activation coordinator.
#[derive(Debug, Clone)]
pub struct LongPollConfig {
    /// When false every request is answered after a single pass over the
    /// partitions, as if it had been sent with a negative request timeout.
    pub enabled: bool,

    /// How long a parked request waits for jobs when it carries no timeout of
    /// its own.
    pub timeout: Duration,

    /// Interval of the probe. A job type that saw no activity for this long
    /// gets one parked request dispatched unsolicited.
    pub probe_timeout: Duration,

    /// Number of consecutive empty passes after which new requests for a job
    /// type are parked immediately instead of being dispatched.
    pub min_empty_responses: u32,
}

impl Default for LongPollConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: DEFAULT_LONG_POLLING_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            min_empty_responses: DEFAULT_MIN_EMPTY_RESPONSES,
        }
    }
}

impl LongPollConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    pub fn with_min_empty_responses(mut self, min_empty_responses: u32) -> Self {
        self.min_empty_responses = min_empty_responses;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_empty_responses == 0 {
            return Err(LeaseGateError::InvalidConfig(
                "min_empty_responses must be at least 1".to_string(),
            ));
        }
        if self.probe_timeout.is_zero() {
            return Err(LeaseGateError::InvalidConfig(
                "probe_timeout must be greater than zero".to_string(),
            ));
        }
        if self.enabled && self.timeout.is_zero() {
            return Err(LeaseGateError::InvalidConfig(
                "timeout must be greater than zero when long polling is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// Shape of the in-memory partitioned backlog.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub partition_count: u32,
    /// Upper bound of jobs a partition returns in one response. A partition
    /// holding more than this flags its response as truncated.
    pub max_jobs_per_response: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            partition_count: 3,
            max_jobs_per_response: 32,
        }
    }
}

impl ClusterConfig {
    pub fn new(partition_count: u32) -> Self {
        Self {
            partition_count,
            ..Default::default()
        }
    }

    pub fn with_max_jobs_per_response(mut self, max_jobs_per_response: u32) -> Self {
        self.max_jobs_per_response = max_jobs_per_response;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_jobs_per_response == 0 {
            return Err(LeaseGateError::InvalidConfig(
                "max_jobs_per_response must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
