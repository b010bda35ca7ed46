use thiserror::Error;

/// Errors reported by a partition when asked to activate or release jobs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PartitionError {
    #[error("Command rejected: {reason}")]
    Rejected { reason: String },

    #[error("Partition is exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Partition unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PartitionError {
    /// The command itself was invalid; retrying it elsewhere is pointless.
    pub fn is_rejection(&self) -> bool {
        matches!(self, PartitionError::Rejected { .. })
    }

    /// The partition signaled backpressure.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, PartitionError::ResourceExhausted(_))
    }
}

/// Terminal errors delivered to a client's activation stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActivationError {
    #[error("Invalid activation request: {0}")]
    InvalidArgument(String),

    #[error("Activation of jobs of type '{job_type}' was rejected: {reason}")]
    Rejected { job_type: String, reason: String },

    #[error(
        "Expected to activate jobs of type '{job_type}', but no jobs were available and at least one partition returned RESOURCE_EXHAUSTED; retry later"
    )]
    ResourceExhausted { job_type: String },

    #[error("Gateway unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum LeaseGateError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Long polling coordinator is not running")]
    CoordinatorStopped,
}

pub type Result<T> = std::result::Result<T, LeaseGateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_error_classification() {
        let rejected = PartitionError::Rejected {
            reason: "unknown type".to_string(),
        };
        assert!(rejected.is_rejection());
        assert!(!rejected.is_resource_exhausted());

        let exhausted = PartitionError::ResourceExhausted("backpressure".to_string());
        assert!(exhausted.is_resource_exhausted());
        assert!(!exhausted.is_rejection());

        let other = PartitionError::Unavailable("leader changed".to_string());
        assert!(!other.is_rejection());
        assert!(!other.is_resource_exhausted());
    }

    #[test]
    fn activation_error_mentions_job_type() {
        let err = ActivationError::ResourceExhausted {
            job_type: "payment".to_string(),
        };
        assert!(err.to_string().contains("'payment'"));
        assert!(err.to_string().contains("RESOURCE_EXHAUSTED"));
    }
}
