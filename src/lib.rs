pub mod cluster;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod grpc;
pub mod lease;
pub mod longpoll;
pub mod shutdown;

pub use cluster::{InMemoryCluster, NotificationBus, PartitionRouter};
pub use config::{ClusterConfig, LongPollConfig};
pub use error::{ActivationError, LeaseGateError, PartitionError, Result};
pub use lease::{ActivateJobsRequest, ActivateJobsStream, JobBatch};
pub use longpoll::{CoordinatorSnapshot, LongPollCoordinator, LongPollHandle};
