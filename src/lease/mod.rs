//! Client activation requests and their response streams.

pub mod request;
pub mod sink;

pub use request::{ActivateJobsRequest, LeaseRequest, LeaseStatus, RequestId};
pub use sink::{ActivateJobsStream, JobBatch, ResponseSink};
