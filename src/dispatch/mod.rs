//! Fan-out of one activation request over the partitions.

pub mod rotation;
pub mod single_pass;

pub use rotation::{PartitionRotation, PartitionWalk};
pub use single_pass::{DispatchOutcome, DispatchRun, DispatchStep, RunSummary};
