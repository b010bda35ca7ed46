use std::collections::HashMap;

use crate::cluster::PartitionId;

#[derive(Debug, Default, Clone, Copy)]
struct Cursor {
    position: u64,
    current: Option<PartitionId>,
}

/// Round robin start partition per job type.
///
/// The cursor is a free-running counter reduced modulo the partition count on
/// every call, so a topology that grows or shrinks between calls never
/// invalidates it.
#[derive(Debug, Default)]
pub struct PartitionRotation {
    /// One cursor per job type ever dispatched. A cursor outlives the ledger
    /// of its type, so a type that goes idle between requests keeps rotating
    /// instead of restarting at partition 1.
    cursors: HashMap<String, Cursor>,
}

impl PartitionRotation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the cursor of `job_type` and return the partition it lands on.
    /// Returns `None` when the topology has no partitions.
    pub fn next(&mut self, job_type: &str, partition_count: u32) -> Option<PartitionId> {
        if partition_count == 0 {
            return None;
        }
        let cursor = self.cursors.entry(job_type.to_string()).or_default();
        let partition_id = (cursor.position % u64::from(partition_count)) as PartitionId + 1;
        cursor.position = cursor.position.wrapping_add(1);
        cursor.current = Some(partition_id);
        Some(partition_id)
    }

    /// Partition most recently returned by `next` for this job type.
    pub fn current(&self, job_type: &str) -> Option<PartitionId> {
        self.cursors.get(job_type).and_then(|cursor| cursor.current)
    }
}

/// Visits every partition once, starting at a given one and wrapping.
#[derive(Debug, Clone)]
pub struct PartitionWalk {
    start: PartitionId,
    partition_count: u32,
    visited: u32,
}

impl PartitionWalk {
    pub fn new(start: PartitionId, partition_count: u32) -> Self {
        Self {
            start,
            partition_count,
            visited: 0,
        }
    }

    /// A walk over an empty topology.
    pub fn empty() -> Self {
        Self::new(1, 0)
    }

    pub fn has_next(&self) -> bool {
        self.visited < self.partition_count
    }
}

impl Iterator for PartitionWalk {
    type Item = PartitionId;

    fn next(&mut self) -> Option<PartitionId> {
        if !self.has_next() {
            return None;
        }
        let offset = (self.start.saturating_sub(1) + self.visited) % self.partition_count;
        self.visited += 1;
        Some(offset + 1)
    }
}
