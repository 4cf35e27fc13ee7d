use crate::core::{MetaError, Result};
use std::sync::atomic::{AtomicU64, Ordering};

/// Source of cluster-unique ids for DBs, spaces, partitions and replicas.
pub trait IdGenerator: Send + Sync {
    fn gen_id(&self) -> Result<u64>;
}

/// Monotonic in-process id sequence.
///
/// With a ceiling set, ids past it fail with `IdGenerationFailed` instead of
/// wrapping, which is how exhaustion is simulated.
#[derive(Debug)]
pub struct SequenceIdGenerator {
    next: AtomicU64,
    ceiling: u64,
}

impl SequenceIdGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
            ceiling: u64::MAX,
        }
    }

    pub fn with_ceiling(mut self, ceiling: u64) -> Self {
        self.ceiling = ceiling;
        self
    }
}

impl Default for SequenceIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator for SequenceIdGenerator {
    fn gen_id(&self) -> Result<u64> {
        let ceiling = self.ceiling;
        self.next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| {
                if id <= ceiling { id.checked_add(1) } else { None }
            })
            .map_err(|id| MetaError::IdGenerationFailed(format!("id space exhausted at {}", id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_sequential() {
        let ids = SequenceIdGenerator::starting_at(10);
        assert_eq!(ids.gen_id().unwrap(), 10);
        assert_eq!(ids.gen_id().unwrap(), 11);
    }

    #[test]
    fn test_ceiling_exhausts() {
        let ids = SequenceIdGenerator::new().with_ceiling(2);
        assert_eq!(ids.gen_id().unwrap(), 1);
        assert_eq!(ids.gen_id().unwrap(), 2);
        assert!(matches!(ids.gen_id(), Err(MetaError::IdGenerationFailed(_))));
    }
}
