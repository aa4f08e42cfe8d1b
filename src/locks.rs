use crate::error::{PipelineError, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Per-source lease. Ingestion runs, version test runs, and activations for
/// the same source all contend on this so only one is in flight at a time;
/// operations on different sources proceed concurrently.
#[derive(Clone, Default)]
pub struct SourceLocks {
    in_flight: Arc<Mutex<HashSet<Uuid>>>,
}

impl SourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lease for a source, or fails with Conflict if another
    /// operation holds it. Callers should retry later rather than treat
    /// this as corruption.
    pub fn try_acquire(&self, source_id: Uuid, operation: &str) -> Result<SourceLease> {
        let mut in_flight = self.in_flight.lock().unwrap();
        if !in_flight.insert(source_id) {
            return Err(PipelineError::Conflict(format!(
                "{} already in progress for source {}",
                operation, source_id
            )));
        }
        Ok(SourceLease {
            source_id,
            locks: Arc::clone(&self.in_flight),
        })
    }
}

/// Releases the lease on drop.
#[derive(Debug)]
pub struct SourceLease {
    source_id: Uuid,
    locks: Arc<Mutex<HashSet<Uuid>>>,
}

impl Drop for SourceLease {
    fn drop(&mut self) {
        self.locks.lock().unwrap().remove(&self.source_id);
    }
}
