//! Deadlock analysis
//!
//! Asks the facility which threads sit in a circular wait and resolves each
//! reported id to a full record. A facility that cannot detect deadlocks
//! yields an empty set, same as one that found none.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use crate::core::{CancellationToken, DeadlockSet, DetailFlags, Result, ThreadFacility};

#[derive(Debug, Clone, Default)]
pub struct DeadlockAnalyzer {
    cancel: CancellationToken,
}

impl DeadlockAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn find_deadlocked(&self, facility: &dyn ThreadFacility) -> Result<DeadlockSet> {
        self.cancel.check()?;
        let ids = match facility.find_deadlocked()? {
            None => {
                debug!("facility does not support deadlock detection");
                return Ok(DeadlockSet::empty());
            }
            Some(ids) if ids.is_empty() => return Ok(DeadlockSet::empty()),
            Some(ids) => {
                let mut seen = HashSet::with_capacity(ids.len());
                ids.into_iter().filter(|id| seen.insert(*id)).collect::<Vec<_>>()
            }
        };

        let mut threads = Vec::with_capacity(ids.len());
        for &id in &ids {
            self.cancel.check()?;
            match facility.thread_info(id, DetailFlags::all())? {
                Some(record) => threads.push(record),
                None => debug!(thread = id, "deadlocked thread vanished before it was resolved"),
            }
        }

        warn!(threads = ids.len(), "deadlock detected");
        info!(resolved = threads.len(), "deadlocked threads resolved");
        Ok(DeadlockSet::new(ids, threads))
    }
}
