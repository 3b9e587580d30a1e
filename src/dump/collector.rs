//! Thread snapshot collection
//!
//! A collection pass first asks the facility for the ids of every live
//! thread, then queries each id for its details. The per-id queries are
//! independent and run on a rayon pool; results are put back into id-set
//! order before the snapshot is built.
//!
//! The target keeps running while this happens. A thread that exits between
//! the enumeration and its detail query is left out of the snapshot, so a
//! snapshot can hold fewer records than the id set had ids. Any other
//! failure, including cancellation, discards everything gathered so far.

use std::collections::HashSet;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::core::{
    CancellationToken, DetailFlags, Result, Snapshot, ThreadFacility, ThreadId, ThreadRecord,
};

/// Options for a collection pass
#[derive(Debug, Clone, Default)]
pub struct CollectOptions {
    /// Worker threads for per-thread queries; `None` uses rayon's global pool
    pub jobs: Option<usize>,
}

/// Captures [`Snapshot`]s from a [`ThreadFacility`]
#[derive(Debug, Clone, Default)]
pub struct SnapshotCollector {
    options: CollectOptions,
    cancel: CancellationToken,
}

impl SnapshotCollector {
    pub fn new(options: CollectOptions) -> Self {
        Self {
            options,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Take a snapshot of every live thread
    pub fn collect(&self, facility: &dyn ThreadFacility) -> Result<Snapshot> {
        self.cancel.check()?;
        let runtime = facility.runtime_label()?;

        self.cancel.check()?;
        let ids = dedup_ids(facility.live_thread_ids()?);
        debug!(threads = ids.len(), "enumerated live threads");

        let details = self.query_details(facility, &ids)?;

        let mut records = Vec::with_capacity(ids.len());
        for (id, detail) in ids.iter().zip(details) {
            match detail {
                Some(record) => records.push(record),
                None => debug!(thread = id, "thread exited before its details were read"),
            }
        }

        let omitted = ids.len() - records.len();
        info!(
            runtime = %runtime,
            threads = records.len(),
            omitted,
            "snapshot collected"
        );

        Ok(Snapshot::new(runtime, records))
    }

    /// Query every id, keeping id order
    fn query_details(
        &self,
        facility: &dyn ThreadFacility,
        ids: &[ThreadId],
    ) -> Result<Vec<Option<ThreadRecord>>> {
        let query = || -> Result<Vec<Option<ThreadRecord>>> {
            ids.par_iter()
                .map(|&id| {
                    self.cancel.check()?;
                    facility.thread_info(id, DetailFlags::all())
                })
                .collect()
        };

        match self.options.jobs {
            Some(jobs) => match rayon::ThreadPoolBuilder::new()
                .num_threads(jobs.max(1))
                .thread_name(|i| format!("threadsnap-query-{}", i))
                .build()
            {
                Ok(pool) => pool.install(query),
                Err(e) => {
                    warn!(jobs, error = %e, "cannot build query pool, using the global pool");
                    query()
                }
            },
            None => query(),
        }
    }
}

/// Drop repeated ids, keeping the first occurrence
fn dedup_ids(ids: Vec<ThreadId>) -> Vec<ThreadId> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}
