//! Queries over a captured snapshot
//!
//! Pure reads, no remote calls. "Pattern" matching is plain substring
//! containment, not a regular expression.

use super::thread::{Snapshot, ThreadId, ThreadRecord};

/// Number of threads named exactly `name`
pub fn count_by_exact_name(snapshot: &Snapshot, name: &str) -> usize {
    snapshot.iter().filter(|r| r.name == name).count()
}

/// Number of threads whose name contains `pattern`
pub fn count_by_pattern(snapshot: &Snapshot, pattern: &str) -> usize {
    snapshot.iter().filter(|r| r.name.contains(pattern)).count()
}

/// Record for thread `id`, if it is in the snapshot
pub fn lookup(snapshot: &Snapshot, id: ThreadId) -> Option<&ThreadRecord> {
    snapshot.iter().find(|r| r.id == id)
}
