//! Thread representation
//!
//! This module contains the captured per-thread state (`ThreadRecord`), the
//! immutable `Snapshot` built from a collection pass and the `DeadlockSet`
//! produced by deadlock detection.

use std::collections::HashSet;
use std::fmt;

/// Thread identifier, unique within one snapshot
pub type ThreadId = u64;

/// Thread state as reported by the facility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadState {
    New,
    Runnable,
    Blocked,
    Waiting,
    TimedWaiting,
    Terminated,
}

impl ThreadState {
    /// Get all thread states
    pub fn all() -> &'static [ThreadState] {
        &[
            ThreadState::New,
            ThreadState::Runnable,
            ThreadState::Blocked,
            ThreadState::Waiting,
            ThreadState::TimedWaiting,
            ThreadState::Terminated,
        ]
    }

    /// Name used in dumps
    pub fn name(self) -> &'static str {
        match self {
            ThreadState::New => "NEW",
            ThreadState::Runnable => "RUNNABLE",
            ThreadState::Blocked => "BLOCKED",
            ThreadState::Waiting => "WAITING",
            ThreadState::TimedWaiting => "TIMED_WAITING",
            ThreadState::Terminated => "TERMINATED",
        }
    }

    /// Parse from dump name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|s| s.name() == name)
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

/// One frame of a captured stack trace
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StackFrame {
    /// Class, module or library the operation belongs to (may be empty)
    pub declaring_context: String,
    pub operation_name: String,
    /// File and line, offset, or similar
    pub source_location: Option<String>,
}

impl StackFrame {
    pub fn new(declaring_context: impl Into<String>, operation_name: impl Into<String>) -> Self {
        Self {
            declaring_context: declaring_context.into(),
            operation_name: operation_name.into(),
            source_location: None,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.source_location = Some(location.into());
        self
    }

    /// Split a qualified name like `pkg.Lock.await` at its last dot
    pub fn from_qualified(qualified: &str) -> Self {
        match qualified.rsplit_once('.') {
            Some((context, operation)) => Self::new(context, operation),
            None => Self::new("", qualified),
        }
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.declaring_context.is_empty() {
            write!(f, "{}.", self.declaring_context)?;
        }
        match &self.source_location {
            Some(location) => write!(f, "{}({})", self.operation_name, location),
            None => write!(f, "{}(Unknown Source)", self.operation_name),
        }
    }
}

/// One thread's captured state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadRecord {
    pub id: ThreadId,
    pub name: String,
    pub state: ThreadState,
    /// Innermost frame first
    pub stack_frames: Vec<StackFrame>,
    /// Thread holding the lock this one is blocked on
    pub lock_owner: Option<ThreadId>,
}

impl ThreadRecord {
    pub fn new(id: ThreadId, name: impl Into<String>, state: ThreadState) -> Self {
        Self {
            id,
            name: name.into(),
            state,
            stack_frames: Vec::new(),
            lock_owner: None,
        }
    }

    pub fn with_frames(mut self, frames: Vec<StackFrame>) -> Self {
        self.stack_frames = frames;
        self
    }

    pub fn with_lock_owner(mut self, owner: ThreadId) -> Self {
        self.lock_owner = Some(owner);
        self
    }

    /// Is this thread blocked waiting on a lock held by another thread
    pub fn is_blocked_on_lock(&self) -> bool {
        self.state == ThreadState::Blocked && self.lock_owner.is_some()
    }
}

/// Immutable, ordered set of thread records from one collection pass
///
/// No two records share an id. Records keep the order they were captured in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    runtime: String,
    records: Vec<ThreadRecord>,
}

impl Snapshot {
    /// Build a snapshot; a record whose id was already seen is dropped
    pub fn new(runtime: impl Into<String>, records: Vec<ThreadRecord>) -> Self {
        let mut seen = HashSet::with_capacity(records.len());
        let records = records.into_iter().filter(|r| seen.insert(r.id)).collect();
        Self {
            runtime: runtime.into(),
            records,
        }
    }

    /// Runtime label printed in front of `Thread.State`
    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    pub fn records(&self) -> &[ThreadRecord] {
        &self.records
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ThreadRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.records.iter().map(|r| r.id)
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = &'a ThreadRecord;
    type IntoIter = std::slice::Iter<'a, ThreadRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// Threads found in a circular wait
///
/// `ids` is what the facility reported; `threads` holds the records those ids
/// resolved to, in the same order. A thread that vanished before it could be
/// resolved has an id but no record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeadlockSet {
    ids: Vec<ThreadId>,
    threads: Vec<ThreadRecord>,
}

impl DeadlockSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(ids: Vec<ThreadId>, threads: Vec<ThreadRecord>) -> Self {
        Self { ids, threads }
    }

    pub fn ids(&self) -> &[ThreadId] {
        &self.ids
    }

    pub fn threads(&self) -> &[ThreadRecord] {
        &self.threads
    }

    pub fn contains(&self, id: ThreadId) -> bool {
        self.ids.contains(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }
}
