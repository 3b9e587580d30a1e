//! Thread-management facilities
//!
//! [`ThreadFacility`] is the typed capability the collector and the deadlock
//! analyzer work against. [`FacilityHandle`] implements it on top of a
//! [`ManagementChannel`] and a resolved facility name; [`resolve`] and
//! [`resolve_all`] find those names.

use std::collections::BTreeSet;

use tracing::debug;

use super::channel::{DetailFlags, Invocation, ManagementChannel, Reply};
use super::error::{Error, Result};
use super::name::{FacilityName, QueryFilter};
use super::thread::{ThreadId, ThreadRecord};

/// Default facility pattern: any runtime's threading facility
pub const DEFAULT_FACILITY_PATTERN: &str = "*:type=Threading,*";

/// Remote thread-introspection service of one runtime instance
pub trait ThreadFacility: Sync {
    /// Label printed in front of `Thread.State` in dumps
    fn runtime_label(&self) -> Result<String>;

    /// Ids of all live threads, in the facility's enumeration order
    fn live_thread_ids(&self) -> Result<Vec<ThreadId>>;

    /// Details of one thread; `None` if it no longer exists
    fn thread_info(&self, id: ThreadId, detail: DetailFlags) -> Result<Option<ThreadRecord>>;

    /// Threads in a circular wait; `None` if detection is unsupported
    fn find_deadlocked(&self) -> Result<Option<Vec<ThreadId>>>;
}

/// A resolved facility on an open channel
///
/// Borrows the channel: the handle is only usable while the channel is open.
#[derive(Clone, Copy)]
pub struct FacilityHandle<'c> {
    channel: &'c dyn ManagementChannel,
    name: &'c FacilityName,
}

impl<'c> FacilityHandle<'c> {
    pub fn new(channel: &'c dyn ManagementChannel, name: &'c FacilityName) -> Self {
        Self { channel, name }
    }

    pub fn name(&self) -> &FacilityName {
        self.name
    }

    pub fn channel_identity(&self) -> &str {
        self.channel.identity()
    }

    fn call(&self, invocation: Invocation) -> Result<Reply> {
        self.channel.invoke(self.name, &invocation)
    }

    fn mismatch(&self, invocation: &str, reply: &Reply) -> Error {
        Error::connection(format!(
            "protocol mismatch on {} ({}): {} answered with {}",
            self.name,
            self.channel.identity(),
            invocation,
            reply.kind()
        ))
    }
}

impl std::fmt::Debug for FacilityHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FacilityHandle")
            .field("channel", &self.channel.identity())
            .field("name", &self.name.canonical())
            .finish()
    }
}

impl ThreadFacility for FacilityHandle<'_> {
    fn runtime_label(&self) -> Result<String> {
        match self.call(Invocation::RuntimeLabel)? {
            Reply::RuntimeLabel(label) => Ok(label),
            other => Err(self.mismatch("RuntimeLabel", &other)),
        }
    }

    fn live_thread_ids(&self) -> Result<Vec<ThreadId>> {
        match self.call(Invocation::AllThreadIds)? {
            Reply::ThreadIds(ids) => Ok(ids),
            other => Err(self.mismatch("AllThreadIds", &other)),
        }
    }

    fn thread_info(&self, id: ThreadId, detail: DetailFlags) -> Result<Option<ThreadRecord>> {
        match self.call(Invocation::ThreadInfo { id, detail })? {
            Reply::ThreadInfo(Some(record)) if record.id != id => Err(Error::connection(format!(
                "protocol mismatch on {}: asked for thread {}, got {}",
                self.name, id, record.id
            ))),
            Reply::ThreadInfo(record) => Ok(record),
            other => Err(self.mismatch("ThreadInfo", &other)),
        }
    }

    fn find_deadlocked(&self) -> Result<Option<Vec<ThreadId>>> {
        match self.call(Invocation::FindDeadlocked)? {
            Reply::Deadlocked(ids) => Ok(ids),
            other => Err(self.mismatch("FindDeadlocked", &other)),
        }
    }
}

/// All facility names matching `pattern` and `filter`
pub fn resolve_all(
    channel: &dyn ManagementChannel,
    pattern: &str,
    filter: Option<&QueryFilter>,
) -> Result<BTreeSet<FacilityName>> {
    let pattern = FacilityName::parse(pattern)?;
    let names = channel.query_names(&pattern, filter)?;
    debug!(
        channel = channel.identity(),
        %pattern,
        matches = names.len(),
        "facility query"
    );
    Ok(names)
}

/// First facility name matching `pattern` and `filter`, or `None`
///
/// Names come back ordered, so "first" is the lowest canonical name.
pub fn resolve(
    channel: &dyn ManagementChannel,
    pattern: &str,
    filter: Option<&QueryFilter>,
) -> Result<Option<FacilityName>> {
    Ok(resolve_all(channel, pattern, filter)?.into_iter().next())
}
