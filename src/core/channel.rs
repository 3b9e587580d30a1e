//! Management channel boundary
//!
//! The engine never frames wire messages or attaches to processes itself.
//! Providers implement [`ProcessAttacher`] (find or bootstrap a management
//! endpoint for a pid), [`ChannelProvider`] (open an endpoint) and
//! [`ManagementChannel`] (name queries and typed invocations).

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use tracing::{debug, info};

use super::error::{Error, Result};
use super::name::{FacilityName, QueryFilter};
use super::thread::{ThreadId, ThreadRecord};

bitflags! {
    /// Detail requested from a per-thread query
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DetailFlags: u32 {
        /// Full stack trace
        const STACK = 1 << 0;
        /// Monitors held by the thread
        const LOCKED_MONITORS = 1 << 1;
        /// Ownable synchronizers held by the thread
        const LOCKED_SYNCHRONIZERS = 1 << 2;
    }
}

/// Typed remote operation on a thread facility
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    RuntimeLabel,
    AllThreadIds,
    ThreadInfo { id: ThreadId, detail: DetailFlags },
    FindDeadlocked,
}

impl Invocation {
    pub fn operation_name(&self) -> &'static str {
        match self {
            Invocation::RuntimeLabel => "RuntimeLabel",
            Invocation::AllThreadIds => "AllThreadIds",
            Invocation::ThreadInfo { .. } => "ThreadInfo",
            Invocation::FindDeadlocked => "FindDeadlocked",
        }
    }
}

/// Result of an [`Invocation`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    RuntimeLabel(String),
    ThreadIds(Vec<ThreadId>),
    /// `None` when the thread no longer exists
    ThreadInfo(Option<ThreadRecord>),
    /// `None` when the facility cannot detect deadlocks
    Deadlocked(Option<Vec<ThreadId>>),
}

impl Reply {
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::RuntimeLabel(_) => "RuntimeLabel",
            Reply::ThreadIds(_) => "ThreadIds",
            Reply::ThreadInfo(_) => "ThreadInfo",
            Reply::Deadlocked(_) => "Deadlocked",
        }
    }
}

/// Open connection to a process's management endpoint
///
/// Implementations must be safe for concurrent read-only use.
pub trait ManagementChannel: Send + Sync {
    /// Identity of this channel, used in log and error messages
    fn identity(&self) -> &str;

    /// Registered names matching `pattern` and accepted by `filter`
    fn query_names(
        &self,
        pattern: &FacilityName,
        filter: Option<&QueryFilter>,
    ) -> Result<BTreeSet<FacilityName>>;

    /// Issue one typed operation against a registered name
    fn invoke(&self, name: &FacilityName, invocation: &Invocation) -> Result<Reply>;

    /// Close the channel; later calls fail with a connection error
    fn close(&self) -> Result<()>;
}

/// Address of a management endpoint, written `scheme://target`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointAddress {
    scheme: String,
    target: String,
}

impl EndpointAddress {
    pub fn new(scheme: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            target: target.into(),
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn target(&self) -> &str {
        &self.target
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.target)
    }
}

impl FromStr for EndpointAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once("://") {
            Some((scheme, target)) if !scheme.is_empty() && !target.is_empty() => {
                Ok(Self::new(scheme, target))
            }
            _ => Err(Error::connection(format!(
                "invalid endpoint address `{}`",
                s
            ))),
        }
    }
}

/// Finds (or bootstraps) the management endpoint of an OS process
pub trait ProcessAttacher {
    /// Address the process already publishes, if any
    fn published_address(&self, pid: u32) -> Result<Option<EndpointAddress>>;

    /// Load the management agent into the process. A no-op when already loaded.
    fn bootstrap_management_agent(&self, pid: u32) -> Result<()>;
}

/// Opens endpoints into channels
pub trait ChannelProvider {
    fn open(&self, address: &EndpointAddress) -> Result<Box<dyn ManagementChannel>>;
}

/// Resolve the endpoint address of `pid`, bootstrapping the agent if the
/// process does not publish one yet
pub fn resolve_endpoint(attacher: &dyn ProcessAttacher, pid: u32) -> Result<EndpointAddress> {
    if let Some(address) = attacher.published_address(pid)? {
        debug!(pid, %address, "endpoint already published");
        return Ok(address);
    }

    info!(pid, "no published endpoint, bootstrapping management agent");
    attacher.bootstrap_management_agent(pid)?;

    attacher
        .published_address(pid)?
        .ok_or_else(|| Error::Attach {
            pid,
            message: "process does not expose a management endpoint after bootstrap".into(),
        })
}
