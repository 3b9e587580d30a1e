//! In-process management host
//!
//! `MemoryHost` plays the part of a set of running processes, each exposing
//! thread facilities through `memory://<pid>` endpoints. Thread tables are
//! shared and can be changed while channels are open, which is how tests
//! drive thread churn, lock cycles and process exit.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard};

use tracing::{debug, info};

use crate::core::{
    selects, ChannelProvider, DetailFlags, EndpointAddress, Error, FacilityName, Invocation,
    ManagementChannel, ProcessAttacher, QueryFilter, Reply, Result, ThreadId, ThreadRecord,
    ThreadState, WaitGraph,
};

pub const MEMORY_SCHEME: &str = "memory";

/// Thread table shared between the host and its channels
pub type SharedTable = Arc<RwLock<ThreadTable>>;

/// Live threads of one facility, in registration order
#[derive(Debug, Clone, Default)]
pub struct ThreadTable {
    runtime: String,
    threads: Vec<ThreadRecord>,
}

impl ThreadTable {
    pub fn new(runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            threads: Vec::new(),
        }
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    /// Add a thread, replacing any thread with the same id
    pub fn spawn(&mut self, record: ThreadRecord) {
        match self.threads.iter_mut().find(|t| t.id == record.id) {
            Some(existing) => *existing = record,
            None => self.threads.push(record),
        }
    }

    pub fn update(&mut self, id: ThreadId, f: impl FnOnce(&mut ThreadRecord)) -> bool {
        match self.threads.iter_mut().find(|t| t.id == id) {
            Some(thread) => {
                f(thread);
                true
            }
            None => false,
        }
    }

    /// Block `id` on a lock held by `owner`
    pub fn block_on(&mut self, id: ThreadId, owner: ThreadId) -> bool {
        self.update(id, |t| {
            t.state = ThreadState::Blocked;
            t.lock_owner = Some(owner);
        })
    }

    pub fn release(&mut self, id: ThreadId) -> bool {
        self.update(id, |t| {
            t.state = ThreadState::Runnable;
            t.lock_owner = None;
        })
    }

    /// Remove a thread; it no longer shows up in queries
    pub fn terminate(&mut self, id: ThreadId) -> Option<ThreadRecord> {
        let index = self.threads.iter().position(|t| t.id == id)?;
        Some(self.threads.remove(index))
    }

    pub fn get(&self, id: ThreadId) -> Option<&ThreadRecord> {
        self.threads.iter().find(|t| t.id == id)
    }

    pub fn ids(&self) -> Vec<ThreadId> {
        self.threads.iter().map(|t| t.id).collect()
    }

    pub fn records(&self) -> &[ThreadRecord] {
        &self.threads
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

#[derive(Debug)]
struct HostedProcess {
    published: bool,
    bootstrappable: bool,
    alive: Arc<AtomicBool>,
    open_channels: Arc<AtomicUsize>,
    facilities: BTreeMap<FacilityName, SharedTable>,
}

impl HostedProcess {
    fn new() -> Self {
        Self {
            published: true,
            bootstrappable: true,
            alive: Arc::new(AtomicBool::new(true)),
            open_channels: Arc::new(AtomicUsize::new(0)),
            facilities: BTreeMap::new(),
        }
    }
}

/// Simulated processes reachable through `memory://<pid>`
#[derive(Debug, Default)]
pub struct MemoryHost {
    processes: RwLock<HashMap<u32, HostedProcess>>,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a facility on `pid`, creating the process if needed.
    /// Registering a name twice returns the existing table.
    pub fn add_facility(&self, pid: u32, name: &str, runtime: &str) -> Result<SharedTable> {
        let name = FacilityName::parse(name)?;
        if name.is_pattern() {
            return Err(Error::malformed(
                name.canonical(),
                "a pattern cannot be registered as a facility",
            ));
        }

        let mut processes = self
            .processes
            .write()
            .map_err(|_| Error::connection("memory host state poisoned"))?;
        let process = processes.entry(pid).or_insert_with(HostedProcess::new);
        let table = process
            .facilities
            .entry(name)
            .or_insert_with(|| Arc::new(RwLock::new(ThreadTable::new(runtime))));
        Ok(Arc::clone(table))
    }

    /// Whether `pid` publishes its endpoint without a bootstrap
    pub fn set_published(&self, pid: u32, published: bool) {
        if let Ok(mut processes) = self.processes.write() {
            if let Some(process) = processes.get_mut(&pid) {
                process.published = published;
            }
        }
    }

    /// Whether loading the management agent into `pid` succeeds
    pub fn set_bootstrappable(&self, pid: u32, bootstrappable: bool) {
        if let Ok(mut processes) = self.processes.write() {
            if let Some(process) = processes.get_mut(&pid) {
                process.bootstrappable = bootstrappable;
            }
        }
    }

    /// Simulate process exit; open channels start failing
    pub fn exit(&self, pid: u32) {
        if let Ok(mut processes) = self.processes.write() {
            if let Some(process) = processes.remove(&pid) {
                process.alive.store(false, Ordering::SeqCst);
                info!(pid, "memory process exited");
            }
        }
    }

    /// Channels opened to `pid` and not yet closed
    pub fn open_channels(&self, pid: u32) -> usize {
        self.processes
            .read()
            .ok()
            .and_then(|p| {
                p.get(&pid)
                    .map(|process| process.open_channels.load(Ordering::SeqCst))
            })
            .unwrap_or(0)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<u32, HostedProcess>>> {
        self.processes
            .read()
            .map_err(|_| Error::connection("memory host state poisoned"))
    }
}

impl ProcessAttacher for MemoryHost {
    fn published_address(&self, pid: u32) -> Result<Option<EndpointAddress>> {
        let processes = self.read()?;
        let process = processes.get(&pid).ok_or_else(|| Error::Attach {
            pid,
            message: "no such process".into(),
        })?;
        Ok(process
            .published
            .then(|| EndpointAddress::new(MEMORY_SCHEME, pid.to_string())))
    }

    fn bootstrap_management_agent(&self, pid: u32) -> Result<()> {
        let mut processes = self
            .processes
            .write()
            .map_err(|_| Error::connection("memory host state poisoned"))?;
        let process = processes.get_mut(&pid).ok_or_else(|| Error::Attach {
            pid,
            message: "no such process".into(),
        })?;

        if process.published {
            return Ok(());
        }
        if !process.bootstrappable {
            return Err(Error::Attach {
                pid,
                message: "management agent could not be loaded".into(),
            });
        }
        process.published = true;
        debug!(pid, "management agent loaded");
        Ok(())
    }
}

impl ChannelProvider for MemoryHost {
    fn open(&self, address: &EndpointAddress) -> Result<Box<dyn ManagementChannel>> {
        if address.scheme() != MEMORY_SCHEME {
            return Err(Error::connection(format!(
                "protocol mismatch: cannot open `{}` with the memory provider",
                address
            )));
        }
        let pid: u32 = address
            .target()
            .parse()
            .map_err(|_| Error::connection(format!("invalid memory endpoint `{}`", address)))?;

        let processes = self.read()?;
        let process = processes
            .get(&pid)
            .filter(|p| p.published)
            .ok_or_else(|| Error::connection(format!("endpoint `{}` is unreachable", address)))?;

        process.open_channels.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryChannel {
            identity: address.to_string(),
            facilities: process.facilities.clone(),
            alive: Arc::clone(&process.alive),
            open_channels: Arc::clone(&process.open_channels),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Channel into one [`MemoryHost`] process
pub struct MemoryChannel {
    identity: String,
    facilities: BTreeMap<FacilityName, SharedTable>,
    alive: Arc<AtomicBool>,
    open_channels: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::connection(format!("channel {} is closed", self.identity)));
        }
        if !self.alive.load(Ordering::SeqCst) {
            return Err(Error::connection(format!(
                "channel {} dropped: process exited",
                self.identity
            )));
        }
        Ok(())
    }
}

impl ManagementChannel for MemoryChannel {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn query_names(
        &self,
        pattern: &FacilityName,
        filter: Option<&QueryFilter>,
    ) -> Result<BTreeSet<FacilityName>> {
        self.ensure_open()?;
        Ok(self
            .facilities
            .keys()
            .filter(|n| selects(pattern, filter, n))
            .cloned()
            .collect())
    }

    fn invoke(&self, name: &FacilityName, invocation: &Invocation) -> Result<Reply> {
        self.ensure_open()?;
        let table = self.facilities.get(name).ok_or_else(|| {
            Error::NotFound(format!("{} is not registered on {}", name, self.identity))
        })?;
        let table = table
            .read()
            .map_err(|_| Error::connection("thread table poisoned"))?;

        let reply = match invocation {
            Invocation::RuntimeLabel => Reply::RuntimeLabel(table.runtime().to_string()),
            Invocation::AllThreadIds => Reply::ThreadIds(table.ids()),
            Invocation::ThreadInfo { id, detail } => {
                Reply::ThreadInfo(table.get(*id).cloned().map(|mut record| {
                    if !detail.contains(DetailFlags::STACK) {
                        record.stack_frames.clear();
                    }
                    record
                }))
            }
            Invocation::FindDeadlocked => {
                Reply::Deadlocked(Some(WaitGraph::from_records(table.records()).deadlocked()))
            }
        };
        Ok(reply)
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.open_channels.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        resolve_endpoint, CancellationToken, FacilityHandle, StackFrame, ThreadFacility,
    };
    use crate::dump::{CollectOptions, DeadlockAnalyzer, SnapshotCollector};

    const THREADING: &str = "java.lang:type=Threading";

    fn threading() -> FacilityName {
        FacilityName::parse(THREADING).unwrap()
    }

    fn open(host: &MemoryHost, pid: u32) -> Box<dyn ManagementChannel> {
        let address = resolve_endpoint(host, pid).unwrap();
        host.open(&address).unwrap()
    }

    // ==================== ThreadTable Tests ====================

    #[test]
    fn test_table_spawn_replaces_same_id() {
        let mut table = ThreadTable::new("java.lang");
        table.spawn(ThreadRecord::new(1, "main", ThreadState::Runnable));
        table.spawn(ThreadRecord::new(2, "worker", ThreadState::Waiting));
        table.spawn(ThreadRecord::new(1, "main", ThreadState::Blocked));

        assert_eq!(table.ids(), vec![1, 2]);
        assert_eq!(table.get(1).unwrap().state, ThreadState::Blocked);
    }

    #[test]
    fn test_table_block_release_terminate() {
        let mut table = ThreadTable::new("java.lang");
        table.spawn(ThreadRecord::new(1, "a", ThreadState::Runnable));

        assert!(table.block_on(1, 2));
        assert!(table.get(1).unwrap().is_blocked_on_lock());
        assert!(table.release(1));
        assert!(!table.get(1).unwrap().is_blocked_on_lock());
        assert!(!table.block_on(9, 1));

        assert_eq!(table.terminate(1).unwrap().name, "a");
        assert!(table.terminate(1).is_none());
        assert!(table.is_empty());
    }

    // ==================== Attach Tests ====================

    #[test]
    fn test_attach_unknown_process() {
        let host = MemoryHost::new();
        assert!(matches!(
            resolve_endpoint(&host, 3),
            Err(Error::Attach { pid: 3, .. })
        ));
    }

    #[test]
    fn test_bootstrap_publishes_endpoint() {
        let host = MemoryHost::new();
        host.add_facility(5, THREADING, "java.lang").unwrap();
        host.set_published(5, false);

        assert_eq!(host.published_address(5).unwrap(), None);
        let address = resolve_endpoint(&host, 5).unwrap();
        assert_eq!(address.to_string(), "memory://5");
        // Idempotent once loaded
        host.bootstrap_management_agent(5).unwrap();
    }

    #[test]
    fn test_bootstrap_failure_is_attach_error() {
        let host = MemoryHost::new();
        host.add_facility(5, THREADING, "java.lang").unwrap();
        host.set_published(5, false);
        host.set_bootstrappable(5, false);

        assert!(matches!(
            resolve_endpoint(&host, 5),
            Err(Error::Attach { pid: 5, .. })
        ));
    }

    #[test]
    fn test_pattern_cannot_be_registered() {
        let host = MemoryHost::new();
        assert!(matches!(
            host.add_facility(1, "java.lang:type=*", "java.lang"),
            Err(Error::MalformedQuery { .. })
        ));
    }

    // ==================== Channel Tests ====================

    #[test]
    fn test_open_rejects_other_schemes() {
        let host = MemoryHost::new();
        host.add_facility(1, THREADING, "java.lang").unwrap();
        let address = EndpointAddress::new("procfs", "1");
        assert!(matches!(host.open(&address), Err(Error::Connection(_))));
    }

    #[test]
    fn test_query_names_and_close() {
        let host = MemoryHost::new();
        host.add_facility(1, THREADING, "java.lang").unwrap();
        host.add_facility(1, "java.lang:type=Memory", "java.lang").unwrap();

        let channel = open(&host, 1);
        assert_eq!(host.open_channels(1), 1);

        let pattern = FacilityName::parse("*:type=Threading,*").unwrap();
        let names = channel.query_names(&pattern, None).unwrap();
        assert_eq!(names.into_iter().collect::<Vec<_>>(), vec![threading()]);

        channel.close().unwrap();
        channel.close().unwrap();
        assert_eq!(host.open_channels(1), 0);
        assert!(matches!(
            channel.query_names(&pattern, None),
            Err(Error::Connection(_))
        ));
    }

    #[test]
    fn test_invoke_unregistered_name() {
        let host = MemoryHost::new();
        host.add_facility(1, THREADING, "java.lang").unwrap();
        let channel = open(&host, 1);

        let missing = FacilityName::parse("java.lang:type=Memory").unwrap();
        assert!(matches!(
            channel.invoke(&missing, &Invocation::AllThreadIds),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_thread_info_detail_flags() {
        let host = MemoryHost::new();
        let table = host.add_facility(1, THREADING, "java.lang").unwrap();
        table.write().unwrap().spawn(
            ThreadRecord::new(1, "main", ThreadState::Runnable)
                .with_frames(vec![StackFrame::from_qualified("App.main")]),
        );
        let channel = open(&host, 1);
        let name = threading();
        let handle = FacilityHandle::new(channel.as_ref(), &name);

        let full = handle.thread_info(1, DetailFlags::all()).unwrap().unwrap();
        assert_eq!(full.stack_frames.len(), 1);
        let bare = handle.thread_info(1, DetailFlags::empty()).unwrap().unwrap();
        assert!(bare.stack_frames.is_empty());
        assert!(handle.thread_info(2, DetailFlags::all()).unwrap().is_none());
    }

    // ==================== Live Mutation Tests ====================

    #[test]
    fn test_terminated_thread_vanishes_from_channel() {
        let host = MemoryHost::new();
        let table = host.add_facility(1, THREADING, "java.lang").unwrap();
        {
            let mut t = table.write().unwrap();
            t.spawn(ThreadRecord::new(1, "main", ThreadState::Runnable));
            t.spawn(ThreadRecord::new(2, "short-lived", ThreadState::Runnable));
        }
        let channel = open(&host, 1);
        let name = threading();
        let handle = FacilityHandle::new(channel.as_ref(), &name);

        let ids = handle.live_thread_ids().unwrap();
        assert_eq!(ids, vec![1, 2]);
        table.write().unwrap().terminate(2);
        assert!(handle.thread_info(2, DetailFlags::all()).unwrap().is_none());
        assert!(handle.thread_info(1, DetailFlags::all()).unwrap().is_some());
    }

    #[test]
    fn test_lock_cycle_appears_and_clears() {
        let host = MemoryHost::new();
        let table = host.add_facility(1, THREADING, "java.lang").unwrap();
        {
            let mut t = table.write().unwrap();
            t.spawn(ThreadRecord::new(10, "A", ThreadState::Runnable));
            t.spawn(ThreadRecord::new(20, "B", ThreadState::Runnable));
        }
        let channel = open(&host, 1);
        let name = threading();
        let handle = FacilityHandle::new(channel.as_ref(), &name);
        let analyzer = DeadlockAnalyzer::new();

        assert!(analyzer.find_deadlocked(&handle).unwrap().is_empty());

        {
            let mut t = table.write().unwrap();
            t.block_on(10, 20);
            t.block_on(20, 10);
        }
        let set = analyzer.find_deadlocked(&handle).unwrap();
        assert_eq!(set.ids(), &[10, 20]);
        assert_eq!(set.threads().len(), 2);

        table.write().unwrap().release(20);
        assert!(analyzer.find_deadlocked(&handle).unwrap().is_empty());
    }

    #[test]
    fn test_process_exit_drops_channel() {
        let host = MemoryHost::new();
        let table = host.add_facility(1, THREADING, "java.lang").unwrap();
        table
            .write()
            .unwrap()
            .spawn(ThreadRecord::new(1, "main", ThreadState::Runnable));
        let channel = open(&host, 1);
        let name = threading();
        let handle = FacilityHandle::new(channel.as_ref(), &name);

        host.exit(1);

        let result = SnapshotCollector::new(CollectOptions::default())
            .with_cancellation(CancellationToken::new())
            .collect(&handle);
        assert!(matches!(result, Err(Error::Connection(_))));
        assert!(matches!(
            host.published_address(1),
            Err(Error::Attach { .. })
        ));
    }
}
