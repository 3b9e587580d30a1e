//! Linux procfs provider
//!
//! Exposes the OS threads of any readable process as a thread facility named
//! `os:type=Threading,pid=<pid>`. Thread names and states come from
//! `/proc/<pid>/task/<tid>/stat`, stacks from `/proc/<pid>/task/<tid>/stack`.
//! The kernel stack file is root-only on most systems; without access a
//! single frame is built from `wchan` instead.
//!
//! The kernel reports no lock ownership, so deadlock detection is
//! unsupported here.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use procfs::process::Process;
use procfs::{ProcError, ProcResult};
use tracing::{debug, warn};

use crate::core::{
    selects, DetailFlags, EndpointAddress, Error, FacilityName, Invocation, ManagementChannel,
    ProcessAttacher, QueryFilter, Reply, Result, StackFrame, ThreadId, ThreadRecord, ThreadState,
};

pub const PROCFS_SCHEME: &str = "procfs";

/// Label printed in front of `Thread.State`
pub const RUNTIME_LABEL: &str = "linux";

/// Declaring context of kernel stack frames
const KERNEL_CONTEXT: &str = "kernel";

/// Convert a Linux task state character to a thread state
fn convert_thread_state(state: char) -> ThreadState {
    match state {
        'R' => ThreadState::Runnable,
        'W' => ThreadState::Runnable, // Waking / paging
        'D' => ThreadState::Blocked,  // Uninterruptible wait
        'S' => ThreadState::Waiting,
        'I' => ThreadState::Waiting, // Idle kernel thread
        'T' | 't' => ThreadState::Waiting,
        'P' => ThreadState::Waiting, // Parked
        'Z' => ThreadState::Terminated,
        'X' | 'x' => ThreadState::Terminated,
        _ => ThreadState::Waiting,
    }
}

/// Did this error come from a task or process that no longer exists
fn is_gone(err: &ProcError) -> bool {
    match err {
        ProcError::NotFound(_) => true,
        ProcError::Io(e, _) => e.raw_os_error() == Some(libc::ESRCH),
        _ => false,
    }
}

/// Sorted ids of the tasks in a directory walk
///
/// Tasks that exit during the walk are skipped, any other error fails it.
fn live_task_ids(tasks: impl IntoIterator<Item = ProcResult<i32>>) -> ProcResult<Vec<ThreadId>> {
    let mut ids = Vec::new();
    for task in tasks {
        match task {
            Ok(tid) => ids.push(tid as ThreadId),
            Err(e) if is_gone(&e) => debug!(error = %e, "task exited during walk"),
            Err(e) => return Err(e),
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Facility name of the threads of `pid`
pub fn facility_name(pid: u32) -> Result<FacilityName> {
    FacilityName::parse(&format!("os:type=Threading,pid={}", pid))
}

/// Attacher for local processes readable through /proc
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsAttacher;

impl ProcessAttacher for ProcfsAttacher {
    fn published_address(&self, pid: u32) -> Result<Option<EndpointAddress>> {
        let raw = i32::try_from(pid).map_err(|_| Error::Attach {
            pid,
            message: "pid out of range".into(),
        })?;

        match kill(Pid::from_raw(raw), None) {
            Ok(()) => {}
            // Exists, owned by someone else; /proc may still be readable
            Err(Errno::EPERM) => debug!(pid, "process not signalable, trying /proc anyway"),
            Err(Errno::ESRCH) => {
                return Err(Error::Attach {
                    pid,
                    message: "no such process".into(),
                })
            }
            Err(e) => {
                return Err(Error::Attach {
                    pid,
                    message: e.to_string(),
                })
            }
        }

        let process = Process::new(raw).map_err(|e| Error::Attach {
            pid,
            message: e.to_string(),
        })?;
        process.stat().map_err(|e| Error::Attach {
            pid,
            message: format!("cannot read /proc/{}/stat: {}", pid, e),
        })?;

        Ok(Some(EndpointAddress::new(PROCFS_SCHEME, pid.to_string())))
    }

    /// /proc needs no agent
    fn bootstrap_management_agent(&self, _pid: u32) -> Result<()> {
        Ok(())
    }
}

/// Open a procfs endpoint
pub fn open_channel(address: &EndpointAddress) -> Result<Box<dyn ManagementChannel>> {
    if address.scheme() != PROCFS_SCHEME {
        return Err(Error::connection(format!(
            "protocol mismatch: `{}` is not a procfs endpoint",
            address
        )));
    }
    let target: u32 = address
        .target()
        .parse()
        .map_err(|_| Error::connection(format!("invalid procfs endpoint `{}`", address)))?;
    let pid = i32::try_from(target)
        .map_err(|_| Error::connection(format!("invalid procfs endpoint `{}`", address)))?;
    let facility = facility_name(target)?;

    let channel = ProcfsChannel {
        pid,
        identity: address.to_string(),
        facility,
        closed: AtomicBool::new(false),
        stack_warned: AtomicBool::new(false),
    };
    channel.process()?;
    Ok(Box::new(channel))
}

pub struct ProcfsChannel {
    pid: i32,
    identity: String,
    facility: FacilityName,
    closed: AtomicBool,
    /// Set once the "no kernel stack access" warning was logged
    stack_warned: AtomicBool,
}

impl ProcfsChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::connection(format!("channel {} is closed", self.identity)))
        } else {
            Ok(())
        }
    }

    fn process(&self) -> Result<Process> {
        Process::new(self.pid).map_err(|e| self.lost(e))
    }

    fn lost(&self, err: ProcError) -> Error {
        if is_gone(&err) {
            Error::connection(format!("process {} exited", self.pid))
        } else {
            Error::connection(format!("{}: {}", self.identity, err))
        }
    }

    fn thread_ids(&self) -> Result<Vec<ThreadId>> {
        let tasks = self.process()?.tasks().map_err(|e| self.lost(e))?;
        live_task_ids(tasks.map(|task| task.map(|t| t.tid))).map_err(|e| self.lost(e))
    }

    fn thread_info(&self, id: ThreadId, detail: DetailFlags) -> Result<Option<ThreadRecord>> {
        let Ok(tid) = i32::try_from(id) else {
            return Ok(None);
        };

        let task = match self.process()?.task_from_tid(tid) {
            Ok(task) => task,
            Err(e) if is_gone(&e) => return Ok(None),
            Err(e) => return Err(self.lost(e)),
        };
        let stat = match task.stat() {
            Ok(stat) => stat,
            Err(e) if is_gone(&e) => return Ok(None),
            Err(e) => return Err(self.lost(e)),
        };

        let mut record = ThreadRecord::new(id, stat.comm, convert_thread_state(stat.state));

        if detail.contains(DetailFlags::STACK) {
            match read_kernel_stack(self.pid, tid) {
                Ok(frames) => record.stack_frames = frames,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
                Err(e) => {
                    if !self.stack_warned.swap(true, Ordering::Relaxed) {
                        warn!(
                            pid = self.pid,
                            error = %e,
                            "kernel stacks unreadable, falling back to wchan"
                        );
                    }
                    record.stack_frames = read_wchan(self.pid, tid).into_iter().collect();
                }
            }
        }

        Ok(Some(record))
    }
}

impl ManagementChannel for ProcfsChannel {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn query_names(
        &self,
        pattern: &FacilityName,
        filter: Option<&QueryFilter>,
    ) -> Result<BTreeSet<FacilityName>> {
        self.ensure_open()?;
        let mut names = BTreeSet::new();
        if selects(pattern, filter, &self.facility) {
            names.insert(self.facility.clone());
        }
        Ok(names)
    }

    fn invoke(&self, name: &FacilityName, invocation: &Invocation) -> Result<Reply> {
        self.ensure_open()?;
        if name != &self.facility {
            return Err(Error::NotFound(format!(
                "{} is not registered on {}",
                name, self.identity
            )));
        }

        match invocation {
            Invocation::RuntimeLabel => Ok(Reply::RuntimeLabel(RUNTIME_LABEL.to_string())),
            Invocation::AllThreadIds => self.thread_ids().map(Reply::ThreadIds),
            Invocation::ThreadInfo { id, detail } => {
                self.thread_info(*id, *detail).map(Reply::ThreadInfo)
            }
            Invocation::FindDeadlocked => Ok(Reply::Deadlocked(None)),
        }
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn read_kernel_stack(pid: i32, tid: i32) -> io::Result<Vec<StackFrame>> {
    let content = fs::read_to_string(format!("/proc/{}/task/{}/stack", pid, tid))?;
    Ok(content.lines().filter_map(parse_stack_line).collect())
}

/// Parse a kernel stack line like `[<0>] do_wait+0x1b2/0x2c0`
fn parse_stack_line(line: &str) -> Option<StackFrame> {
    let symbol = match line.split_once("] ") {
        Some((_, symbol)) => symbol.trim(),
        None => line.trim(),
    };
    if symbol.is_empty() {
        return None;
    }

    Some(match symbol.split_once('+') {
        Some((operation, offset)) => {
            StackFrame::new(KERNEL_CONTEXT, operation).with_location(format!("+{}", offset))
        }
        None => StackFrame::new(KERNEL_CONTEXT, symbol),
    })
}

/// Single frame for the kernel function the thread sleeps in, if any
fn read_wchan(pid: i32, tid: i32) -> Option<StackFrame> {
    let wchan = fs::read_to_string(format!("/proc/{}/task/{}/wchan", pid, tid)).ok()?;
    let wchan = wchan.trim();
    if wchan.is_empty() || wchan == "0" {
        None
    } else {
        Some(StackFrame::new(KERNEL_CONTEXT, wchan))
    }
}
