//! Dump pipeline
//!
//! Runs the stages for one target process in order:
//! attach, resolve, collect, detect, then write. Every failure comes back as
//! a [`StageError`] naming the pid and the stage. The channel opened during
//! attach is closed before `capture` returns, whatever the outcome.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::collector::{CollectOptions, SnapshotCollector};
use super::deadlock::DeadlockAnalyzer;
use super::format::{self, DumpReport};
use super::sink::DumpSink;
use crate::core::{
    facility, resolve_endpoint, CancellationToken, ChannelProvider, DeadlockSet, EndpointAddress,
    Error, FacilityHandle, FacilityName, ManagementChannel, ProcessAttacher, QueryFilter, Snapshot,
    Stage, StageContext, StageError, DEFAULT_FACILITY_PATTERN,
};

type StageResult<T> = std::result::Result<T, StageError>;

/// What to capture from one process
#[derive(Debug, Clone)]
pub struct DumpRequest {
    pub pid: u32,
    /// Facility name pattern
    pub facility: String,
    pub filter: Option<QueryFilter>,
    /// Capture every matching facility instead of the first
    pub all_facilities: bool,
    pub deadlocks: bool,
    pub collect: CollectOptions,
}

impl DumpRequest {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            facility: DEFAULT_FACILITY_PATTERN.to_string(),
            filter: None,
            all_facilities: false,
            deadlocks: true,
            collect: CollectOptions::default(),
        }
    }
}

/// Snapshot and deadlock result of one facility
#[derive(Debug, Clone)]
pub struct FacilityDump {
    pub facility: FacilityName,
    pub snapshot: Snapshot,
    /// `None` when the deadlock pass was skipped
    pub deadlocks: Option<DeadlockSet>,
}

/// Everything captured from one process
#[derive(Debug, Clone)]
pub struct Capture {
    pub pid: u32,
    pub endpoint: EndpointAddress,
    pub facilities: Vec<FacilityDump>,
}

impl Capture {
    /// Render the capture; several facilities get one header each
    pub fn render(&self) -> DumpReport {
        match self.facilities.as_slice() {
            [single] => format::render(&single.snapshot, single.deadlocks.as_ref()),
            many => format::render_sections(
                many.iter()
                    .map(|d| (&d.facility, &d.snapshot, d.deadlocks.as_ref())),
            ),
        }
    }

    /// Total threads in all snapshots
    pub fn thread_count(&self) -> usize {
        self.facilities.iter().map(|d| d.snapshot.len()).sum()
    }

    pub fn deadlocked_count(&self) -> usize {
        self.facilities
            .iter()
            .filter_map(|d| d.deadlocks.as_ref())
            .map(DeadlockSet::len)
            .sum()
    }
}

pub struct Pipeline<'p> {
    attacher: &'p dyn ProcessAttacher,
    provider: &'p dyn ChannelProvider,
    cancel: CancellationToken,
}

impl<'p> Pipeline<'p> {
    pub fn new(attacher: &'p dyn ProcessAttacher, provider: &'p dyn ChannelProvider) -> Self {
        Self {
            attacher,
            provider,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Attach to the process and capture the requested facilities
    pub fn capture(&self, request: &DumpRequest) -> StageResult<Capture> {
        let pid = request.pid;

        self.cancel.check().stage(pid, Stage::Attach)?;
        let endpoint = resolve_endpoint(self.attacher, pid).stage(pid, Stage::Attach)?;
        let channel = self.provider.open(&endpoint).stage(pid, Stage::Attach)?;
        info!(pid, %endpoint, "channel open");

        let result = self.capture_on(channel.as_ref(), request);

        if let Err(e) = channel.close() {
            warn!(pid, error = %e, "closing management channel failed");
        } else {
            debug!(pid, "channel closed");
        }

        result.map(|facilities| Capture {
            pid,
            endpoint,
            facilities,
        })
    }

    /// Capture, render and write into `dir`
    pub fn run(&self, request: &DumpRequest, sink: &DumpSink, dir: &Path) -> StageResult<PathBuf> {
        let capture = self.capture(request)?;
        let report = capture.render();
        sink.write(&report, dir).stage(request.pid, Stage::Write)
    }

    fn capture_on(
        &self,
        channel: &dyn ManagementChannel,
        request: &DumpRequest,
    ) -> StageResult<Vec<FacilityDump>> {
        let pid = request.pid;

        let names: Vec<FacilityName> = if request.all_facilities {
            facility::resolve_all(channel, &request.facility, request.filter.as_ref())
                .stage(pid, Stage::Resolve)?
                .into_iter()
                .collect()
        } else {
            facility::resolve(channel, &request.facility, request.filter.as_ref())
                .stage(pid, Stage::Resolve)?
                .into_iter()
                .collect()
        };

        if names.is_empty() {
            return Err(Error::NotFound(format!(
                "no thread facility matches `{}` on {}",
                request.facility,
                channel.identity()
            )))
            .stage(pid, Stage::Resolve);
        }

        let collector =
            SnapshotCollector::new(request.collect.clone()).with_cancellation(self.cancel.clone());
        let analyzer = DeadlockAnalyzer::new().with_cancellation(self.cancel.clone());

        let mut dumps = Vec::with_capacity(names.len());
        for name in names {
            let handle = FacilityHandle::new(channel, &name);
            debug!(pid, facility = %name, "capturing facility");

            let snapshot = collector.collect(&handle).stage(pid, Stage::Collect)?;
            let deadlocks = if request.deadlocks {
                Some(analyzer.find_deadlocked(&handle).stage(pid, Stage::Detect)?)
            } else {
                None
            };

            dumps.push(FacilityDump {
                facility: name,
                snapshot,
                deadlocks,
            });
        }

        Ok(dumps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{StackFrame, ThreadRecord, ThreadState};
    use crate::dump::format::DEADLOCK_MARKER;
    use crate::dump::sink::NamingPolicy;
    use crate::platform::memory::MemoryHost;

    const THREADING: &str = "java.lang:type=Threading";

    fn bank_host(pid: u32) -> MemoryHost {
        let host = MemoryHost::new();
        let table = host.add_facility(pid, THREADING, "java.lang").unwrap();
        let mut table = table.write().unwrap();
        table.spawn(ThreadRecord::new(1, "main", ThreadState::Runnable));
        table.spawn(
            ThreadRecord::new(10, "A", ThreadState::Blocked)
                .with_lock_owner(20)
                .with_frames(vec![StackFrame::new("Bank", "transfer").with_location("Bank.java:42")]),
        );
        table.spawn(
            ThreadRecord::new(20, "B", ThreadState::Blocked)
                .with_lock_owner(10)
                .with_frames(vec![StackFrame::new("Bank", "transfer").with_location("Bank.java:42")]),
        );
        drop(table);
        host
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "threadsnap-pipeline-{}-{}",
            tag,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    // ==================== Capture Tests ====================

    #[test]
    fn test_capture_with_deadlock() {
        let host = bank_host(4242);
        let pipeline = Pipeline::new(&host, &host);

        let capture = pipeline.capture(&DumpRequest::new(4242)).unwrap();
        assert_eq!(capture.endpoint.to_string(), "memory://4242");
        assert_eq!(capture.facilities.len(), 1);
        assert_eq!(capture.thread_count(), 3);

        let deadlocks = capture.facilities[0].deadlocks.as_ref().unwrap();
        assert_eq!(deadlocks.ids(), &[10, 20]);

        let report = capture.render();
        assert!(report.as_str().contains(DEADLOCK_MARKER));
        assert_eq!(host.open_channels(4242), 0);
    }

    #[test]
    fn test_capture_without_deadlock_pass() {
        let host = bank_host(7);
        let mut request = DumpRequest::new(7);
        request.deadlocks = false;

        let capture = Pipeline::new(&host, &host).capture(&request).unwrap();
        assert!(capture.facilities[0].deadlocks.is_none());
        assert!(!capture.render().as_str().contains(DEADLOCK_MARKER));
    }

    #[test]
    fn test_capture_bootstraps_unpublished_process() {
        let host = bank_host(8);
        host.set_published(8, false);

        let capture = Pipeline::new(&host, &host).capture(&DumpRequest::new(8)).unwrap();
        assert_eq!(capture.thread_count(), 3);
    }

    #[test]
    fn test_capture_all_facilities() {
        let host = bank_host(9);
        let other = host
            .add_facility(9, "java.lang:type=Threading,name=isolate", "java.lang")
            .unwrap();
        other
            .write()
            .unwrap()
            .spawn(ThreadRecord::new(100, "isolate-main", ThreadState::Waiting));

        let mut request = DumpRequest::new(9);
        request.all_facilities = true;
        let capture = Pipeline::new(&host, &host).capture(&request).unwrap();

        assert_eq!(capture.facilities.len(), 2);
        assert_eq!(capture.thread_count(), 4);
        assert_eq!(capture.render().as_str().matches("# Facility ").count(), 2);
    }

    // ==================== Failure Tests ====================

    #[test]
    fn test_unknown_process_fails_at_attach() {
        let host = MemoryHost::new();
        let err = Pipeline::new(&host, &host)
            .capture(&DumpRequest::new(1))
            .unwrap_err();
        assert_eq!(err.stage, Stage::Attach);
        assert_eq!(err.target, 1);
        assert!(matches!(err.source, Error::Attach { .. }));
    }

    #[test]
    fn test_no_matching_facility_fails_at_resolve() {
        let host = bank_host(11);
        let mut request = DumpRequest::new(11);
        request.facility = "jdk.management:type=Threading".into();

        let err = Pipeline::new(&host, &host).capture(&request).unwrap_err();
        assert_eq!(err.stage, Stage::Resolve);
        assert!(matches!(err.source, Error::NotFound(_)));
        assert_eq!(host.open_channels(11), 0);
    }

    #[test]
    fn test_malformed_pattern_fails_at_resolve() {
        let host = bank_host(12);
        let mut request = DumpRequest::new(12);
        request.facility = "no-colon".into();

        let err = Pipeline::new(&host, &host).capture(&request).unwrap_err();
        assert_eq!(err.stage, Stage::Resolve);
        assert_eq!(err.exit_code(), 12);
    }

    #[test]
    fn test_cancelled_pipeline() {
        let host = bank_host(13);
        let token = CancellationToken::new();
        token.cancel();

        let err = Pipeline::new(&host, &host)
            .with_cancellation(token)
            .capture(&DumpRequest::new(13))
            .unwrap_err();
        assert!(matches!(err.source, Error::Cancelled));
        assert_eq!(err.exit_code(), 130);
    }

    // ==================== End-to-end Tests ====================

    #[test]
    fn test_run_writes_dump_file() {
        let host = bank_host(14);
        let dir = temp_dir("run");
        let sink = DumpSink::new(NamingPolicy::Fixed("threadDumpFile.txt".into()));

        let path = Pipeline::new(&host, &host)
            .run(&DumpRequest::new(14), &sink, &dir)
            .unwrap();
        assert_eq!(path, dir.join("threadDumpFile.txt"));

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("Thread name:\"main\"\n\tjava.lang.Thread.State: RUNNABLE\n"));
        assert!(text.contains("\t\tat Bank.transfer(Bank.java:42)\n"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_run_missing_directory_fails_at_write() {
        let host = bank_host(15);
        let dir = std::env::temp_dir().join(format!("threadsnap-missing-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        let err = Pipeline::new(&host, &host)
            .run(&DumpRequest::new(15), &DumpSink::default(), &dir)
            .unwrap_err();
        assert_eq!(err.stage, Stage::Write);
        assert_eq!(err.exit_code(), 14);
    }
}
