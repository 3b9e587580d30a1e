//! Dump stages
//!
//! - collector: snapshot of every live thread
//! - deadlock: fresh deadlock query with resolved records
//! - format: text layout of snapshots and deadlock sections
//! - sink: dump files and streams
//! - pipeline: all of the above for one process

pub mod collector;
pub mod deadlock;
pub mod format;
pub mod pipeline;
pub mod sink;

pub use collector::{CollectOptions, SnapshotCollector};
pub use deadlock::DeadlockAnalyzer;
pub use format::{render, render_sections, DumpReport, DEADLOCK_MARKER};
pub use pipeline::{Capture, DumpRequest, FacilityDump, Pipeline};
pub use sink::{is_plain_file_name, DumpSink, NamingPolicy};
