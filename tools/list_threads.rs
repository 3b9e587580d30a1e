//! List the threads of a process as a table, for checking dumps by eye
//!
//! Usage:
//!   cargo run --bin list_threads -- <PID> [FACILITY-PATTERN]
//!
//! Prints one row per thread (id, state, frame count, name), then the ids of
//! any deadlocked threads.

use std::process::ExitCode;

use threadsnap::core::{
    facility, resolve_endpoint, ChannelProvider, FacilityHandle, ManagementChannel,
    ProcessAttacher, DEFAULT_FACILITY_PATTERN,
};
use threadsnap::dump::{DeadlockAnalyzer, SnapshotCollector};
use threadsnap::platform::SystemProvider;

fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);
    let pid = match args.next().and_then(|a| a.parse::<u32>().ok()) {
        Some(pid) => pid,
        None => {
            eprintln!("usage: list_threads <PID> [FACILITY-PATTERN]");
            return ExitCode::from(2);
        }
    };
    let pattern = args
        .next()
        .unwrap_or_else(|| DEFAULT_FACILITY_PATTERN.to_string());

    let provider = SystemProvider;
    match list_threads(&provider, &provider, pid, &pattern) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("list_threads: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn list_threads(
    attacher: &dyn ProcessAttacher,
    provider: &dyn ChannelProvider,
    pid: u32,
    pattern: &str,
) -> threadsnap::core::Result<()> {
    let address = resolve_endpoint(attacher, pid)?;
    let channel = provider.open(&address)?;

    let listed = print_facilities(channel.as_ref(), pattern);
    let closed = channel.close();
    listed.and(closed)
}

fn print_facilities(
    channel: &dyn ManagementChannel,
    pattern: &str,
) -> threadsnap::core::Result<()> {
    let names = facility::resolve_all(channel, pattern, None)?;
    if names.is_empty() {
        println!("no facility matches {} on {}", pattern, channel.identity());
    }

    for name in &names {
        let handle = FacilityHandle::new(channel, name);
        let snapshot = SnapshotCollector::default().collect(&handle)?;
        let deadlocks = DeadlockAnalyzer::new().find_deadlocked(&handle)?;

        println!("=== {} ({} threads) ===\n", name, snapshot.len());
        println!("{:<10} {:<14} {:>6}  {}", "ID", "STATE", "FRAMES", "NAME");
        println!("{}", "-".repeat(60));
        for record in &snapshot {
            println!(
                "{:<10} {:<14} {:>6}  {}",
                record.id,
                record.state,
                record.stack_frames.len(),
                record.name
            );
        }

        if !deadlocks.is_empty() {
            println!("\nDeadlocked: {:?}", deadlocks.ids());
        }
        println!();
    }

    Ok(())
}
