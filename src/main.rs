//! threadsnap - thread snapshots and deadlock analysis for running processes
//!
//! Copyright (C) 2026 Trung Le
//! Released under the GNU GPLv2+

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use threadsnap::core::{
    query, CancellationToken, Error, NamingMode, Settings, Stage, StageContext, StageError,
};
use threadsnap::dump::format::render_thread;
use threadsnap::dump::{Capture, CollectOptions, DumpRequest, DumpSink, Pipeline};
use threadsnap::platform::SystemProvider;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Naming {
    /// Overwrite the same file every time
    Fixed,
    /// New timestamped file per dump
    Timestamp,
}

impl From<Naming> for NamingMode {
    fn from(naming: Naming) -> Self {
        match naming {
            Naming::Fixed => NamingMode::Fixed,
            Naming::Timestamp => NamingMode::Timestamp,
        }
    }
}

/// threadsnap - dump the threads of a running process
#[derive(Parser, Debug)]
#[command(name = "threadsnap", version)]
struct Args {
    /// Process to dump
    #[arg(value_name = "PID")]
    pid: u32,

    /// Directory the dump is written to
    #[arg(short = 'o', long = "output", value_name = "DIR")]
    output: Option<PathBuf>,

    /// Write the dump to stdout instead of a file
    #[arg(long = "stdout", conflicts_with = "output")]
    stdout: bool,

    /// How dump files are named
    #[arg(long = "naming", value_enum)]
    naming: Option<Naming>,

    /// File name for fixed naming
    #[arg(long = "file-name", value_name = "NAME")]
    file_name: Option<String>,

    /// Facility name pattern, e.g. '*:type=Threading,*'
    #[arg(long = "facility", value_name = "PATTERN")]
    facility: Option<String>,

    /// Dump every matching facility, not only the first
    #[arg(long = "all-facilities")]
    all_facilities: bool,

    /// Skip deadlock detection
    #[arg(long = "no-deadlocks")]
    no_deadlocks: bool,

    /// Print the number of threads named exactly NAME
    #[arg(long = "count", value_name = "NAME")]
    count: Option<String>,

    /// Print the number of threads whose name contains SUBSTRING
    #[arg(long = "count-matching", value_name = "SUBSTRING")]
    count_matching: Option<String>,

    /// Print the thread with this id
    #[arg(long = "thread", value_name = "ID")]
    thread: Option<u64>,

    /// Worker threads for per-thread queries (0 = automatic)
    #[arg(short = 'j', long = "jobs", value_name = "N")]
    jobs: Option<usize>,

    /// More log output (-v info, -vv debug)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    /// Settings file to use instead of the default
    #[arg(long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Save the effective settings to the settings file
    #[arg(long = "save-settings")]
    save_settings: bool,
}

impl Args {
    fn is_query(&self) -> bool {
        self.count.is_some() || self.count_matching.is_some() || self.thread.is_some()
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(io::stderr)
        .init();
}

/// Apply command line arguments on top of loaded settings
fn apply_args(settings: &mut Settings, args: &Args) {
    if let Some(ref output) = args.output {
        settings.output_dir = output.clone();
        settings.changed = true;
    }
    if let Some(naming) = args.naming {
        settings.naming = naming.into();
        settings.changed = true;
    }
    if let Some(ref name) = args.file_name {
        settings.file_name = name.clone();
        settings.changed = true;
    }
    if let Some(ref facility) = args.facility {
        settings.facility = facility.clone();
        settings.changed = true;
    }
    if let Some(jobs) = args.jobs {
        settings.jobs = if jobs == 0 { None } else { Some(jobs) };
        settings.changed = true;
    }
    if args.no_deadlocks {
        settings.deadlocks = false;
        settings.changed = true;
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut settings = match args.config {
        Some(ref path) => Settings::with_file(path.clone()),
        None => Settings::new(),
    };
    if let Err(e) = settings.load() {
        warn!("failed to load settings: {:#}", e);
    }
    apply_args(&mut settings, &args);

    if args.save_settings && settings.changed {
        if let Err(e) = settings.write() {
            warn!("failed to save settings: {:#}", e);
        }
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        if signals::set_handler(move || cancel.cancel()).is_err() {
            warn!("interrupt handler already installed");
        }
    }

    match run(&args, &settings, cancel) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("threadsnap: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

fn run(args: &Args, settings: &Settings, cancel: CancellationToken) -> Result<(), StageError> {
    let provider = SystemProvider;
    let pipeline = Pipeline::new(&provider, &provider).with_cancellation(cancel);

    let request = DumpRequest {
        pid: args.pid,
        facility: settings.facility.clone(),
        filter: None,
        all_facilities: args.all_facilities,
        // Queries only read the snapshot
        deadlocks: settings.deadlocks && !args.is_query(),
        collect: CollectOptions {
            jobs: settings.jobs,
        },
    };

    let capture = pipeline.capture(&request)?;

    if args.is_query() {
        return print_queries(args, &capture);
    }

    let report = capture.render();
    let sink = DumpSink::new(settings.naming_policy());

    if args.stdout {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        sink.write_stream(&report, &mut out)
            .stage(args.pid, Stage::Write)?;
    } else {
        let path = sink
            .write(&report, &settings.output_dir)
            .stage(args.pid, Stage::Write)?;
        println!("{}", path.display());
    }

    let deadlocked = capture.deadlocked_count();
    if deadlocked > 0 {
        warn!(pid = args.pid, threads = deadlocked, "deadlocked threads found");
    }
    info!(pid = args.pid, threads = capture.thread_count(), "done");

    Ok(())
}

fn print_queries(args: &Args, capture: &Capture) -> Result<(), StageError> {
    let snapshots = || capture.facilities.iter().map(|d| &d.snapshot);

    if let Some(ref name) = args.count {
        let count: usize = snapshots()
            .map(|s| query::count_by_exact_name(s, name))
            .sum();
        println!("{}", count);
    }

    if let Some(ref pattern) = args.count_matching {
        let count: usize = snapshots().map(|s| query::count_by_pattern(s, pattern)).sum();
        println!("{}", count);
    }

    if let Some(id) = args.thread {
        let found = snapshots().find_map(|s| query::lookup(s, id).map(|r| (s.runtime(), r)));
        match found {
            Some((runtime, record)) => {
                let mut text = String::new();
                // Writing into a String cannot fail
                let _ = render_thread(&mut text, runtime, record);
                print!("{}", text);
            }
            None => {
                return Err(Error::NotFound(format!(
                    "thread {} is not in the snapshot",
                    id
                )))
                .stage(args.pid, Stage::Resolve);
            }
        }
    }

    Ok(())
}

/// SIGINT/SIGTERM handling
#[cfg(unix)]
mod signals {
    use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
    static HANDLER_SET: AtomicBool = AtomicBool::new(false);

    // A `*const dyn Fn()` is a fat pointer; boxing twice gives a thin one
    type Handler = Box<dyn Fn() + Send>;
    static HANDLER_PTR: AtomicPtr<Handler> = AtomicPtr::new(std::ptr::null_mut());

    pub fn set_handler<F: Fn() + Send + 'static>(handler: F) -> Result<(), ()> {
        if HANDLER_SET.swap(true, Ordering::SeqCst) {
            return Err(());
        }

        // Store before installing so a signal never sees a null handler
        let handler: Handler = Box::new(handler);
        let handler_ptr = Box::into_raw(Box::new(handler));
        HANDLER_PTR.store(handler_ptr, Ordering::SeqCst);

        unsafe {
            libc::signal(
                libc::SIGINT,
                handle_signal as *const () as libc::sighandler_t,
            );
            libc::signal(
                libc::SIGTERM,
                handle_signal as *const () as libc::sighandler_t,
            );
        }

        Ok(())
    }

    extern "C" fn handle_signal(_: libc::c_int) {
        let ptr = HANDLER_PTR.load(Ordering::SeqCst);
        if !ptr.is_null() {
            // SAFETY: ptr was set by set_handler and is never freed
            let handler = unsafe { &**ptr };
            handler();
        }
    }
}

#[cfg(not(unix))]
mod signals {
    pub fn set_handler<F: Fn() + Send + 'static>(_handler: F) -> Result<(), ()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "threadsnap",
            "4242",
            "-o",
            "/tmp",
            "--naming",
            "fixed",
            "--file-name",
            "dump",
            "-j",
            "4",
            "-vv",
        ])
        .unwrap();
        assert_eq!(args.pid, 4242);
        assert_eq!(args.verbose, 2);
        assert!(!args.is_query());

        let mut settings = Settings::with_file(PathBuf::from("/nonexistent/threadsnaprc"));
        apply_args(&mut settings, &args);
        assert_eq!(settings.output_dir, PathBuf::from("/tmp"));
        assert_eq!(settings.naming, NamingMode::Fixed);
        assert_eq!(settings.jobs, Some(4));
        assert!(settings.changed);
    }

    #[test]
    fn test_stdout_conflicts_with_output() {
        assert!(Args::try_parse_from(["threadsnap", "1", "--stdout", "-o", "/tmp"]).is_err());
    }

    #[test]
    fn test_query_flags() {
        let args = Args::try_parse_from(["threadsnap", "1", "--thread", "7"]).unwrap();
        assert!(args.is_query());
        let args = Args::try_parse_from(["threadsnap", "1", "--count-matching", "worker"]).unwrap();
        assert!(args.is_query());
    }

    #[test]
    fn test_jobs_zero_is_automatic() {
        let args = Args::try_parse_from(["threadsnap", "1", "-j", "0", "--no-deadlocks"]).unwrap();
        let mut settings = Settings::with_file(PathBuf::from("/nonexistent/threadsnaprc"));
        settings.jobs = Some(8);
        apply_args(&mut settings, &args);
        assert_eq!(settings.jobs, None);
        assert!(!settings.deadlocks);
    }
}
