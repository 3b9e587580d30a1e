//! Dump file output
//!
//! Two naming policies: a fixed file name that is overwritten on every dump,
//! or a timestamped name that never reuses an existing file. Files are
//! written through a buffered writer that is dropped, and the file closed,
//! on every return path. A write that fails midway can leave a partial file
//! behind.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use tracing::{debug, info};

use super::format::DumpReport;
use crate::core::{Error, Result};

/// Attempts at finding a free timestamped name before giving up
const MAX_NAME_ATTEMPTS: u32 = 1000;

/// How dump files are named
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum NamingPolicy {
    /// Always the same file, prior content replaced
    Fixed(String),
    /// `threaddump-<local time>.txt`, a new file per dump
    #[default]
    Timestamped,
}

#[derive(Debug, Clone, Default)]
pub struct DumpSink {
    naming: NamingPolicy,
}

impl DumpSink {
    pub fn new(naming: NamingPolicy) -> Self {
        Self { naming }
    }

    pub fn naming(&self) -> &NamingPolicy {
        &self.naming
    }

    /// Write `report` into `dir`, returning the path written
    pub fn write(&self, report: &DumpReport, dir: &Path) -> Result<PathBuf> {
        check_directory(dir)?;

        let (path, file) = match &self.naming {
            NamingPolicy::Fixed(name) => {
                if !is_plain_file_name(name) {
                    return Err(Error::io(
                        dir.join(name),
                        io::Error::new(
                            io::ErrorKind::InvalidInput,
                            "dump file name must be a single path component",
                        ),
                    ));
                }
                let path = dir.join(with_txt_extension(name));
                let file = File::create(&path).map_err(|e| Error::io(&path, e))?;
                (path, file)
            }
            NamingPolicy::Timestamped => create_unique(dir, &timestamp_stem())?,
        };

        let mut writer = BufWriter::new(file);
        writer
            .write_all(report.as_bytes())
            .and_then(|_| writer.flush())
            .map_err(|e| Error::io(&path, e))?;

        info!(path = %path.display(), bytes = report.len(), "dump written");
        Ok(path)
    }

    /// Write `report` to an arbitrary stream
    pub fn write_stream<W: Write>(&self, report: &DumpReport, out: &mut W) -> Result<()> {
        out.write_all(report.as_bytes())
            .and_then(|_| out.flush())
            .map_err(|e| Error::io("<stream>", e))
    }
}

fn check_directory(dir: &Path) -> Result<()> {
    let metadata = fs::metadata(dir).map_err(|e| Error::io(dir, e))?;
    if !metadata.is_dir() {
        return Err(Error::io(
            dir,
            io::Error::new(io::ErrorKind::NotADirectory, "not a directory"),
        ));
    }
    Ok(())
}

/// True when `name` names a file directly inside a directory
pub fn is_plain_file_name(name: &str) -> bool {
    let path = Path::new(name);
    path.file_name() == Some(path.as_os_str())
}

/// Append `.txt` when `name` has no extension
fn with_txt_extension(name: &str) -> String {
    if Path::new(name).extension().is_some() {
        name.to_string()
    } else {
        format!("{}.txt", name)
    }
}

fn timestamp_stem() -> String {
    format!("threaddump-{}", Local::now().format("%Y-%m-%d_%H-%M-%S%.3f"))
}

/// Create `<stem>.txt`, or `<stem>-N.txt` for the first free N
fn create_unique(dir: &Path, stem: &str) -> Result<(PathBuf, File)> {
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let name = if attempt == 0 {
            format!("{}.txt", stem)
        } else {
            format!("{}-{}.txt", stem, attempt)
        };
        let path = dir.join(name);

        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!(path = %path.display(), "dump file exists, trying next name");
            }
            Err(e) => return Err(Error::io(path, e)),
        }
    }

    Err(Error::io(
        dir.join(format!("{}.txt", stem)),
        io::Error::new(io::ErrorKind::AlreadyExists, "no free dump file name"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Snapshot, ThreadRecord, ThreadState};
    use crate::dump::format::render;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "threadsnap-sink-{}-{}",
            tag,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn report(name: &str) -> DumpReport {
        render(
            &Snapshot::new(
                "java.lang",
                vec![ThreadRecord::new(1, name, ThreadState::Runnable)],
            ),
            None,
        )
    }

    // ==================== Fixed Naming Tests ====================

    #[test]
    fn test_fixed_name_overwrites() {
        let dir = temp_dir("fixed");
        let sink = DumpSink::new(NamingPolicy::Fixed("threadDumpFile.txt".into()));

        let first = sink.write(&report("first-thread-with-a-long-name"), &dir).unwrap();
        let second = sink.write(&report("second"), &dir).unwrap();

        assert_eq!(first, second);
        assert_eq!(first, dir.join("threadDumpFile.txt"));
        assert_eq!(fs::read_to_string(&second).unwrap(), report("second").as_str());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 1);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_fixed_name_stays_in_directory() {
        let base = temp_dir("escape");
        let dir = base.join("dumps");
        fs::create_dir_all(&dir).unwrap();

        for name in ["../escaped.txt", "sub/dump.txt", "/tmp/abs.txt", "..", ""] {
            let sink = DumpSink::new(NamingPolicy::Fixed(name.to_string()));
            match sink.write(&report("x"), &dir) {
                Err(Error::Io { source, .. }) => {
                    assert_eq!(source.kind(), io::ErrorKind::InvalidInput, "{}", name)
                }
                other => panic!("{}: expected io error, got {:?}", name, other),
            }
        }
        assert!(!base.join("escaped.txt").exists());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);

        let _ = fs::remove_dir_all(&base);
    }

    #[test]
    fn test_plain_file_name() {
        assert!(is_plain_file_name("threadDumpFile.txt"));
        assert!(is_plain_file_name("dump"));
        assert!(!is_plain_file_name("../dump.txt"));
        assert!(!is_plain_file_name("a/b.txt"));
        assert!(!is_plain_file_name("/abs.txt"));
        assert!(!is_plain_file_name("."));
    }

    #[test]
    fn test_fixed_name_gets_txt_extension() {
        assert_eq!(with_txt_extension("dump"), "dump.txt");
        assert_eq!(with_txt_extension("dump.txt"), "dump.txt");
        assert_eq!(with_txt_extension("dump.log"), "dump.log");
    }

    // ==================== Timestamped Naming Tests ====================

    #[test]
    fn test_timestamped_names_are_unique() {
        let dir = temp_dir("stamped");
        let sink = DumpSink::new(NamingPolicy::Timestamped);

        let paths: Vec<PathBuf> = (0..3)
            .map(|i| sink.write(&report(&format!("t{}", i)), &dir).unwrap())
            .collect();

        assert_ne!(paths[0], paths[1]);
        assert_ne!(paths[1], paths[2]);
        assert_ne!(paths[0], paths[2]);
        for (i, path) in paths.iter().enumerate() {
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            assert!(name.starts_with("threaddump-"));
            assert!(name.ends_with(".txt"));
            assert_eq!(fs::read_to_string(path).unwrap(), report(&format!("t{}", i)).as_str());
        }

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_create_unique_suffixes_on_collision() {
        let dir = temp_dir("collide");
        let (first, _) = create_unique(&dir, "threaddump-fixed").unwrap();
        let (second, _) = create_unique(&dir, "threaddump-fixed").unwrap();
        let (third, _) = create_unique(&dir, "threaddump-fixed").unwrap();

        assert_eq!(first, dir.join("threaddump-fixed.txt"));
        assert_eq!(second, dir.join("threaddump-fixed-1.txt"));
        assert_eq!(third, dir.join("threaddump-fixed-2.txt"));

        let _ = fs::remove_dir_all(&dir);
    }

    // ==================== Failure Tests ====================

    #[test]
    fn test_missing_directory_is_io_error() {
        let dir = std::env::temp_dir().join(format!(
            "threadsnap-sink-missing-{}/nested",
            std::process::id()
        ));
        let sink = DumpSink::default();
        match sink.write(&report("x"), &dir) {
            Err(Error::Io { path, .. }) => assert_eq!(path, dir),
            other => panic!("expected io error, got {:?}", other),
        }
    }

    #[test]
    fn test_file_as_directory_is_io_error() {
        let dir = temp_dir("notadir");
        let file = dir.join("plain.txt");
        fs::write(&file, "x").unwrap();

        let sink = DumpSink::new(NamingPolicy::Fixed("dump.txt".into()));
        assert!(matches!(sink.write(&report("x"), &file), Err(Error::Io { .. })));

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_write_stream() {
        let sink = DumpSink::default();
        let mut out = Vec::new();
        sink.write_stream(&report("main"), &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), report("main").as_str());
    }
}
