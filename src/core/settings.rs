//! Settings module
//!
//! User-configurable defaults for threadsnap, read from a `key=value` file.
//! Command line flags override whatever is loaded here.

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use crate::core::facility::DEFAULT_FACILITY_PATTERN;
use crate::dump::{is_plain_file_name, NamingPolicy};

/// Default file name under the fixed naming policy
pub const DEFAULT_FIXED_FILE_NAME: &str = "threadDumpFile.txt";

/// How dump files are named
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NamingMode {
    /// Same file every time, overwritten
    Fixed,
    /// New timestamped file per dump
    #[default]
    Timestamp,
}

impl NamingMode {
    /// Get name for settings file
    pub fn name(self) -> &'static str {
        match self {
            NamingMode::Fixed => "fixed",
            NamingMode::Timestamp => "timestamp",
        }
    }

    /// Parse from name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "fixed" => Some(NamingMode::Fixed),
            "timestamp" => Some(NamingMode::Timestamp),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Config file path
    pub filename: Option<PathBuf>,
    pub changed: bool,

    /// Facility name pattern to resolve
    pub facility: String,
    /// Directory dumps are written to
    pub output_dir: PathBuf,
    pub naming: NamingMode,
    /// File name used by the fixed naming mode
    pub file_name: String,
    /// Worker threads for per-thread queries (None = rayon default)
    pub jobs: Option<usize>,
    /// Run the deadlock pass
    pub deadlocks: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings::new()
    }
}

impl Settings {
    pub fn new() -> Self {
        Settings {
            filename: Self::default_config_path(),
            changed: false,
            facility: DEFAULT_FACILITY_PATTERN.to_string(),
            output_dir: PathBuf::from("."),
            naming: NamingMode::Timestamp,
            file_name: DEFAULT_FIXED_FILE_NAME.to_string(),
            jobs: None,
            deadlocks: true,
        }
    }

    /// Settings bound to an explicit config file
    pub fn with_file(path: PathBuf) -> Self {
        Settings {
            filename: Some(path),
            ..Settings::new()
        }
    }

    /// Get the default config file path
    fn default_config_path() -> Option<PathBuf> {
        if let Some(config_dir) = dirs::config_dir() {
            Some(config_dir.join("threadsnap").join("threadsnaprc"))
        } else {
            dirs::home_dir().map(|home| {
                home.join(".config")
                    .join("threadsnap")
                    .join("threadsnaprc")
            })
        }
    }

    /// Naming policy for the dump sink
    pub fn naming_policy(&self) -> NamingPolicy {
        match self.naming {
            NamingMode::Fixed => NamingPolicy::Fixed(self.file_name.clone()),
            NamingMode::Timestamp => NamingPolicy::Timestamped,
        }
    }

    /// Load settings from the config file
    pub fn load(&mut self) -> anyhow::Result<()> {
        let path = match &self.filename {
            Some(p) => p.clone(),
            None => return Ok(()),
        };

        if !path.exists() {
            return Ok(());
        }

        let file = fs::File::open(&path)?;
        let reader = BufReader::new(file);

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                self.parse_setting(key.trim(), value.trim());
            }
        }

        Ok(())
    }

    /// Parse a single setting line
    fn parse_setting(&mut self, key: &str, value: &str) {
        match key {
            "facility" => {
                if !value.is_empty() {
                    self.facility = value.to_string();
                }
            }
            "output_dir" => {
                if !value.is_empty() {
                    self.output_dir = PathBuf::from(value);
                }
            }
            "naming" => {
                if let Some(mode) = NamingMode::from_name(value) {
                    self.naming = mode;
                }
            }
            "file_name" => {
                if is_plain_file_name(value) {
                    self.file_name = value.to_string();
                }
            }
            "jobs" => {
                if let Ok(v) = value.parse::<usize>() {
                    self.jobs = if v == 0 { None } else { Some(v.min(256)) };
                }
            }
            "deadlocks" => match value {
                "1" => self.deadlocks = true,
                "0" => self.deadlocks = false,
                _ => {}
            },
            _ => {}
        }
    }

    /// Write settings to the config file
    pub fn write(&self) -> anyhow::Result<()> {
        let path = match &self.filename {
            Some(p) => p.clone(),
            None => return Ok(()),
        };

        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = fs::File::create(&path)?;

        writeln!(file, "# threadsnap configuration file")?;
        writeln!(file, "# Automatically generated by threadsnap")?;
        writeln!(file)?;

        writeln!(file, "facility={}", self.facility)?;
        writeln!(file, "output_dir={}", self.output_dir.display())?;
        writeln!(file, "naming={}", self.naming.name())?;
        writeln!(file, "file_name={}", self.file_name)?;
        writeln!(file, "jobs={}", self.jobs.unwrap_or(0))?;
        writeln!(file, "deadlocks={}", if self.deadlocks { 1 } else { 0 })?;

        Ok(())
    }
}

// Stub for dirs crate functionality
mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| home_dir().map(|h| h.join(".config")))
    }

    pub fn home_dir() -> Option<PathBuf> {
        std::env::var("HOME").ok().map(PathBuf::from)
    }
}
