//! Dump text layout
//!
//! One block per thread, in snapshot order:
//!
//! ```text
//! Thread name:"worker-1"
//! 	java.lang.Thread.State: WAITING
//! 		at Lock.await(Unknown Source)
//!
//! ```
//!
//! Output depends only on the inputs, so equal inputs give byte-identical
//! reports.

use std::fmt::{self, Write};

use crate::core::{DeadlockSet, FacilityName, Snapshot, ThreadRecord};

/// Header of the deadlock section
pub const DEADLOCK_MARKER: &str = "# Deadlocked Threads";

/// Prefix of the per-facility header in multi-facility reports
pub const FACILITY_MARKER: &str = "# Facility";

/// Rendered dump text
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpReport {
    text: String,
}

impl DumpReport {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.text.as_bytes()
    }

    pub fn into_string(self) -> String {
        self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

impl fmt::Display for DumpReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Render a snapshot, followed by the deadlock section when `deadlocks` is
/// non-empty
pub fn render(snapshot: &Snapshot, deadlocks: Option<&DeadlockSet>) -> DumpReport {
    let mut text = String::new();
    // Writing into a String cannot fail
    let _ = render_into(&mut text, snapshot, deadlocks);
    DumpReport { text }
}

/// Render several facilities into one report, each under its own header
pub fn render_sections<'a>(
    sections: impl IntoIterator<Item = (&'a FacilityName, &'a Snapshot, Option<&'a DeadlockSet>)>,
) -> DumpReport {
    let mut text = String::new();
    for (index, (name, snapshot, deadlocks)) in sections.into_iter().enumerate() {
        if index > 0 {
            text.push('\n');
        }
        let _ = writeln!(text, "{} {}", FACILITY_MARKER, name.canonical());
        text.push('\n');
        let _ = render_into(&mut text, snapshot, deadlocks);
    }
    DumpReport { text }
}

pub fn render_into<W: Write>(
    out: &mut W,
    snapshot: &Snapshot,
    deadlocks: Option<&DeadlockSet>,
) -> fmt::Result {
    for record in snapshot {
        render_thread(out, snapshot.runtime(), record)?;
    }

    if let Some(deadlocks) = deadlocks.filter(|d| !d.is_empty()) {
        writeln!(out, "{}", DEADLOCK_MARKER)?;
        writeln!(out)?;
        for record in deadlocks.threads() {
            render_thread(out, snapshot.runtime(), record)?;
        }
    }

    Ok(())
}

/// Render one thread block, ending with a blank line
pub fn render_thread<W: Write>(out: &mut W, runtime: &str, record: &ThreadRecord) -> fmt::Result {
    writeln!(out, "Thread name:\"{}\"", record.name)?;
    if runtime.is_empty() {
        writeln!(out, "\tThread.State: {}", record.state)?;
    } else {
        writeln!(out, "\t{}.Thread.State: {}", runtime, record.state)?;
    }
    for frame in &record.stack_frames {
        writeln!(out, "\t\tat {}", frame)?;
    }
    writeln!(out)
}
