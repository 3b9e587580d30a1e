//! threadsnap: thread snapshots and deadlock analysis for running processes
//!
//! Attaches to a process through a management channel, captures every live
//! thread with its stack, asks the process for threads in a circular wait
//! and writes a plain-text dump.

pub mod core;
pub mod dump;
pub mod platform;
