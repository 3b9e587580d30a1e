//! Core module containing the data model and pure logic
//!
//! This module contains:
//! - Thread, Snapshot, DeadlockSet: captured thread state
//! - FacilityName, QueryFilter: management object names and patterns
//! - ManagementChannel, ProcessAttacher: the management channel boundary
//! - ThreadFacility: typed facility capability and its resolver
//! - WaitGraph: deadlock cycle detection
//! - Settings: user configuration

pub mod cancel;
pub mod channel;
pub mod error;
pub mod facility;
pub mod name;
pub mod query;
pub mod settings;
pub mod thread;
pub mod waitgraph;

pub use cancel::*;
pub use channel::*;
pub use error::*;
pub use facility::*;
pub use name::*;
pub use settings::*;
pub use thread::*;
pub use waitgraph::*;
