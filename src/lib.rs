//! tabage - keeps browser tabs sorted into containers by age
//!
//! The engine lives in `tabage-engine`; this crate drives it against a host
//! snapshot on disk so a sorting session can be run from the command line.

pub mod session;
pub mod snapshot;
