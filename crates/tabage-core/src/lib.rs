//! Tabage Core - Types, host capability traits, and error handling

pub mod error;
pub mod host;
pub mod protocol;
pub mod types;

pub use error::{Error, Result};
pub use host::*;
pub use protocol::*;
pub use types::*;
