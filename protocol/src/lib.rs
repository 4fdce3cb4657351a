//! Shared data model for the switchboard session server.
//!
//! The types here are split the same way the wire is: `message` holds the
//! snake_case stream messages produced by the external agent process, while
//! `protocol` holds the camelCase shapes exposed to polling callers.

mod config_types;
mod message;
mod protocol;

pub use config_types::*;
pub use message::*;
pub use protocol::*;
