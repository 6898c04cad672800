//! Four-source splice streaming over UDP.
//!
//! A client requests one file from four servers at once. Each server sends
//! only the sequence numbers a shared weighted round robin assigns to it;
//! the client reorders them, measures how fast each source delivers, and
//! pushes new split ratios that take effect at an agreed sequence number.
//!
//! - [`sender`]: the source server loop and payload sources
//! - [`receiver`]: reorder buffer, output sinks and the client session
//! - [`scheduler`]: splice scheduling on both sides
//! - [`config`]: TOML configuration shared by both binaries

pub mod config;
pub mod error;
pub mod net;
pub mod receiver;
pub mod scheduler;
pub mod sender;
