//! Splice scheduling.
//!
//! Two halves of one protocol:
//! - [`bucket`]: the server-side weighted round robin that decides which
//!   source owns each global sequence number, and applies switchovers at an
//!   agreed sequence.
//! - [`ratio`]: the client-side controller that measures per-source arrival
//!   shares, pushes new ratio vectors and tracks their acknowledgement.

pub mod bucket;
pub mod ratio;
