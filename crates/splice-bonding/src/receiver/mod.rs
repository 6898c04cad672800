//! Client side of a splice session: the reorder buffer, the output sinks
//! and the session loop that ties them to the four sources.

pub mod aggregator;
pub mod session;
pub mod sink;
