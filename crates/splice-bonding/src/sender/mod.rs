//! Source side of a splice session: payload sources and the per-server
//! streaming loop.

pub mod server;
pub mod source;
