//! # splice-transport
//!
//! Wire protocol and control logic for streaming one file from four UDP
//! sources to a single client.
//!
//! Each source owns a slice of the global sequence space, set by a splice
//! ratio vector that the client adjusts from observed arrivals. The client
//! reassembles the stream in a bounded reorder buffer, asks for holes with
//! targeted NAKs and throttles all sources from buffer occupancy.
//!
//! ## Crate structure
//!
//! - [`wire`] — Fixed-size packet layout, typed messages, receive validation
//! - [`session`] — Request handshake, error budget, end-of-stream tracking
//! - [`arq`] — Lost-sequence NAK planning and source selection
//! - [`congestion`] — Occupancy-driven rate halving/doubling, pacing

pub mod arq;
pub mod congestion;
pub mod session;
pub mod wire;
