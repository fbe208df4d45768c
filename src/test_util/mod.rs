//! Fixtures for testing code that deals with deltas and the telemetry bus. They are used for
//!  the crate's own tests, and they are exported for testing applications that embed a link.

pub mod bus;
pub mod config;
pub mod delta;
