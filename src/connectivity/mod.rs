//! Tracks whether the link is usable, by periodically probing a host on the far side.
//!
//! The transmit path only ever reads [ConnectivitySnapshot]s from a watch channel; the
//!  [driver] owns the state machine and is the only one updating it.

pub mod driver;
pub mod probe;
pub mod state;

pub use state::{ConnectivityMonitor, ConnectivitySnapshot, ConnectivityState};
