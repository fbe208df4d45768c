//! A bandwidth-efficient link for vessel telemetry deltas over constrained (e.g. satellite or
//!  cellular) connections.
//!
//! Deltas are batched so that packets fill but do not exceed the MTU, paths are replaced by
//!  numeric ids from a static dictionary, and each batch is serialized, compressed and
//!  encrypted into a single UDP datagram. Sending pauses while a periodic connectivity probe
//!  says the link is down.

pub mod batching;
pub mod bus;
pub mod codec;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod link;
pub mod metrics;
pub mod model;
pub mod test_util;
pub mod transport;
