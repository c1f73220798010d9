//! cache-ha-client library
//!
//! Client-side connectivity core for a distributed in-memory cache: live
//! connections to a cluster of cache servers, a primary/secondary
//! subscription queue topology kept alive under node failure, request
//! failover, and deduplicated acknowledgement of server-pushed events.

pub mod client;
pub mod cluster;
pub mod config;
pub mod distribution;
pub mod endpoint;
pub mod ha;
pub mod protocol;
pub mod region;
pub mod task;
pub mod utils;

#[cfg(test)]
mod testing;
