//! Endpoint registry and server selection
//!
//! This module provides:
//! - The process-wide connection manager owning every endpoint
//! - Ping, failover and receiver cleanup tasks
//! - Candidate server selection through a locator or a static list

pub mod connection_manager;
pub mod locator;

pub use connection_manager::{ConnectionManager, FailoverListener};
pub use locator::{Locator, ServerSelector};
