//! Test-only behaviour switches
//!
//! Handed to the connection manager at construction instead of living in
//! process-wide statics.

/// Fault-injection switches consulted during shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestHooks {
    /// Skip the close-connection message so the server treats the durable
    /// client as crashed and keeps its queue.
    pub simulate_durable_crash: bool,
}

impl TestHooks {
    pub fn durable_crash() -> Self {
        Self {
            simulate_durable_crash: true,
        }
    }
}
