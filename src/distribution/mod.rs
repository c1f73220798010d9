//! Request routing for one subscriber
//!
//! A distribution manager picks the endpoint a synchronous request goes to
//! and fails over to another one when it breaks. The variant is chosen once
//! when the pool is built.

pub mod ha;
pub mod standard;

use crate::endpoint::{Endpoint, EndpointRef};
use crate::protocol::{Reply, Request};
use crate::utils::{ClientError, Result};

pub use ha::HaDistributionManager;
pub use standard::StandardDistributionManager;

/// Attempts at a request when the server keeps asking for credentials
pub const MAX_AUTH_ATTEMPTS: usize = 3;

pub trait DistributionManager: Send + Sync {
    /// Attach to the endpoints and pick the first active one
    fn init(&self) -> Result<()>;

    /// Send `request`, failing over to other endpoints when allowed
    fn send_sync_request(&self, request: &Request, attempt_failover: bool) -> Result<Reply>;

    /// Make sure the active endpoint is usable, switching if it is not
    fn failover(&self) -> Result<()>;

    fn is_endpoint_attached(&self, endpoint: &Endpoint) -> bool;

    /// Release every endpoint reference
    fn destroy(&self);
}

/// Closed set of routing strategies
pub enum DistributionManagerKind {
    Standard(std::sync::Arc<StandardDistributionManager>),
    Ha(HaDistributionManager),
}

impl DistributionManagerKind {
    fn inner(&self) -> &dyn DistributionManager {
        match self {
            DistributionManagerKind::Standard(dm) => dm.as_ref(),
            DistributionManagerKind::Ha(dm) => dm,
        }
    }

    pub fn is_ha(&self) -> bool {
        matches!(self, DistributionManagerKind::Ha(_))
    }
}

impl DistributionManager for DistributionManagerKind {
    fn init(&self) -> Result<()> {
        self.inner().init()
    }

    fn send_sync_request(&self, request: &Request, attempt_failover: bool) -> Result<Reply> {
        self.inner().send_sync_request(request, attempt_failover)
    }

    fn failover(&self) -> Result<()> {
        self.inner().failover()
    }

    fn is_endpoint_attached(&self, endpoint: &Endpoint) -> bool {
        self.inner().is_endpoint_attached(endpoint)
    }

    fn destroy(&self) {
        self.inner().destroy()
    }
}

/// Send on one endpoint, logging in again when the server reports the
/// session is no longer authenticated
pub fn send_request_to_endpoint(endpoint: &EndpointRef, request: &Request, secure: bool) -> Result<Reply> {
    let attempts = if secure { MAX_AUTH_ATTEMPTS } else { 1 };
    let mut last = None;
    for _ in 0..attempts {
        match endpoint.send(request) {
            Err(ClientError::AuthenticationRequired(msg)) if secure => {
                tracing::debug!("{} asked {} to authenticate again", endpoint.name(), request.verb.as_str());
                last = Some(ClientError::AuthenticationRequired(msg));
            }
            other => return other,
        }
    }
    Err(last.unwrap_or_else(|| ClientError::AuthenticationRequired(endpoint.name().to_string())))
}
