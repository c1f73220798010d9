//! Routing for subscribers with redundant queues
//!
//! Continuous-query and interest-registration requests must reach every
//! queue, so they go through the redundancy manager. Everything else is
//! routed like a plain pool.

use std::sync::Arc;

use super::{DistributionManager, StandardDistributionManager};
use crate::endpoint::Endpoint;
use crate::ha::RedundancyManager;
use crate::protocol::{Reply, Request};
use crate::utils::Result;

pub struct HaDistributionManager {
    standard: Arc<StandardDistributionManager>,
    rm: Arc<RedundancyManager>,
}

impl HaDistributionManager {
    pub fn new(standard: Arc<StandardDistributionManager>, rm: Arc<RedundancyManager>) -> Self {
        Self { standard, rm }
    }

    pub fn standard(&self) -> &Arc<StandardDistributionManager> {
        &self.standard
    }
}

impl DistributionManager for HaDistributionManager {
    fn init(&self) -> Result<()> {
        self.standard.init()
    }

    fn send_sync_request(&self, request: &Request, attempt_failover: bool) -> Result<Reply> {
        if request.verb.is_cq() {
            return self.rm.send_sync_request_cq(request).map_err(|e| e.into_top_level());
        }
        if request.verb.is_register_interest() {
            return self
                .rm
                .send_sync_request_register_interest(request, None)
                .map_err(|e| e.into_top_level());
        }
        self.standard.send_sync_request(request, attempt_failover)
    }

    fn failover(&self) -> Result<()> {
        self.standard.failover()
    }

    fn is_endpoint_attached(&self, endpoint: &Endpoint) -> bool {
        self.standard.is_endpoint_attached(endpoint)
            || self
                .rm
                .redundant()
                .iter()
                .chain(self.rm.nonredundant().iter())
                .any(|ep| std::ptr::eq(Arc::as_ptr(ep), endpoint))
    }

    fn destroy(&self) {
        self.standard.destroy()
    }
}
