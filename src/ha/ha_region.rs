//! Per-region handle on an HA pool

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tracing::debug;

use super::pool_hadm::{PoolCore, PoolHaManager};
use crate::protocol::{Reply, Request, Verb};
use crate::region::Region;
use crate::utils::{ClientError, Result};

/// Attaches a region to a pool for as long as the handle lives
pub struct HaRegion {
    path: String,
    pool: Weak<PoolCore>,
    closed: AtomicBool,
}

impl HaRegion {
    /// Attach `region`. If the pool has no primary right now the region is
    /// told immediately that every endpoint is disconnected.
    pub fn new(pool: &PoolHaManager, region: Arc<dyn Region>) -> Result<Self> {
        let path = region.full_path().to_string();
        pool.core().add_region(region)?;
        Ok(Self {
            path,
            pool: Arc::downgrade(pool.core()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn full_path(&self) -> &str {
        &self.path
    }

    fn pool(&self) -> Result<Arc<PoolCore>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::IllegalState(format!("region {} is closed", self.path)));
        }
        self.pool
            .upgrade()
            .ok_or_else(|| ClientError::IllegalState("pool is closed".to_string()))
    }

    pub fn send_sync_request(&self, request: &Request) -> Result<Reply> {
        self.pool()?.send_sync_request(request)
    }

    /// Register interest in `keys` on every subscription queue
    pub fn register_interest(&self, keys: &[&[u8]]) -> Result<Reply> {
        let request = keys
            .iter()
            .fold(Request::new(Verb::RegisterInterestList).with_arg(self.path.as_bytes()), |req, key| {
                req.with_arg(*key)
            });
        self.pool()?.send_sync_request(&request)
    }

    pub fn unregister_interest(&self, keys: &[&[u8]]) -> Result<Reply> {
        let request = keys
            .iter()
            .fold(Request::new(Verb::UnregisterInterestList).with_arg(self.path.as_bytes()), |req, key| {
                req.with_arg(*key)
            });
        self.pool()?.send_sync_request(&request)
    }

    /// Detach from the pool. Later calls fail with `IllegalState`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.remove_region(&self.path);
        }
        debug!("Region handle {} closed", self.path);
    }
}

impl Drop for HaRegion {
    fn drop(&mut self) {
        self.close();
    }
}
