//! Candidate server selection

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::config::ServerLocation;
use crate::utils::{ClientError, Result};

/// Server discovery service
pub trait Locator: Send + Sync {
    /// Up to `how_many` servers (all when `None`) not in `exclude`
    fn select_servers(
        &self,
        how_many: Option<usize>,
        exclude: &HashSet<ServerLocation>,
    ) -> Result<Vec<ServerLocation>>;
}

/// Picks candidate servers from a locator, or round-robin from a static
/// list when no locator is configured.
pub struct ServerSelector {
    locator: Option<Arc<dyn Locator>>,
    servers: Vec<ServerLocation>,
    cursor: Mutex<usize>,
}

impl ServerSelector {
    pub fn new(
        locator: Option<Arc<dyn Locator>>,
        servers: Vec<ServerLocation>,
        shuffle: bool,
    ) -> Result<Self> {
        if locator.is_none() && servers.is_empty() {
            return Err(ClientError::IllegalState(
                "no locators or servers configured".to_string(),
            ));
        }
        let cursor = if shuffle && !servers.is_empty() {
            fastrand::usize(..servers.len())
        } else {
            0
        };
        Ok(Self {
            locator,
            servers,
            cursor: Mutex::new(cursor),
        })
    }

    /// A locator is configured and there is no static list
    pub fn locators_only(&self) -> bool {
        self.locator.is_some() && self.servers.is_empty()
    }

    pub fn select(
        &self,
        how_many: Option<usize>,
        exclude: &HashSet<ServerLocation>,
    ) -> Result<Vec<ServerLocation>> {
        if how_many == Some(0) {
            return Ok(Vec::new());
        }
        match self.locator {
            Some(ref locator) if self.servers.is_empty() => {
                match locator.select_servers(how_many, exclude) {
                    Ok(found) => Ok(found.into_iter().filter(|s| !exclude.contains(s)).collect()),
                    Err(ClientError::NoLocatorsAvailable) => {
                        warn!("No locators available for server selection");
                        Ok(Vec::new())
                    }
                    Err(ClientError::AuthenticationRequired(msg)) => {
                        warn!("Locator requires authentication: {}", msg);
                        Ok(Vec::new())
                    }
                    Err(e) => Err(e),
                }
            }
            _ => Ok(self.round_robin(how_many, exclude)),
        }
    }

    fn round_robin(&self, how_many: Option<usize>, exclude: &HashSet<ServerLocation>) -> Vec<ServerLocation> {
        let len = self.servers.len();
        let wanted = how_many.unwrap_or(len);
        let mut cursor = self.cursor.lock();
        let mut picked = Vec::new();

        for _ in 0..len {
            if picked.len() >= wanted {
                break;
            }
            let server = &self.servers[*cursor % len];
            *cursor = (*cursor + 1) % len;
            if !exclude.contains(server) {
                picked.push(server.clone());
            }
        }
        trace!("Selected {} of {} static servers", picked.len(), len);
        picked
    }
}
