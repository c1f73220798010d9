//! Redundant / non-redundant endpoint lists of one subscriber

use std::sync::Arc;

use serde::Serialize;

use crate::endpoint::{EndpointRef, EndpointState};
use crate::protocol::ServerQueueStatus;

/// Index 0 of `redundant` is the primary once one is established. The two
/// lists never share an endpoint and together hold every endpoint the
/// subscriber knows.
#[derive(Default)]
pub struct EndpointLists {
    pub redundant: Vec<EndpointRef>,
    pub nonredundant: Vec<EndpointRef>,
}

impl EndpointLists {
    pub fn primary(&self) -> Option<&EndpointRef> {
        self.redundant.first()
    }

    pub fn secondaries(&self) -> &[EndpointRef] {
        self.redundant.get(1..).unwrap_or(&[])
    }

    pub fn total(&self) -> usize {
        self.redundant.len() + self.nonredundant.len()
    }

    pub fn is_redundant(&self, endpoint: &EndpointRef) -> bool {
        contains(&self.redundant, endpoint)
    }

    /// The lists are disjoint and their union is exactly `known`
    pub fn check_invariants(&self, known: &[EndpointRef]) -> bool {
        let disjoint = !self.redundant.iter().any(|ep| contains(&self.nonredundant, ep));
        debug_assert!(disjoint, "endpoint present in both redundancy lists");
        let complete = self.total() == known.len()
            && known
                .iter()
                .all(|ep| contains(&self.redundant, ep) || contains(&self.nonredundant, ep));
        debug_assert!(complete, "redundancy lists lost track of a known endpoint");
        disjoint && complete
    }

    pub fn snapshot(&self) -> TopologySnapshot {
        TopologySnapshot {
            primary: self.primary().map(|ep| EndpointInfo::of(ep)),
            secondaries: self.secondaries().iter().map(|ep| EndpointInfo::of(ep)).collect(),
            nonredundant: self.nonredundant.iter().map(|ep| EndpointInfo::of(ep)).collect(),
        }
    }
}

pub fn contains(list: &[EndpointRef], endpoint: &EndpointRef) -> bool {
    list.iter().any(|ep| Arc::ptr_eq(ep, endpoint))
}

/// Remove every entry of `remove` from `list`, keeping the order of the rest
pub fn remove_all(list: &mut Vec<EndpointRef>, remove: &[EndpointRef]) {
    list.retain(|ep| !contains(remove, ep));
}

/// Point-in-time view of one endpoint
#[derive(Debug, Clone, Serialize)]
pub struct EndpointInfo {
    pub name: String,
    pub connected: bool,
    pub state: EndpointState,
    pub queue_status: ServerQueueStatus,
    pub queue_size: u64,
    pub failures: u32,
    pub users: usize,
}

impl EndpointInfo {
    pub fn of(ep: &EndpointRef) -> Self {
        Self {
            name: ep.name().to_string(),
            connected: ep.is_connected(),
            state: ep.state(),
            queue_status: ep.queue_status(),
            queue_size: ep.queue_size(),
            failures: ep.failure_count(),
            users: ep.num_regions(),
        }
    }
}

/// Queue topology as reported by the probe binary
#[derive(Debug, Clone, Default, Serialize)]
pub struct TopologySnapshot {
    pub primary: Option<EndpointInfo>,
    pub secondaries: Vec<EndpointInfo>,
    pub nonredundant: Vec<EndpointInfo>,
}

impl TopologySnapshot {
    pub fn primary_name(&self) -> Option<&str> {
        self.primary.as_ref().map(|p| p.name.as_str())
    }

    pub fn secondary_names(&self) -> Vec<&str> {
        self.secondaries.iter().map(|s| s.name.as_str()).collect()
    }
}
