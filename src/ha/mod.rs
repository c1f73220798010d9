//! Subscription queue high availability
//!
//! This module provides:
//! - Duplicate suppression and acknowledgement of pushed events
//! - Primary/secondary queue maintenance
//! - The pool-level manager and per-region handles

pub mod endpoint_lists;
pub mod event_id_map;
pub mod ha_region;
pub mod pool_hadm;
pub mod redundancy_manager;

pub use endpoint_lists::{EndpointInfo, EndpointLists, TopologySnapshot};
pub use event_id_map::EventIdMap;
pub use ha_region::HaRegion;
pub use pool_hadm::PoolHaManager;
pub use redundancy_manager::{QueueHost, RedundancyManager};
