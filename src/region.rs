//! Collaborator interfaces on the region side
//!
//! Regions own local storage and interest lists; the connectivity core only
//! pushes events into them and asks them to re-register interest when a new
//! subscription queue is created.

use crate::endpoint::Endpoint;
use crate::protocol::{EventId, Notification};
use crate::utils::Result;

/// A cache region attached to a pool
pub trait Region: Send + Sync {
    /// Full path, e.g. `/orders`
    fn full_path(&self) -> &str;

    /// Deliver a pushed event (already deduplicated)
    fn receive_notification(&self, notification: &Notification);

    /// Send this region's interest registrations to `endpoint`
    fn register_keys(&self, endpoint: &Endpoint) -> Result<()>;

    /// The server finished replaying queued events for this client
    fn set_processed_marker(&self, _processed: bool) {}
}

/// Consumer of notifications read from an endpoint's subscription channel
pub trait NotificationHandler: Send + Sync {
    /// True when the event has not been seen before
    fn check_dup_and_add(&self, event_id: &EventId) -> bool;

    /// Whether a region with this path is attached to the subscriber
    fn is_region_attached(&self, region: &str) -> bool;

    fn deliver(&self, notification: Notification);

    fn process_marker(&self);
}
