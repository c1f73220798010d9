//! Subscription queue redundancy
//!
//! Keeps one primary and up to `redundancy_level` secondary subscription
//! queues alive for a subscriber. `maintain` is a single pass over the
//! current lists that computes and commits the next topology:
//!
//! 1. Walk the redundant list. A live head stays primary; otherwise the
//!    next live entry is asked to become primary. An entry is live while it
//!    is connected and its subscription channel is still open; the rest are
//!    queued for demotion.
//! 2. If redundancy is short, refresh the candidate list (except on the
//!    initial pass) and create new queues from it.
//! 3. Durable clients on the initial pass create every queue as a
//!    secondary and then promote the best pre-existing one.
//! 4. Commit: drop demoted entries, append promoted ones, move the primary
//!    to the head and stamp queue statuses.
//! 5. Unregister the demoted endpoints.
//!
//! Retries call the same pass again with the list lock already held.

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};

use super::endpoint_lists::{contains, remove_all, EndpointLists, TopologySnapshot};
use super::event_id_map::EventIdMap;
use crate::cluster::ServerSelector;
use crate::config::{ClientConfig, ServerLocation};
use crate::distribution::send_request_to_endpoint;
use crate::endpoint::{Endpoint, EndpointRef};
use crate::protocol::{EventId, Reply, Request, ServerQueueStatus};
use crate::region::NotificationHandler;
use crate::task::{BackgroundTask, Schedule, WakeSignal};
use crate::utils::{ClientError, Result};

/// The subscriber a redundancy manager works for
pub trait QueueHost: Send + Sync {
    /// Endpoint for a candidate server, attached on first use
    fn add_endpoint(&self, location: &ServerLocation) -> EndpointRef;

    /// Every endpoint handed out by `add_endpoint` so far
    fn known_endpoints(&self) -> Vec<EndpointRef>;

    /// Receiver of the events read from this subscriber's queues
    fn notification_handler(&self) -> Weak<dyn NotificationHandler>;

    /// Replay interest registrations of every region onto a new queue
    fn register_interest_all_regions(&self, endpoint: &Endpoint) -> Result<()>;

    /// Tell every region that no server is reachable
    fn send_not_connected_to_all_regions(&self);
}

pub struct RedundancyManager {
    host: Weak<dyn QueueHost>,
    selector: ServerSelector,
    redundancy_level: i32,
    is_durable: bool,
    ha_enabled: bool,
    secure: bool,
    ack_interval: Duration,

    lists: Mutex<EndpointLists>,
    event_ids: EventIdMap,

    ready_requested: AtomicBool,
    sent_ready_for_events: AtomicBool,
    all_disconnected_sent: AtomicBool,
    level_warning_logged: AtomicBool,

    ack_task: Mutex<Option<BackgroundTask>>,
}

impl RedundancyManager {
    pub fn new(config: &ClientConfig, selector: ServerSelector, host: Weak<dyn QueueHost>) -> Self {
        Self {
            host,
            selector,
            redundancy_level: config.redundancy_level,
            is_durable: config.is_durable,
            ha_enabled: config.ha_enabled(),
            secure: config.credentials.is_some(),
            ack_interval: config.effective_ack_interval(),
            lists: Mutex::new(EndpointLists::default()),
            event_ids: EventIdMap::new(config.duplicate_check_lifetime),
            ready_requested: AtomicBool::new(false),
            sent_ready_for_events: AtomicBool::new(false),
            all_disconnected_sent: AtomicBool::new(false),
            level_warning_logged: AtomicBool::new(false),
            ack_task: Mutex::new(None),
        }
    }

    fn host(&self) -> Result<Arc<dyn QueueHost>> {
        self.host
            .upgrade()
            .ok_or_else(|| ClientError::IllegalState("subscriber already closed".to_string()))
    }

    pub fn redundancy_level(&self) -> i32 {
        self.redundancy_level
    }

    pub fn ha_enabled(&self) -> bool {
        self.ha_enabled
    }

    /// Fill the candidate list with every known server
    pub fn initialize(&self) -> Result<()> {
        let how_many = if self.selector.locators_only() && self.redundancy_level >= 0 {
            Some(self.redundancy_level as usize + 1)
        } else {
            None
        };
        let servers = self.selector.select(how_many, &HashSet::new())?;
        let host = self.host()?;
        let mut lists = self.lists.lock();
        let mut candidates: Vec<EndpointRef> = servers.iter().map(|s| host.add_endpoint(s)).collect();
        if self.is_durable {
            candidates = order_by_queue_status(candidates);
        }

        info!(
            "Redundancy level {} over {} candidate servers{}",
            self.redundancy_level,
            candidates.len(),
            if self.is_durable { " (durable)" } else { "" }
        );
        lists.nonredundant = candidates;
        lists.check_invariants(&host.known_endpoints());
        Ok(())
    }

    /// Bring the queue topology back to the configured redundancy level
    pub fn maintain(&self, is_init: bool) -> Result<()> {
        let mut lists = self.lists.lock();
        self.maintain_locked(&mut lists, is_init)
    }

    fn satisfied(&self, primary: bool, secondaries: usize) -> bool {
        primary && self.redundancy_level >= 0 && secondaries >= self.redundancy_level as usize
    }

    fn maintain_locked(&self, lists: &mut MutexGuard<'_, EndpointLists>, is_init: bool) -> Result<()> {
        let host = self.host()?;
        let mut fatal: Option<ClientError> = None;
        let mut primary: Option<EndpointRef> = None;
        let mut secondaries = 0usize;
        let mut to_demote: Vec<EndpointRef> = Vec::new();
        let mut to_promote: Vec<EndpointRef> = Vec::new();

        // Step 1: current redundant list
        for (idx, ep) in lists.redundant.iter().enumerate() {
            if self.satisfied(primary.is_some(), secondaries) {
                break;
            }
            // A reconnected endpoint whose channel broke has lost its queue
            if !ep.is_connected() || !ep.has_subscription() {
                to_demote.push(ep.clone());
                continue;
            }
            if primary.is_some() {
                secondaries += 1;
            } else if idx == 0 {
                primary = Some(ep.clone());
            } else {
                match self.send_make_primary(ep) {
                    Ok(()) => primary = Some(ep.clone()),
                    Err(e) if e.is_fatal() => {
                        fatal = Some(e);
                        break;
                    }
                    Err(e) => {
                        debug!("{} refused to become primary: {}", ep.name(), e);
                        to_demote.push(ep.clone());
                    }
                }
            }
        }

        // Step 2: candidates
        let durable_init = self.is_durable && is_init;
        if fatal.is_none() && !self.satisfied(primary.is_some(), secondaries) {
            if !is_init {
                if let Err(e) = self.refresh_candidates(lists, &to_demote, host.as_ref()) {
                    warn!("Server selection failed: {}", e);
                    if e.is_fatal() {
                        fatal = Some(e);
                    }
                }
            }

            let candidates = if fatal.is_none() {
                lists.nonredundant.clone()
            } else {
                Vec::new()
            };
            for ep in candidates {
                if self.satisfied(primary.is_some(), secondaries) {
                    break;
                }
                if durable_init {
                    if self.redundancy_level >= 0 && to_promote.len() > self.redundancy_level as usize {
                        break;
                    }
                    match self.create_queue(host.as_ref(), &ep, true) {
                        Ok(()) => to_promote.push(ep),
                        Err(e) if e.is_fatal() => {
                            fatal = Some(e);
                            break;
                        }
                        Err(e) => debug!("Could not create queue on {}: {}", ep.name(), e),
                    }
                    continue;
                }

                let make_primary = primary.is_none();
                match self.create_queue(host.as_ref(), &ep, !make_primary) {
                    Ok(()) => {
                        if make_primary {
                            primary = Some(ep.clone());
                        } else {
                            secondaries += 1;
                        }
                        to_promote.push(ep);
                    }
                    Err(e) if e.is_fatal() => {
                        fatal = Some(e);
                        break;
                    }
                    Err(e) => debug!("Could not create queue on {}: {}", ep.name(), e),
                }
            }
        }

        // Step 3: durable clients promote one of the queues just created
        if fatal.is_none() && primary.is_none() && !to_promote.is_empty() {
            let order = promotion_order(&to_promote, durable_init);
            let mut failed = Vec::new();
            for idx in order {
                let ep = &to_promote[idx];
                match self.send_make_primary(ep) {
                    Ok(()) => {
                        primary = Some(ep.clone());
                        break;
                    }
                    Err(e) if e.is_fatal() => {
                        fatal = Some(e);
                        break;
                    }
                    Err(e) => {
                        debug!("{} refused to become primary: {}", ep.name(), e);
                        failed.push(ep.clone());
                    }
                }
            }
            for ep in &failed {
                ep.unregister_listener();
            }
            remove_all(&mut to_promote, &failed);
        }

        // Step 4: commit. Without a primary nothing stays redundant.
        if primary.is_none() {
            for ep in to_promote.drain(..) {
                ep.unregister_listener();
            }
            for ep in lists.redundant.iter() {
                if !contains(&to_demote, ep) {
                    to_demote.push(ep.clone());
                }
            }
        }
        remove_all(&mut lists.redundant, &to_demote);
        remove_all(&mut lists.nonredundant, &to_promote);
        lists.redundant.extend(to_promote);
        if let Some(ref p) = primary {
            if let Some(pos) = lists.redundant.iter().position(|ep| Arc::ptr_eq(ep, p)) {
                let head = lists.redundant.remove(pos);
                lists.redundant.insert(0, head);
            }
            for (idx, ep) in lists.redundant.iter().enumerate() {
                ep.set_queue_status(if idx == 0 {
                    ServerQueueStatus::Primary
                } else {
                    ServerQueueStatus::Redundant
                });
            }
        }

        // Step 5: demoted endpoints
        for ep in to_demote {
            ep.unregister_listener();
            ep.set_queue_status(ServerQueueStatus::NonRedundant);
            if !contains(&lists.nonredundant, &ep) {
                lists.nonredundant.push(ep);
            }
        }
        lists.check_invariants(&host.known_endpoints());

        self.finish(lists, primary.is_some(), fatal, host.as_ref())
    }

    fn finish(
        &self,
        lists: &EndpointLists,
        has_primary: bool,
        fatal: Option<ClientError>,
        host: &dyn QueueHost,
    ) -> Result<()> {
        if !has_primary {
            if !self.all_disconnected_sent.swap(true, Ordering::AcqRel) {
                warn!("No subscription server reachable; notifying regions");
                host.send_not_connected_to_all_regions();
            }
            return Err(fatal.unwrap_or_else(|| {
                ClientError::NotConnected("no primary subscription server".to_string())
            }));
        }

        if self.all_disconnected_sent.swap(false, Ordering::AcqRel) {
            info!("Subscription primary restored on {}", lists.redundant[0].name());
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        let secondaries = lists.redundant.len() - 1;
        if self.satisfied(true, secondaries) {
            self.level_warning_logged.store(false, Ordering::Release);
        } else if self.redundancy_level < 0 {
            trace!("Using every available server ({} secondaries)", secondaries);
        } else if !self.level_warning_logged.swap(true, Ordering::AcqRel) {
            warn!(
                "Requested redundancy level {} is not satisfied; {} secondaries available",
                self.redundancy_level, secondaries
            );
        }
        Ok(())
    }

    /// Put a fresh selection, excluding servers already hosting a queue, at
    /// the front of the candidate list. Endpoints selected earlier stay
    /// behind it.
    fn refresh_candidates(
        &self,
        lists: &mut EndpointLists,
        to_demote: &[EndpointRef],
        host: &dyn QueueHost,
    ) -> Result<()> {
        let exclude: HashSet<ServerLocation> = lists
            .redundant
            .iter()
            .filter_map(|ep| ep.name().parse().ok())
            .collect();
        let how_many = if self.selector.locators_only() && self.redundancy_level >= 0 {
            let healthy = lists.redundant.len() - to_demote.len();
            Some((self.redundancy_level as usize + 1).saturating_sub(healthy))
        } else {
            None
        };

        let servers = self.selector.select(how_many, &exclude)?;
        let mut candidates: Vec<EndpointRef> = Vec::with_capacity(lists.nonredundant.len() + servers.len());
        for ep in servers.iter().map(|s| host.add_endpoint(s)) {
            if !contains(&lists.redundant, &ep) && !contains(&candidates, &ep) {
                candidates.push(ep);
            }
        }
        for ep in lists.nonredundant.drain(..) {
            if !contains(&candidates, &ep) {
                candidates.push(ep);
            }
        }
        lists.nonredundant = candidates;
        Ok(())
    }

    /// Open a subscription queue on `ep` and replay region interest on it
    fn create_queue(&self, host: &dyn QueueHost, ep: &EndpointRef, secondary: bool) -> Result<()> {
        ep.register_listener(secondary, host.notification_handler())?;

        let result = host.register_interest_all_regions(ep).and_then(|_| {
            if self.is_durable && self.sent_ready_for_events.load(Ordering::Acquire) {
                self.send_on(ep, &Request::client_ready()).map(|_| ())
            } else {
                Ok(())
            }
        });
        if let Err(e) = result {
            ep.unregister_listener();
            return Err(e);
        }
        debug!(
            "Created {} queue on {}",
            if secondary { "secondary" } else { "primary" },
            ep.name()
        );
        Ok(())
    }

    /// Send on one queue endpoint, logging in again if the session expired
    fn send_on(&self, ep: &EndpointRef, request: &Request) -> Result<Reply> {
        send_request_to_endpoint(ep, request, self.secure)
    }

    fn send_make_primary(&self, ep: &EndpointRef) -> Result<()> {
        if !ep.is_connected() {
            return Err(ClientError::NotConnected(ep.name().to_string()));
        }
        self.send_on(ep, &Request::make_primary(self.sent_ready_for_events.load(Ordering::Acquire)))?;
        info!("{} is now the primary subscription server", ep.name());
        Ok(())
    }

    /// True the first time `id` is seen
    pub fn check_dup_and_add(&self, id: &EventId) -> bool {
        self.event_ids.check_dup_and_add(id)
    }

    pub fn event_ids(&self) -> &EventIdMap {
        &self.event_ids
    }

    /// Acknowledge pending events to the primary, then expire old entries
    pub fn do_periodic_ack(&self) {
        if self.ha_enabled {
            let ids = self.event_ids.unacked();
            if !ids.is_empty() {
                match self.send_request_to_primary(&Request::periodic_ack(&ids)) {
                    Ok(_) => {
                        self.event_ids.mark_acked(&ids);
                        trace!("Acknowledged {} events", ids.len());
                    }
                    Err(e) => warn!("Periodic ack of {} events failed: {}", ids.len(), e),
                }
            }
        }
        self.event_ids.expire(self.ha_enabled);
    }

    pub fn start_periodic_ack(self: &Arc<Self>) -> io::Result<()> {
        let mut slot = self.ack_task.lock();
        if slot.is_some() {
            return Ok(());
        }
        let me = Arc::downgrade(self);
        *slot = Some(BackgroundTask::spawn(
            "ha-ack",
            WakeSignal::new(),
            Schedule::Every(self.ack_interval),
            move |_| {
                if let Some(rm) = me.upgrade() {
                    rm.do_periodic_ack();
                }
            },
        )?);
        Ok(())
    }

    /// Send to the primary, re-running maintenance and retrying on failure.
    /// Bounded by the number of known endpoints.
    pub fn send_request_to_primary(&self, request: &Request) -> Result<Reply> {
        let mut lists = self.lists.lock();
        let attempts = lists.total().max(1);
        for attempt in 0..attempts {
            if let Some(primary) = lists.primary().cloned() {
                match self.send_on(&primary, request) {
                    Ok(reply) => return Ok(reply),
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => debug!(
                        "{} to primary {} failed (attempt {}): {}",
                        request.verb.as_str(),
                        primary.name(),
                        attempt + 1,
                        e
                    ),
                }
            }
            match self.maintain_locked(&mut lists, false) {
                Err(e) if e.is_fatal() => return Err(e),
                _ => {}
            }
        }
        Err(ClientError::NotConnected(format!(
            "no primary accepted {}",
            request.verb.as_str()
        )))
    }

    /// Continuous-query requests go to every secondary, then the primary
    pub fn send_sync_request_cq(&self, request: &Request) -> Result<Reply> {
        let secondaries: Vec<EndpointRef> = self.lists.lock().secondaries().to_vec();
        for ep in &secondaries {
            if let Err(e) = self.send_on(ep, request) {
                if e.is_fatal() {
                    return Err(e);
                }
                debug!("{} on secondary {} failed: {}", request.verb.as_str(), ep.name(), e);
            }
        }
        self.send_request_to_primary(request)
    }

    /// Register interest on one endpoint, or on every queue with the
    /// primary last
    pub fn send_sync_request_register_interest(
        &self,
        request: &Request,
        endpoint: Option<&EndpointRef>,
    ) -> Result<Reply> {
        if let Some(ep) = endpoint {
            return self.send_on(ep, request);
        }

        let (secondaries, short) = {
            let lists = self.lists.lock();
            let short = self.redundancy_level >= 0 && lists.redundant.len() < self.redundancy_level as usize + 1;
            (lists.secondaries().to_vec(), short)
        };

        let mut failed = false;
        for ep in &secondaries {
            if let Err(e) = self.send_on(ep, request) {
                if e.is_fatal() {
                    return Err(e);
                }
                debug!("Interest registration on {} failed: {}", ep.name(), e);
                failed = true;
            }
        }
        if failed || short {
            if let Err(e) = self.maintain(false) {
                if e.is_fatal() {
                    return Err(e);
                }
            }
        }
        self.send_request_to_primary(request)
    }

    /// Durable clients announce they can take queued events. Only once.
    pub fn ready_for_events(&self) -> Result<()> {
        if !self.is_durable {
            return Err(ClientError::IllegalState(
                "ready for events is only valid for durable clients".to_string(),
            ));
        }
        if self.ready_requested.swap(true, Ordering::AcqRel) {
            return Err(ClientError::IllegalState("ready for events already sent".to_string()));
        }

        let mut lists = self.lists.lock();
        let attempts = lists.total().max(1);
        for _ in 0..attempts {
            if let Some(primary) = lists.primary().cloned() {
                match self.send_on(&primary, &Request::client_ready()) {
                    Ok(_) => {
                        self.sent_ready_for_events.store(true, Ordering::Release);
                        info!("Sent ready for events to {}", primary.name());
                        return Ok(());
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => debug!("Ready for events on {} failed: {}", primary.name(), e),
                }
            }
            match self.maintain_locked(&mut lists, false) {
                Err(e) if e.is_fatal() => return Err(e),
                _ => {}
            }
        }
        Err(ClientError::NotConnected("no primary accepted ready for events".to_string()))
    }

    pub fn sent_ready_for_events(&self) -> bool {
        self.sent_ready_for_events.load(Ordering::Acquire)
    }

    /// Stop every queue's receiver without waiting, then wait for all
    pub fn send_notification_close_msgs(&self) {
        let redundant: Vec<EndpointRef> = self.lists.lock().redundant.clone();
        let receivers: Vec<_> = redundant.iter().filter_map(|ep| ep.stop_subscription()).collect();
        for receiver in receivers {
            receiver.join();
        }
    }

    /// Every queue is considered lost; the next pass starts over
    pub fn net_down(&self) {
        let mut lists = self.lists.lock();
        let redundant: Vec<EndpointRef> = lists.redundant.drain(..).collect();
        for ep in redundant {
            ep.unregister_listener();
            ep.set_queue_status(ServerQueueStatus::NonRedundant);
            if !contains(&lists.nonredundant, &ep) {
                lists.nonredundant.push(ep);
            }
        }
        if let Ok(host) = self.host() {
            lists.check_invariants(&host.known_endpoints());
        }
    }

    pub fn is_acking(&self) -> bool {
        self.ack_task.lock().is_some()
    }

    pub fn stop_periodic_ack(&self) {
        if let Some(mut task) = self.ack_task.lock().take() {
            task.stop();
        }
    }

    /// Stop acking and give up every queue
    pub fn close(&self) {
        self.stop_periodic_ack();
        self.net_down();
        debug!("Redundancy manager closed");
    }

    pub fn primary(&self) -> Option<EndpointRef> {
        self.lists.lock().primary().cloned()
    }

    pub fn redundant(&self) -> Vec<EndpointRef> {
        self.lists.lock().redundant.clone()
    }

    pub fn nonredundant(&self) -> Vec<EndpointRef> {
        self.lists.lock().nonredundant.clone()
    }

    pub fn is_redundant(&self, endpoint: &EndpointRef) -> bool {
        self.lists.lock().is_redundant(endpoint)
    }

    pub fn snapshot(&self) -> TopologySnapshot {
        self.lists.lock().snapshot()
    }
}

/// Durable clients reconnect to their old queues first: former primary,
/// then redundant queues by size, then everything else
fn order_by_queue_status(candidates: Vec<EndpointRef>) -> Vec<EndpointRef> {
    let mut ranked: Vec<(u8, u64, EndpointRef)> = candidates
        .into_iter()
        .map(|ep| {
            let (status, size) = match ep.fresh_queue_status() {
                Ok(hs) => (hs.queue_status, hs.queue_size),
                Err(e) => {
                    debug!("Queue status probe of {} failed: {}", ep.name(), e);
                    (ServerQueueStatus::NonRedundant, 0)
                }
            };
            let rank = match status {
                ServerQueueStatus::Primary => 0,
                ServerQueueStatus::Redundant => 1,
                ServerQueueStatus::NonRedundant => 2,
            };
            (rank, size, ep)
        })
        .collect();
    ranked.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
    ranked.into_iter().map(|(_, _, ep)| ep).collect()
}

/// Order in which freshly created queues are tried as primary. Durable
/// clients on the initial pass prefer a queue that existed before; the
/// rest are tried from the back.
fn promotion_order(created: &[EndpointRef], prefer_existing: bool) -> Vec<usize> {
    let mut order: Vec<usize> = (0..created.len()).rev().collect();
    if !prefer_existing {
        return order;
    }
    let preferred = created
        .iter()
        .position(|ep| ep.queue_status() == ServerQueueStatus::Primary)
        .or_else(|| {
            created
                .iter()
                .enumerate()
                .filter(|(_, ep)| ep.queue_status() == ServerQueueStatus::Redundant)
                .max_by_key(|(idx, ep)| (ep.queue_size(), std::cmp::Reverse(*idx)))
                .map(|(idx, _)| idx)
        });
    if let Some(p) = preferred {
        order.retain(|&i| i != p);
        order.insert(0, p);
    }
    order
}
