//! Pool-level HA manager
//!
//! Wires a connection manager, an optional redundancy manager and a
//! distribution manager together and hosts the regions that receive pushed
//! events. Regions attach through [`HaRegion`](super::HaRegion).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::endpoint_lists::{EndpointInfo, TopologySnapshot};
use super::redundancy_manager::{QueueHost, RedundancyManager};
use crate::client::ConnectionFactory;
use crate::cluster::{ConnectionManager, Locator, ServerSelector};
use crate::config::{ClientConfig, ServerLocation, TestHooks};
use crate::distribution::{
    DistributionManager, DistributionManagerKind, HaDistributionManager, StandardDistributionManager,
    MAX_AUTH_ATTEMPTS,
};
use crate::endpoint::{Endpoint, EndpointRef};
use crate::protocol::{EventId, Notification, Reply, Request};
use crate::region::{NotificationHandler, Region};
use crate::task::{BackgroundTask, Schedule, WakeSignal, Waker};
use crate::utils::{ClientError, Result};

/// State shared between the pool, its regions and the notification
/// receivers
pub(crate) struct PoolCore {
    me: Weak<PoolCore>,
    cm: Arc<ConnectionManager>,
    rm: Option<Arc<RedundancyManager>>,
    dm: DistributionManagerKind,
    regions: RwLock<HashMap<String, Arc<dyn Region>>>,
    endpoints: Mutex<HashMap<String, EndpointRef>>,
    marker_processed: AtomicBool,
    redundancy: Option<Waker>,
    secure: bool,
}

impl PoolCore {
    /// No server currently hosts the primary queue (or, without
    /// subscriptions, no endpoint is connected)
    fn is_down(&self) -> bool {
        match self.rm {
            Some(ref rm) => rm.primary().is_none(),
            None => !self.cm.endpoints().iter().any(|ep| ep.is_connected()),
        }
    }

    pub(crate) fn send_sync_request(&self, request: &Request) -> Result<Reply> {
        self.dm.send_sync_request(request, true)
    }

    pub(crate) fn add_region(&self, region: Arc<dyn Region>) -> Result<()> {
        let path = region.full_path().to_string();
        {
            let mut regions = self.regions.write();
            if regions.contains_key(&path) {
                return Err(ClientError::IllegalState(format!("region {} already attached", path)));
            }
            regions.insert(path.clone(), Arc::clone(&region));
        }
        debug!("Region {} attached", path);

        if self.is_down() {
            region.receive_notification(&Notification::all_endpoints_disconnected(&path));
        }
        Ok(())
    }

    pub(crate) fn remove_region(&self, path: &str) -> bool {
        let removed = self.regions.write().remove(path).is_some();
        if removed {
            debug!("Region {} detached", path);
        }
        removed
    }

    fn region(&self, path: &str) -> Option<Arc<dyn Region>> {
        self.regions.read().get(path).cloned()
    }

    fn all_regions(&self) -> Vec<Arc<dyn Region>> {
        self.regions.read().values().cloned().collect()
    }
}

impl QueueHost for PoolCore {
    fn add_endpoint(&self, location: &ServerLocation) -> EndpointRef {
        let name = location.name();
        self.endpoints
            .lock()
            .entry(name.clone())
            .or_insert_with(|| self.cm.attach(&name))
            .clone()
    }

    fn notification_handler(&self) -> Weak<dyn NotificationHandler> {
        let weak: Weak<dyn NotificationHandler> = self.me.clone();
        weak
    }

    fn known_endpoints(&self) -> Vec<EndpointRef> {
        self.endpoints.lock().values().cloned().collect()
    }

    fn register_interest_all_regions(&self, endpoint: &Endpoint) -> Result<()> {
        let attempts = if self.secure { MAX_AUTH_ATTEMPTS } else { 1 };
        for region in self.all_regions() {
            let mut attempt = 1;
            loop {
                match region.register_keys(endpoint) {
                    Err(ClientError::AuthenticationRequired(msg)) if attempt < attempts => {
                        debug!("{} asked for credentials again: {}", endpoint.name(), msg);
                        attempt += 1;
                    }
                    other => {
                        other?;
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn send_not_connected_to_all_regions(&self) {
        for region in self.all_regions() {
            region.receive_notification(&Notification::all_endpoints_disconnected(region.full_path()));
        }
    }
}

impl NotificationHandler for PoolCore {
    fn check_dup_and_add(&self, event_id: &EventId) -> bool {
        match self.rm {
            Some(ref rm) => rm.check_dup_and_add(event_id),
            None => true,
        }
    }

    fn is_region_attached(&self, region: &str) -> bool {
        self.regions.read().contains_key(region)
    }

    fn deliver(&self, notification: Notification) {
        match self.region(&notification.region) {
            Some(region) => region.receive_notification(&notification),
            None => debug!("Region {} went away before delivery", notification.region),
        }
    }

    fn process_marker(&self) {
        if !self.marker_processed.swap(true, Ordering::AcqRel) {
            info!("Server finished replaying queued events");
        }
        for region in self.all_regions() {
            region.set_processed_marker(true);
        }
    }
}

/// Subscriber-side HA manager for one pool
pub struct PoolHaManager {
    core: Arc<PoolCore>,
    redundancy_task: Mutex<Option<BackgroundTask>>,
    closed: AtomicBool,
}

impl PoolHaManager {
    /// Connect to the cluster and establish the queue topology.
    ///
    /// Fails on invalid configuration and on credential problems; an
    /// unreachable cluster only produces a warning and is retried by the
    /// redundancy task.
    pub fn new(
        config: ClientConfig,
        factory: Arc<dyn ConnectionFactory>,
        locator: Option<Arc<dyn Locator>>,
        hooks: TestHooks,
    ) -> Result<Self> {
        config.validate().map_err(ClientError::Config)?;

        let redundancy_signal = config.subscription_enabled.then(WakeSignal::new);
        let redundancy_waker = redundancy_signal.as_ref().map(WakeSignal::waker);
        let cm = ConnectionManager::new(&config, factory, hooks, redundancy_waker.clone());
        cm.start()
            .map_err(|e| ClientError::IllegalState(format!("failed to start background tasks: {}", e)))?;

        let selector = match ServerSelector::new(locator, config.servers.clone(), config.shuffle_endpoints) {
            Ok(selector) => selector,
            Err(e) => {
                cm.close(false);
                return Err(e);
            }
        };
        let names: Vec<String> = if config.subscription_enabled {
            config.servers.iter().map(ServerLocation::name).collect()
        } else {
            match selector.select(None, &HashSet::new()) {
                Ok(found) => found.iter().map(ServerLocation::name).collect(),
                Err(e) => {
                    cm.close(false);
                    return Err(e);
                }
            }
        };
        let secure = config.credentials.is_some();

        let core = Arc::new_cyclic(|me: &Weak<PoolCore>| {
            let standard = StandardDistributionManager::new(
                Arc::clone(&cm),
                names,
                secure,
                redundancy_waker.clone(),
            );
            let (rm, dm) = if config.subscription_enabled {
                let host: Weak<dyn QueueHost> = me.clone();
                let rm = Arc::new(RedundancyManager::new(&config, selector, host));
                let dm = DistributionManagerKind::Ha(HaDistributionManager::new(standard, Arc::clone(&rm)));
                (Some(rm), dm)
            } else {
                (None, DistributionManagerKind::Standard(standard))
            };
            PoolCore {
                me: me.clone(),
                cm: Arc::clone(&cm),
                rm,
                dm,
                regions: RwLock::new(HashMap::new()),
                endpoints: Mutex::new(HashMap::new()),
                marker_processed: AtomicBool::new(false),
                redundancy: redundancy_waker,
                secure,
            }
        });

        let pool = Self {
            core,
            redundancy_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        if let Err(e) = pool.start(&config, redundancy_signal) {
            pool.close(false);
            return Err(e);
        }
        Ok(pool)
    }

    fn start(&self, config: &ClientConfig, redundancy_signal: Option<WakeSignal>) -> Result<()> {
        if let Some(ref rm) = self.core.rm {
            rm.initialize()?;
        }

        match self.core.dm.init() {
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => warn!("Request routing not ready: {}", e),
            Ok(()) => {}
        }

        let (Some(rm), Some(signal)) = (self.core.rm.as_ref(), redundancy_signal) else {
            return Ok(());
        };
        match rm.maintain(true) {
            Err(e) if e.is_fatal_client() => return Err(e),
            Err(e) => warn!("Initial redundancy not established: {}", e),
            Ok(()) => {}
        }

        let spawn_failed = |e: std::io::Error| ClientError::IllegalState(format!("failed to start task: {}", e));
        rm.start_periodic_ack().map_err(spawn_failed)?;

        let core = Arc::downgrade(&self.core);
        let task = BackgroundTask::spawn(
            "ha-redundancy",
            signal,
            Schedule::Every(config.redundancy_monitor_interval),
            move |_| {
                let Some(core) = core.upgrade() else { return };
                if core.cm.is_net_down() {
                    return;
                }
                if let Some(ref rm) = core.rm {
                    if let Err(e) = rm.maintain(false) {
                        debug!("Redundancy check: {}", e);
                    }
                }
            },
        )
        .map_err(spawn_failed)?;
        *self.redundancy_task.lock() = Some(task);

        info!(
            "Pool started with {} endpoints (redundancy level {})",
            self.core.cm.endpoint_count(),
            config.redundancy_level
        );
        Ok(())
    }

    pub(crate) fn core(&self) -> &Arc<PoolCore> {
        &self.core
    }

    /// Route a request through the distribution manager with failover
    pub fn send_sync_request(&self, request: &Request) -> Result<Reply> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::IllegalState("pool is closed".to_string()));
        }
        self.core.send_sync_request(request)
    }

    /// Durable clients announce they are ready for queued events
    pub fn ready_for_events(&self) -> Result<()> {
        match self.core.rm {
            Some(ref rm) => rm.ready_for_events(),
            None => Err(ClientError::IllegalState(
                "ready for events needs subscriptions enabled".to_string(),
            )),
        }
    }

    pub fn add_region(&self, region: Arc<dyn Region>) -> Result<()> {
        self.core.add_region(region)
    }

    pub fn remove_region(&self, path: &str) -> bool {
        self.core.remove_region(path)
    }

    pub fn region_count(&self) -> usize {
        self.core.regions.read().len()
    }

    /// Wake the redundancy task now instead of at the next interval
    pub fn trigger_redundancy_check(&self) {
        if let Some(ref waker) = self.core.redundancy {
            waker.wake();
        }
    }

    pub fn net_down(&self) {
        self.core.cm.net_down();
        if let Some(ref rm) = self.core.rm {
            rm.net_down();
        }
    }

    pub fn revive(&self) {
        self.core.cm.revive();
    }

    pub fn redundancy_manager(&self) -> Option<&Arc<RedundancyManager>> {
        self.core.rm.as_ref()
    }

    pub fn connection_manager(&self) -> &Arc<ConnectionManager> {
        &self.core.cm
    }

    pub fn is_ha(&self) -> bool {
        self.core.dm.is_ha()
    }

    /// Current queue topology. Without subscriptions every known endpoint
    /// is listed as non-redundant.
    pub fn topology(&self) -> TopologySnapshot {
        match self.core.rm {
            Some(ref rm) => rm.snapshot(),
            None => {
                let mut endpoints = self.core.cm.endpoints();
                endpoints.sort_by(|a, b| a.name().cmp(b.name()));
                TopologySnapshot {
                    primary: None,
                    secondaries: Vec::new(),
                    nonredundant: endpoints.iter().map(EndpointInfo::of).collect(),
                }
            }
        }
    }

    /// Tear down in order: scheduled tasks, subscription receivers,
    /// regions, redundancy manager, request routing, connections.
    /// With `keep_alive` the servers keep a durable client's queues.
    pub fn close(&self, keep_alive: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(mut task) = self.redundancy_task.lock().take() {
            task.stop();
        }
        if let Some(ref rm) = self.core.rm {
            rm.stop_periodic_ack();
            rm.send_notification_close_msgs();
        }
        self.core.regions.write().clear();
        if let Some(ref rm) = self.core.rm {
            rm.close();
        }

        self.core.dm.destroy();
        let attached: Vec<EndpointRef> = self.core.endpoints.lock().drain().map(|(_, ep)| ep).collect();
        self.core.cm.disconnect(None, &attached, true);
        self.core.cm.close(keep_alive);
        info!("Pool closed{}", if keep_alive { " (keeping durable queues)" } else { "" });
    }
}

impl Drop for PoolHaManager {
    fn drop(&mut self) {
        self.close(false);
    }
}
