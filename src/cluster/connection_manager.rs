//! Process-wide endpoint registry
//!
//! The connection manager owns every `Endpoint` the client knows about and
//! runs the background tasks shared by all of them:
//! - ping: keeps idle endpoints alive and detects silent failures
//! - failover: asks subscribers to pick a new endpoint after a disconnect
//! - cleanup: joins notification receivers once they have stopped
//!
//! Reference counts on endpoints only change while the registry lock is
//! held, so lookup and last-reference removal never race.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::client::ConnectionFactory;
use crate::config::{ClientConfig, TestHooks};
use crate::endpoint::{Endpoint, EndpointRef, EndpointSettings, EndpointSignals, SubscriptionReceiver};
use crate::protocol::Request;
use crate::task::{BackgroundTask, Schedule, WakeSignal, Waker};

/// How often the cleanup task looks for stopped receivers
const CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

/// Something that re-selects endpoints when one of them fails
pub trait FailoverListener: Send + Sync {
    fn failover(&self);
}

#[derive(Default)]
struct Tasks {
    ping: Option<BackgroundTask>,
    failover: Option<BackgroundTask>,
    cleanup: Option<BackgroundTask>,
}

pub struct ConnectionManager {
    settings: EndpointSettings,
    factory: Arc<dyn ConnectionFactory>,
    hooks: TestHooks,
    ping_interval: Duration,

    registry: Mutex<HashMap<String, EndpointRef>>,
    subscribers: Mutex<Vec<Weak<dyn FailoverListener>>>,

    signals: EndpointSignals,
    failover_signal: Mutex<Option<WakeSignal>>,
    retired: Receiver<SubscriptionReceiver>,
    retiring: Mutex<Vec<SubscriptionReceiver>>,

    tasks: Mutex<Tasks>,
    net_down: AtomicBool,
    closed: AtomicBool,
}

impl ConnectionManager {
    /// Create the manager. Background tasks start with [`start`](Self::start).
    /// Endpoint disconnects wake `redundancy` when given.
    pub fn new(
        config: &ClientConfig,
        factory: Arc<dyn ConnectionFactory>,
        hooks: TestHooks,
        redundancy: Option<Waker>,
    ) -> Arc<Self> {
        let failover_signal = WakeSignal::new();
        let (retire_tx, retired) = unbounded();
        let signals = EndpointSignals {
            failover: Some(failover_signal.waker()),
            redundancy,
            retire: Some(retire_tx),
        };

        Arc::new(Self {
            settings: EndpointSettings::from_config(config),
            factory,
            hooks,
            ping_interval: config.ping_interval,
            registry: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
            signals,
            failover_signal: Mutex::new(Some(failover_signal)),
            retired,
            retiring: Mutex::new(Vec::new()),
            tasks: Mutex::new(Tasks::default()),
            net_down: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Spawn the ping, failover and cleanup tasks
    pub fn start(self: &Arc<Self>) -> io::Result<()> {
        let mut tasks = self.tasks.lock();
        if tasks.failover.is_some() {
            return Ok(());
        }

        let me = Arc::downgrade(self);
        tasks.ping = Some(BackgroundTask::spawn(
            "cm-ping",
            WakeSignal::new(),
            Schedule::Every(self.ping_interval),
            move |control| {
                let Some(cm) = me.upgrade() else { return };
                if cm.is_net_down() {
                    return;
                }
                for ep in cm.endpoints() {
                    if !control.is_running() {
                        break;
                    }
                    ep.ping_server();
                }
            },
        )?);

        if let Some(signal) = self.failover_signal.lock().take() {
            let me = Arc::downgrade(self);
            tasks.failover = Some(BackgroundTask::spawn(
                "cm-failover",
                signal,
                Schedule::OnWake,
                move |control| {
                    let Some(cm) = me.upgrade() else { return };
                    if cm.is_net_down() {
                        return;
                    }
                    for subscriber in cm.live_subscribers() {
                        if !control.is_running() {
                            break;
                        }
                        subscriber.failover();
                    }
                },
            )?);
        }

        let me = Arc::downgrade(self);
        tasks.cleanup = Some(BackgroundTask::spawn(
            "cm-cleanup",
            WakeSignal::new(),
            Schedule::Every(CLEANUP_INTERVAL),
            move |_| {
                if let Some(cm) = me.upgrade() {
                    cm.reap_receivers();
                }
            },
        )?);

        debug!("Connection manager started (ping every {:?})", self.ping_interval);
        Ok(())
    }

    fn new_endpoint(&self, name: &str) -> EndpointRef {
        Arc::new(Endpoint::new(
            name,
            self.settings.clone(),
            Arc::clone(&self.factory),
            self.signals.clone(),
        ))
    }

    /// Attach `subscriber` to the named endpoints, creating unknown ones.
    /// An empty name list attaches to every endpoint already registered.
    pub fn connect(&self, subscriber: Option<Weak<dyn FailoverListener>>, names: &[String]) -> Vec<EndpointRef> {
        let attached = {
            let mut registry = self.registry.lock();
            let attached: Vec<EndpointRef> = if names.is_empty() {
                registry.values().cloned().collect()
            } else {
                names
                    .iter()
                    .map(|name| {
                        registry
                            .entry(name.clone())
                            .or_insert_with(|| self.new_endpoint(name))
                            .clone()
                    })
                    .collect()
            };
            for ep in &attached {
                ep.acquire_ref();
            }
            attached
        };

        if let Some(subscriber) = subscriber {
            self.subscribers.lock().push(subscriber);
        }
        trace!("Attached {} endpoints", attached.len());
        attached
    }

    /// Release `subscriber`'s references. Endpoints losing their last
    /// reference are shut down and dropped unless `keep_endpoints` is set.
    pub fn disconnect(
        &self,
        subscriber: Option<&Weak<dyn FailoverListener>>,
        endpoints: &[EndpointRef],
        keep_endpoints: bool,
    ) {
        if let Some(subscriber) = subscriber {
            self.subscribers.lock().retain(|s| !Weak::ptr_eq(s, subscriber));
        }

        let released: Vec<EndpointRef> = {
            let mut registry = self.registry.lock();
            endpoints
                .iter()
                .filter(|ep| ep.release_ref() == 0 && !keep_endpoints)
                .filter_map(|ep| registry.remove(ep.name()))
                .collect()
        };

        for ep in released {
            debug!("Endpoint {} has no more users; removing", ep.name());
            ep.shutdown();
        }
    }

    /// Reference a single endpoint by name
    pub fn attach(&self, name: &str) -> EndpointRef {
        let mut registry = self.registry.lock();
        let ep = registry
            .entry(name.to_string())
            .or_insert_with(|| self.new_endpoint(name))
            .clone();
        ep.acquire_ref();
        ep
    }

    /// Drop one reference to `endpoint`
    pub fn detach(&self, endpoint: &EndpointRef) {
        self.disconnect(None, std::slice::from_ref(endpoint), false);
    }

    pub fn endpoint(&self, name: &str) -> Option<EndpointRef> {
        self.registry.lock().get(name).cloned()
    }

    pub fn endpoints(&self) -> Vec<EndpointRef> {
        self.registry.lock().values().cloned().collect()
    }

    pub fn endpoint_count(&self) -> usize {
        self.registry.lock().len()
    }

    fn live_subscribers(&self) -> Vec<Arc<dyn FailoverListener>> {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|s| s.strong_count() > 0);
        subscribers.iter().filter_map(Weak::upgrade).collect()
    }

    /// Wake the failover task
    pub fn trigger_failover(&self) {
        if let Some(ref waker) = self.signals.failover {
            waker.wake();
        }
    }

    pub fn is_net_down(&self) -> bool {
        self.net_down.load(Ordering::Acquire)
    }

    /// Simulate losing the network: every endpoint goes down and the
    /// background tasks idle until [`revive`](Self::revive).
    pub fn net_down(&self) {
        if self.net_down.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!("Network marked down");
        for ep in self.endpoints() {
            ep.set_connection_status(false);
        }
    }

    pub fn revive(&self) {
        if !self.net_down.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("Network revived");
        self.trigger_failover();
        if let Some(ref waker) = self.signals.redundancy {
            waker.wake();
        }
    }

    /// Join receivers that have stopped; keep the rest for the next pass
    fn reap_receivers(&self) {
        let mut retiring = self.retiring.lock();
        retiring.extend(self.retired.try_iter());
        if retiring.is_empty() {
            return;
        }
        let (finished, running): (Vec<_>, Vec<_>) = retiring.drain(..).partition(|r| r.is_finished());
        *retiring = running;
        drop(retiring);

        for receiver in finished {
            trace!("Reaping notification receiver for {}", receiver.endpoint());
            receiver.join();
        }
    }

    /// Shut down every endpoint and background task. With `keep_alive` the
    /// servers keep this client's durable queues.
    pub fn close(&self, keep_alive: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if self.hooks.simulate_durable_crash {
            info!("Skipping close messages (simulated crash)");
        } else {
            let request = Request::close_connection(keep_alive);
            for ep in self.endpoints().iter().filter(|ep| ep.is_connected()) {
                if let Err(e) = ep.send(&request) {
                    debug!("Close message to {} failed: {}", ep.name(), e);
                }
            }
        }

        {
            let mut tasks = self.tasks.lock();
            for mut task in [tasks.ping.take(), tasks.failover.take(), tasks.cleanup.take()]
                .into_iter()
                .flatten()
            {
                task.stop();
            }
        }

        let endpoints: Vec<EndpointRef> = self.registry.lock().drain().map(|(_, ep)| ep).collect();
        for ep in &endpoints {
            ep.shutdown();
        }
        self.subscribers.lock().clear();

        let mut pending: Vec<SubscriptionReceiver> = self.retiring.lock().drain(..).collect();
        pending.extend(self.retired.try_iter());
        for receiver in pending {
            receiver.join();
        }
        info!("Connection manager closed ({} endpoints)", endpoints.len());
    }
}
