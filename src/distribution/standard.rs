//! Single active endpoint with random failover

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::{send_request_to_endpoint, DistributionManager};
use crate::cluster::{ConnectionManager, FailoverListener};
use crate::endpoint::{Endpoint, EndpointRef};
use crate::protocol::{Reply, Request};
use crate::task::Waker;
use crate::utils::{ClientError, Result};

pub struct StandardDistributionManager {
    me: Weak<StandardDistributionManager>,
    cm: Arc<ConnectionManager>,
    names: Vec<String>,
    secure: bool,
    post_failover: Option<Waker>,

    endpoints: RwLock<Vec<EndpointRef>>,
    active: AtomicUsize,
    failover_lock: Mutex<()>,
    destroyed: AtomicBool,
}

impl StandardDistributionManager {
    /// `names` empty means every endpoint the connection manager knows.
    /// `post_failover` is woken after the active endpoint changes.
    pub fn new(
        cm: Arc<ConnectionManager>,
        names: Vec<String>,
        secure: bool,
        post_failover: Option<Waker>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            cm,
            names,
            secure,
            post_failover,
            endpoints: RwLock::new(Vec::new()),
            active: AtomicUsize::new(0),
            failover_lock: Mutex::new(()),
            destroyed: AtomicBool::new(false),
        })
    }

    fn listener(&self) -> Weak<dyn FailoverListener> {
        let weak: Weak<dyn FailoverListener> = self.me.clone();
        weak
    }

    pub fn endpoints(&self) -> Vec<EndpointRef> {
        self.endpoints.read().clone()
    }

    pub fn active_endpoint(&self) -> Option<EndpointRef> {
        let endpoints = self.endpoints.read();
        endpoints.get(self.active.load(Ordering::Acquire)).cloned()
    }

    /// Switch away from the active endpoint. With `force` the active one is
    /// only retried after every other endpoint failed.
    fn switch_endpoint(&self, force: bool) -> Result<()> {
        let _guard = self.failover_lock.lock();
        let endpoints = self.endpoints();
        if endpoints.is_empty() {
            return Err(ClientError::NotConnected("no endpoints configured".to_string()));
        }
        let current = self.active.load(Ordering::Acquire) % endpoints.len();
        if !force && endpoints[current].is_connected() {
            return Ok(());
        }

        let mut order: Vec<usize> = (0..endpoints.len()).filter(|&i| i != current).collect();
        fastrand::shuffle(&mut order);
        order.push(current);

        for idx in order {
            let ep = &endpoints[idx];
            match ep.register() {
                Ok(()) => {
                    self.active.store(idx, Ordering::Release);
                    if idx != current {
                        info!("Failed over from {} to {}", endpoints[current].name(), ep.name());
                    }
                    if let Some(ref waker) = self.post_failover {
                        waker.wake();
                    }
                    return Ok(());
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => debug!("Failover candidate {} rejected: {}", ep.name(), e),
            }
        }
        Err(ClientError::NotConnected("no endpoint accepted a connection".to_string()))
    }
}

impl DistributionManager for StandardDistributionManager {
    fn init(&self) -> Result<()> {
        let endpoints = self.cm.connect(Some(self.listener()), &self.names);
        if endpoints.is_empty() {
            warn!("No endpoints available for request routing");
            return Ok(());
        }
        let active = fastrand::usize(..endpoints.len());
        self.active.store(active, Ordering::Release);
        let first = endpoints[active].clone();
        *self.endpoints.write() = endpoints;

        if let Err(e) = first.register() {
            if e.is_fatal() {
                return Err(e);
            }
            debug!("Initial endpoint {} unavailable: {}", first.name(), e);
            match self.switch_endpoint(true) {
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("No endpoint reachable yet: {}", e),
                Ok(()) => {}
            }
        }
        Ok(())
    }

    fn send_sync_request(&self, request: &Request, attempt_failover: bool) -> Result<Reply> {
        let total = self.endpoints.read().len();
        if total == 0 {
            return Err(ClientError::NotConnected("no endpoints configured".to_string()));
        }

        let mut failovers = 0;
        loop {
            let result = match self.active_endpoint() {
                Some(ep) if ep.is_connected() || ep.register().is_ok() => {
                    send_request_to_endpoint(&ep, request, self.secure)
                }
                Some(ep) => Err(ClientError::NotConnected(ep.name().to_string())),
                None => Err(ClientError::NotConnected("no active endpoint".to_string())),
            };

            let err = match result {
                Ok(reply) => return Ok(reply),
                Err(e) => e,
            };
            if err.is_timeout() && request.verb.is_timeout_tolerant() {
                return Err(err);
            }
            if err.is_fatal() || !attempt_failover || failovers >= total {
                return Err(err.into_top_level());
            }

            failovers += 1;
            debug!("{} failed ({}); failing over", request.verb.as_str(), err);
            if let Err(e) = self.switch_endpoint(true) {
                return Err(e.into_top_level());
            }
        }
    }

    fn failover(&self) -> Result<()> {
        self.switch_endpoint(false)
    }

    fn is_endpoint_attached(&self, endpoint: &Endpoint) -> bool {
        self.endpoints
            .read()
            .iter()
            .any(|ep| std::ptr::eq(Arc::as_ptr(ep), endpoint))
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let endpoints: Vec<EndpointRef> = self.endpoints.write().drain(..).collect();
        self.cm.disconnect(Some(&self.listener()), &endpoints, true);
    }
}

impl FailoverListener for StandardDistributionManager {
    fn failover(&self) {
        if self.destroyed.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.switch_endpoint(false) {
            debug!("Background failover found no endpoint: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TestHooks;
    use crate::protocol::Verb;
    use crate::testing::{test_config, wait_until, MockCluster};

    fn setup(cluster: &Arc<MockCluster>, servers: &[&str]) -> (Arc<ConnectionManager>, Arc<StandardDistributionManager>) {
        let cm = ConnectionManager::new(&test_config(servers), cluster.clone(), TestHooks::default(), None);
        cm.start().unwrap();
        let names = servers.iter().map(|s| s.to_string()).collect();
        let dm = StandardDistributionManager::new(cm.clone(), names, false, None);
        dm.init().unwrap();
        (cm, dm)
    }

    #[test]
    fn test_sends_to_active_endpoint() {
        let servers = ["s1:1", "s2:1", "s3:1"];
        let cluster = MockCluster::new(&servers);
        let (cm, dm) = setup(&cluster, &servers);

        dm.send_sync_request(&Request::new(Verb::Get), true).unwrap();
        let active = dm.active_endpoint().unwrap();
        assert_eq!(cluster.server(active.name()).requests_of(Verb::Get), 1);
        assert!(dm.is_endpoint_attached(&active));

        dm.destroy();
        cm.close(false);
    }

    #[test]
    fn test_fails_over_when_active_dies() {
        let servers = ["s1:1", "s2:1", "s3:1"];
        let cluster = MockCluster::new(&servers);
        let (cm, dm) = setup(&cluster, &servers);

        let dead = dm.active_endpoint().unwrap().name().to_string();
        cluster.kill(&dead);
        dm.send_sync_request(&Request::new(Verb::Put), true).unwrap();

        let active = dm.active_endpoint().unwrap();
        assert_ne!(active.name(), dead);
        assert_eq!(cluster.server(active.name()).requests_of(Verb::Put), 1);
        dm.destroy();
        cm.close(false);
    }

    #[test]
    fn test_no_failover_when_disabled() {
        let servers = ["s1:1", "s2:1"];
        let cluster = MockCluster::new(&servers);
        let (cm, dm) = setup(&cluster, &servers);

        let dead = dm.active_endpoint().unwrap().name().to_string();
        cluster.kill(&dead);
        let err = dm.send_sync_request(&Request::new(Verb::Put), false).unwrap_err();
        assert!(matches!(err, ClientError::NotConnected(_)));
        assert_eq!(cluster.server(&dead).requests_of(Verb::Put), 1);
        dm.destroy();
        cm.close(false);
    }

    #[test]
    fn test_tolerant_timeout_returned_directly() {
        let servers = ["s1:1", "s2:1"];
        let cluster = MockCluster::new(&servers);
        let (cm, dm) = setup(&cluster, &servers);

        let active = dm.active_endpoint().unwrap().name().to_string();
        cluster.server(&active).timeout_verb(Verb::ExecuteFunction);
        let err = dm.send_sync_request(&Request::new(Verb::ExecuteFunction), true).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(dm.active_endpoint().unwrap().name(), active);
        assert!(dm.active_endpoint().unwrap().is_connected());
        dm.destroy();
        cm.close(false);
    }

    #[test]
    fn test_all_down_is_not_connected() {
        let servers = ["s1:1", "s2:1"];
        let cluster = MockCluster::new(&servers);
        let (cm, dm) = setup(&cluster, &servers);
        for s in servers {
            cluster.kill(s);
        }
        let err = dm.send_sync_request(&Request::new(Verb::Get), true).unwrap_err();
        assert!(matches!(err, ClientError::NotConnected(_)));
        dm.destroy();
        cm.close(false);
    }

    #[test]
    fn test_server_exception_propagates_verbatim() {
        let servers = ["s1:1"];
        let cluster = MockCluster::new(&servers);
        let (cm, dm) = setup(&cluster, &servers);
        cluster.server("s1:1").fail_verb(Verb::Put, "CacheWriterException");
        let err = dm.send_sync_request(&Request::new(Verb::Put), true).unwrap_err();
        match err {
            ClientError::ServerException { class, .. } => assert_eq!(class, "CacheWriterException"),
            other => panic!("unexpected error {other:?}"),
        }
        dm.destroy();
        cm.close(false);
    }

    #[test]
    fn test_background_failover_after_disconnect() {
        let servers = ["s1:1", "s2:1"];
        let cluster = MockCluster::new(&servers);
        let (cm, dm) = setup(&cluster, &servers);

        let first = dm.active_endpoint().unwrap();
        cluster.kill(first.name());
        first.set_connection_status(false);
        assert!(wait_until(|| dm.active_endpoint().unwrap().name() != first.name()));
        dm.destroy();
        cm.close(false);
    }

    #[test]
    fn test_reauthenticates_on_auth_required() {
        let servers = ["s1:1"];
        let cluster = MockCluster::new(&servers);
        cluster.server("s1:1").set_password(Some("pw"));
        let mut config = test_config(&servers);
        config.credentials = Some(crate::config::Credentials {
            username: "u".to_string(),
            password: "pw".to_string(),
        });
        let cm = ConnectionManager::new(&config, cluster.clone(), TestHooks::default(), None);
        cm.start().unwrap();
        let dm = StandardDistributionManager::new(cm.clone(), vec!["s1:1".to_string()], true, None);
        dm.init().unwrap();

        dm.send_sync_request(&Request::new(Verb::Get), true).unwrap();
        cluster.server("s1:1").expire_sessions();
        dm.send_sync_request(&Request::new(Verb::Get), true).unwrap();
        assert_eq!(cluster.server("s1:1").requests_of(Verb::UserCredential), 2);
        dm.destroy();
        cm.close(false);
    }
}
