//! Client-side handle to one cache server
//!
//! An endpoint owns a bounded pool of operation connections and, while at
//! least one listener is registered, one subscription connection with its
//! notification receiver. The connected flag only changes through a single
//! compare-and-swap so concurrent observers of a failure count it once.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use super::subscription::SubscriptionReceiver;
use crate::client::{Connection, ConnectionFactory, ConnectionPool, PooledConnection};
use crate::config::{ClientConfig, Credentials};
use crate::protocol::codec;
use crate::protocol::{ChannelKind, Handshake, Reply, Request, ServerQueueStatus};
use crate::region::NotificationHandler;
use crate::task::Waker;
use crate::utils::{ClientError, ConnectionError, Result};

/// Consecutive ping timeouts tolerated before the endpoint is marked down
pub const MAX_PING_TIMEOUTS: u32 = 2;

/// Subscription connects get this multiple of the connect timeout
const SUBSCRIPTION_CONNECT_FACTOR: u32 = 3;

pub type EndpointRef = Arc<Endpoint>;

/// Connection lifecycle of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndpointState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Active,
}

impl EndpointState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => EndpointState::Connecting,
            2 => EndpointState::Connected,
            3 => EndpointState::Authenticating,
            4 => EndpointState::Active,
            _ => EndpointState::Disconnected,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            EndpointState::Disconnected => 0,
            EndpointState::Connecting => 1,
            EndpointState::Connected => 2,
            EndpointState::Authenticating => 3,
            EndpointState::Active => 4,
        }
    }
}

/// Per-endpoint connection settings
#[derive(Debug, Clone)]
pub struct EndpointSettings {
    pub max_connections: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub credentials: Option<Credentials>,
}

impl EndpointSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            connect_timeout: config.connect_timeout,
            read_timeout: config.read_timeout,
            credentials: config.credentials.clone(),
        }
    }
}

/// Where an endpoint reports failures and retired receivers
#[derive(Clone, Default)]
pub struct EndpointSignals {
    pub failover: Option<Waker>,
    pub redundancy: Option<Waker>,
    pub retire: Option<Sender<SubscriptionReceiver>>,
}

#[derive(Default)]
struct SubscriptionSlot {
    listeners: usize,
    receiver: Option<SubscriptionReceiver>,
}

#[derive(Debug, Clone, Copy, Default)]
struct QueueInfo {
    status: ServerQueueStatus,
    size: u64,
}

pub struct Endpoint {
    name: String,
    settings: EndpointSettings,
    factory: Arc<dyn ConnectionFactory>,
    signals: EndpointSignals,
    pool: ConnectionPool,

    connected: AtomicBool,
    state: AtomicU8,
    authenticated: AtomicBool,
    auth_epoch: AtomicU64,
    failure_count: AtomicU32,
    num_regions: AtomicUsize,
    queue: Mutex<QueueInfo>,

    msg_sent: AtomicBool,
    ping_sent: AtomicBool,
    ping_timeouts: AtomicU32,
    next_transaction_id: AtomicI64,

    subscription: Mutex<SubscriptionSlot>,
}

impl Endpoint {
    pub fn new(
        name: &str,
        settings: EndpointSettings,
        factory: Arc<dyn ConnectionFactory>,
        signals: EndpointSignals,
    ) -> Self {
        Self {
            name: name.to_string(),
            pool: ConnectionPool::new(name, settings.max_connections),
            settings,
            factory,
            signals,
            connected: AtomicBool::new(false),
            state: AtomicU8::new(EndpointState::Disconnected.as_u8()),
            authenticated: AtomicBool::new(false),
            auth_epoch: AtomicU64::new(0),
            failure_count: AtomicU32::new(0),
            num_regions: AtomicUsize::new(0),
            queue: Mutex::new(QueueInfo::default()),
            msg_sent: AtomicBool::new(false),
            ping_sent: AtomicBool::new(false),
            ping_timeouts: AtomicU32::new(0),
            next_transaction_id: AtomicI64::new(1),
            subscription: Mutex::new(SubscriptionSlot::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn state(&self) -> EndpointState {
        EndpointState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: EndpointState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Relaxed)
    }

    pub fn num_regions(&self) -> usize {
        self.num_regions.load(Ordering::Acquire)
    }

    /// Only called with the connection manager's registry lock held
    pub(crate) fn acquire_ref(&self) -> usize {
        self.num_regions.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Only called with the connection manager's registry lock held
    pub(crate) fn release_ref(&self) -> usize {
        let prev = self
            .num_regions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        prev.saturating_sub(1)
    }

    pub fn queue_status(&self) -> ServerQueueStatus {
        self.queue.lock().status
    }

    pub fn queue_size(&self) -> u64 {
        self.queue.lock().size
    }

    pub fn set_queue_status(&self, status: ServerQueueStatus) {
        self.queue.lock().status = status;
    }

    pub(crate) fn record_handshake(&self, handshake: &Handshake) {
        let mut queue = self.queue.lock();
        queue.status = handshake.queue_status;
        queue.size = handshake.queue_size;
    }

    pub fn listener_count(&self) -> usize {
        self.subscription.lock().listeners
    }

    pub fn has_subscription(&self) -> bool {
        self.subscription.lock().receiver.is_some()
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Flip the connected flag. Returns true when this call made the
    /// transition; the disconnect side effects run exactly once per edge.
    pub fn set_connection_status(&self, connected: bool) -> bool {
        if connected {
            if self
                .connected
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return false;
            }
            self.ping_timeouts.store(0, Ordering::Relaxed);
            self.set_state(if self.settings.credentials.is_some() {
                EndpointState::Connected
            } else {
                EndpointState::Active
            });
            info!("Endpoint {} connected", self.name);
            true
        } else {
            if self
                .connected
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return false;
            }
            self.set_state(EndpointState::Disconnected);
            let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
            self.reset_authentication();
            self.pool.clear();
            warn!("Endpoint {} disconnected (failures: {})", self.name, failures);
            if let Some(ref waker) = self.signals.failover {
                waker.wake();
            }
            if let Some(ref waker) = self.signals.redundancy {
                waker.wake();
            }
            true
        }
    }

    fn open(&self, kind: ChannelKind) -> std::result::Result<Box<dyn Connection>, ConnectionError> {
        let timeout = match kind {
            ChannelKind::Subscription { .. } => self.settings.connect_timeout * SUBSCRIPTION_CONNECT_FACTOR,
            _ => self.settings.connect_timeout,
        };
        self.factory.connect(&self.name, kind, timeout)
    }

    /// Open the first operation connection if the endpoint is down
    pub fn register(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.set_state(EndpointState::Connecting);
        let mut conn = match self.open(ChannelKind::Operation) {
            Ok(conn) => conn,
            Err(e) => {
                self.set_state(EndpointState::Disconnected);
                debug!("Failed to connect to {}: {}", self.name, e);
                return Err(e.into());
            }
        };
        if conn.handshake().requires_auth && self.settings.credentials.is_none() {
            conn.close();
            self.set_state(EndpointState::Disconnected);
            return Err(ClientError::AuthenticationRequired(format!(
                "{} requires credentials",
                self.name
            )));
        }
        self.pool.seed(conn);
        self.set_connection_status(true);
        Ok(())
    }

    /// Short-lived probe of the server's view of this client's queue
    pub fn fresh_queue_status(&self) -> Result<Handshake> {
        let mut conn = self.open(ChannelKind::Probe)?;
        let handshake = conn.handshake().clone();
        conn.close();
        trace!(
            "Queue on {} is {:?} with {} events",
            self.name,
            handshake.queue_status,
            handshake.queue_size
        );
        Ok(handshake)
    }

    /// Force every pooled connection to log in again before its next request
    pub fn reset_authentication(&self) {
        self.auth_epoch.fetch_add(1, Ordering::AcqRel);
        self.authenticated.store(false, Ordering::Release);
    }

    /// Authenticate one pooled connection (at most once per connection and
    /// authentication epoch)
    pub fn authenticate(&self) -> Result<()> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected(self.name.clone()));
        }
        let mut conn = self.checkout()?;
        match self.ensure_authenticated(&mut conn) {
            Ok(()) => {
                self.pool.checkin(conn);
                Ok(())
            }
            Err(e) => {
                self.pool.discard(conn);
                Err(e)
            }
        }
    }

    fn ensure_authenticated(&self, conn: &mut PooledConnection) -> Result<()> {
        let Some(ref credentials) = self.settings.credentials else {
            return Ok(());
        };
        let epoch = self.auth_epoch.load(Ordering::Acquire);
        if conn.auth_epoch == Some(epoch) {
            return Ok(());
        }
        self.set_state(EndpointState::Authenticating);
        let request = Request::user_credential(&credentials.username, &credentials.password);
        let reply = self.round_trip(conn, &request, self.settings.read_timeout)?;
        reply.into_result().map_err(|e| match e {
            ClientError::ServerException { message, .. } => ClientError::AuthenticationFailed(message),
            other => other,
        })?;
        conn.auth_epoch = Some(epoch);
        self.authenticated.store(true, Ordering::Release);
        self.set_state(EndpointState::Active);
        debug!("Authenticated connection to {}", self.name);
        Ok(())
    }

    fn checkout(&self) -> Result<PooledConnection> {
        match self
            .pool
            .checkout(self.settings.connect_timeout, || self.open(ChannelKind::Operation))
        {
            Ok(conn) => Ok(conn),
            Err(e @ ClientError::Io(_)) => {
                self.set_connection_status(false);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn round_trip(&self, conn: &mut PooledConnection, request: &Request, timeout: Duration) -> Result<Reply> {
        let transaction_id = self.next_transaction_id.fetch_add(1, Ordering::Relaxed);
        let frame = codec::encode_request(request, transaction_id);
        let bytes = conn.connection().send(&frame, timeout)?;
        let reply = codec::decode_reply(&bytes)?;
        if reply.transaction_id != transaction_id {
            warn!(
                "Reply from {} carries transaction {} (sent {}); dropping connection",
                self.name, reply.transaction_id, transaction_id
            );
            return Err(ClientError::NotConnected(format!(
                "{}: transaction id mismatch",
                self.name
            )));
        }
        Ok(reply)
    }

    /// Send a request with the configured read timeout
    pub fn send(&self, request: &Request) -> Result<Reply> {
        self.send_with_timeout(request, self.settings.read_timeout)
    }

    pub fn send_with_timeout(&self, request: &Request, timeout: Duration) -> Result<Reply> {
        let tolerant = request.verb.is_timeout_tolerant();
        let reply = self.send_with_retry(request, timeout, request.verb.max_send_retries(), !tolerant)?;
        self.msg_sent.store(true, Ordering::Release);
        reply.into_result().map_err(|e| {
            if matches!(e, ClientError::AuthenticationRequired(_)) {
                self.reset_authentication();
            }
            e
        })
    }

    fn send_with_retry(
        &self,
        request: &Request,
        timeout: Duration,
        retries: u32,
        timeout_marks_failure: bool,
    ) -> Result<Reply> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected(self.name.clone()));
        }
        let mut attempt = 0;
        loop {
            let mut conn = self.checkout()?;
            let outcome = self
                .ensure_authenticated(&mut conn)
                .and_then(|_| self.round_trip(&mut conn, request, timeout));

            match outcome {
                Ok(reply) => {
                    self.pool.checkin(conn);
                    return Ok(reply);
                }
                Err(ClientError::Io(e)) if e.is_transient() && attempt < retries => {
                    self.pool.discard(conn);
                    attempt += 1;
                    debug!("Retrying {} on {} after {}", request.verb.as_str(), self.name, e);
                }
                Err(ClientError::Timeout(msg)) if attempt < retries => {
                    self.pool.discard(conn);
                    attempt += 1;
                    debug!("Retrying {} on {} after timeout ({})", request.verb.as_str(), self.name, msg);
                }
                Err(e @ ClientError::Io(_)) => {
                    self.pool.discard(conn);
                    self.set_connection_status(false);
                    return Err(e);
                }
                Err(e @ ClientError::Timeout(_)) => {
                    self.pool.discard(conn);
                    if timeout_marks_failure {
                        self.set_connection_status(false);
                    }
                    return Err(e);
                }
                Err(e) => {
                    self.pool.discard(conn);
                    return Err(e);
                }
            }
        }
    }

    /// Keep-alive check run by the ping task. Endpoints with traffic since
    /// the last tick are skipped.
    pub fn ping_server(&self) {
        if !self.is_connected() {
            return;
        }
        let had_traffic = self.msg_sent.swap(false, Ordering::AcqRel);
        let pinged = self.ping_sent.swap(false, Ordering::AcqRel);
        if had_traffic || pinged {
            return;
        }
        match self.send_with_retry(&Request::ping(), self.settings.read_timeout, 0, false) {
            Ok(_) => {
                self.ping_sent.store(true, Ordering::Release);
                self.ping_timeouts.store(0, Ordering::Relaxed);
            }
            Err(ClientError::Timeout(_)) => {
                let timeouts = self.ping_timeouts.fetch_add(1, Ordering::AcqRel) + 1;
                if timeouts > MAX_PING_TIMEOUTS {
                    warn!("Ping to {} timed out {} times in a row", self.name, timeouts);
                    self.set_connection_status(false);
                }
            }
            Err(e) => debug!("Ping to {} failed: {}", self.name, e),
        }
    }

    /// Add a subscription listener. The first listener opens the
    /// subscription channel in the given role and starts its receiver.
    pub fn register_listener(
        self: &Arc<Self>,
        secondary: bool,
        handler: Weak<dyn NotificationHandler>,
    ) -> Result<()> {
        if !self.is_connected() {
            self.register()?;
        }

        let mut slot = self.subscription.lock();
        slot.listeners += 1;
        if slot.listeners > 1 {
            return Ok(());
        }

        let result = self
            .open(ChannelKind::Subscription { secondary })
            .map_err(ClientError::from)
            .and_then(|conn| {
                self.record_handshake(conn.handshake());
                SubscriptionReceiver::spawn(Arc::downgrade(self), &self.name, conn, handler)
                    .map_err(|e| ClientError::Io(ConnectionError::Io(e)))
            });

        match result {
            Ok(receiver) => {
                slot.receiver = Some(receiver);
                debug!(
                    "Subscription channel to {} open as {}",
                    self.name,
                    if secondary { "secondary" } else { "primary" }
                );
                Ok(())
            }
            Err(e) => {
                slot.listeners = 0;
                drop(slot);
                warn!("Failed to open subscription channel to {}: {}", self.name, e);
                self.set_connection_status(false);
                Err(e)
            }
        }
    }

    /// Drop a subscription listener; the last one closes the channel and
    /// hands the receiver over for deferred teardown.
    pub fn unregister_listener(&self) {
        let receiver = {
            let mut slot = self.subscription.lock();
            if slot.listeners == 0 {
                return;
            }
            slot.listeners -= 1;
            if slot.listeners > 0 {
                return;
            }
            slot.receiver.take()
        };
        if let Some(receiver) = receiver {
            receiver.stop_noblock();
            self.retire(receiver);
            debug!("Subscription channel to {} closed", self.name);
        }
    }

    /// Stop the receiver without touching the listener count; the caller
    /// joins it.
    pub fn stop_subscription(&self) -> Option<SubscriptionReceiver> {
        let receiver = self.subscription.lock().receiver.take();
        if let Some(ref r) = receiver {
            r.stop_noblock();
        }
        receiver
    }

    /// Called from the receiver thread when its channel breaks
    pub(crate) fn subscription_lost(&self) {
        let receiver = {
            let mut slot = self.subscription.lock();
            slot.listeners = 0;
            slot.receiver.take()
        };
        if let Some(receiver) = receiver {
            receiver.mark_stopped();
            self.retire(receiver);
        }
        self.set_connection_status(false);
    }

    fn retire(&self, receiver: SubscriptionReceiver) {
        if let Some(ref retire) = self.signals.retire {
            if retire.send(receiver).is_err() {
                trace!("Cleanup task gone; detaching receiver for {}", self.name);
            }
        }
    }

    /// Close everything this endpoint holds
    pub fn shutdown(&self) {
        let receiver = {
            let mut slot = self.subscription.lock();
            slot.listeners = 0;
            slot.receiver.take()
        };
        if let Some(receiver) = receiver {
            receiver.stop_noblock();
            self.retire(receiver);
        }
        self.connected.store(false, Ordering::Release);
        self.set_state(EndpointState::Disconnected);
        self.pool.clear();
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("queue_status", &self.queue_status())
            .field("failures", &self.failure_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{NotificationKind, Verb};
    use crate::testing::{endpoint_settings, wait_until, MockCluster, RecordingHandler};

    fn endpoint(cluster: &Arc<MockCluster>, name: &str) -> EndpointRef {
        Arc::new(Endpoint::new(
            name,
            endpoint_settings(),
            cluster.clone(),
            EndpointSignals::default(),
        ))
    }

    #[test]
    fn test_register_and_send() {
        let cluster = MockCluster::new(&["s1:1"]);
        let ep = endpoint(&cluster, "s1:1");
        ep.register().unwrap();
        assert!(ep.is_connected());
        assert_eq!(ep.state(), EndpointState::Active);

        ep.send(&Request::new(Verb::Get)).unwrap();
        assert_eq!(cluster.server("s1:1").requests_of(Verb::Get), 1);
        assert_eq!(ep.pool().idle_count(), 1);
    }

    #[test]
    fn test_send_requires_connection() {
        let cluster = MockCluster::new(&["s1:1"]);
        let ep = endpoint(&cluster, "s1:1");
        let err = ep.send(&Request::new(Verb::Get)).unwrap_err();
        assert!(matches!(err, ClientError::NotConnected(_)));
    }

    #[test]
    fn test_connection_status_counts_each_edge_once() {
        let cluster = MockCluster::new(&["s1:1"]);
        let ep = endpoint(&cluster, "s1:1");
        ep.register().unwrap();

        assert!(ep.set_connection_status(false));
        assert!(!ep.set_connection_status(false));
        assert_eq!(ep.failure_count(), 1);
        assert_eq!(ep.state(), EndpointState::Disconnected);
        assert_eq!(ep.pool().idle_count(), 0);
    }

    #[test]
    fn test_io_failure_marks_disconnected() {
        let cluster = MockCluster::new(&["s1:1"]);
        let ep = endpoint(&cluster, "s1:1");
        ep.register().unwrap();
        cluster.kill("s1:1");

        let err = ep.send(&Request::new(Verb::Put)).unwrap_err();
        assert!(matches!(err, ClientError::Io(_)));
        assert!(!ep.is_connected());
        assert_eq!(ep.failure_count(), 1);
    }

    #[test]
    fn test_timeout_on_tolerant_verb_keeps_endpoint() {
        let cluster = MockCluster::new(&["s1:1"]);
        let ep = endpoint(&cluster, "s1:1");
        ep.register().unwrap();
        cluster.server("s1:1").timeout_verb(Verb::Query);

        let err = ep.send(&Request::new(Verb::Query)).unwrap_err();
        assert!(err.is_timeout());
        assert!(ep.is_connected());
        assert_eq!(cluster.server("s1:1").requests_of(Verb::Query), 1);
    }

    #[test]
    fn test_timeout_retries_once_then_marks_failure() {
        let cluster = MockCluster::new(&["s1:1"]);
        let ep = endpoint(&cluster, "s1:1");
        ep.register().unwrap();
        cluster.server("s1:1").timeout_verb(Verb::Get);

        let err = ep.send(&Request::new(Verb::Get)).unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(cluster.server("s1:1").requests_of(Verb::Get), 2);
        assert!(!ep.is_connected());
    }

    #[test]
    fn test_transaction_mismatch_is_not_connected() {
        let cluster = MockCluster::new(&["s1:1"]);
        let ep = endpoint(&cluster, "s1:1");
        ep.register().unwrap();
        cluster.server("s1:1").corrupt_transaction_ids(true);

        let err = ep.send(&Request::new(Verb::Get)).unwrap_err();
        assert!(matches!(err, ClientError::NotConnected(_)));
        assert_eq!(ep.pool().idle_count(), 0);
    }

    #[test]
    fn test_authenticates_once_per_connection() {
        let cluster = MockCluster::new(&["s1:1"]);
        cluster.server("s1:1").set_password(Some("secret"));
        let mut settings = endpoint_settings();
        settings.credentials = Some(Credentials {
            username: "app".to_string(),
            password: "secret".to_string(),
        });
        let ep = Arc::new(Endpoint::new("s1:1", settings, cluster.clone(), EndpointSignals::default()));
        ep.register().unwrap();
        assert_eq!(ep.state(), EndpointState::Connected);

        ep.send(&Request::new(Verb::Get)).unwrap();
        ep.send(&Request::new(Verb::Get)).unwrap();
        assert!(ep.is_authenticated());
        assert_eq!(ep.state(), EndpointState::Active);
        assert_eq!(cluster.server("s1:1").requests_of(Verb::UserCredential), 1);
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let cluster = MockCluster::new(&["s1:1"]);
        cluster.server("s1:1").set_password(Some("secret"));
        let ep = endpoint(&cluster, "s1:1");
        let err = ep.register().unwrap_err();
        assert!(matches!(err, ClientError::AuthenticationRequired(_)));
        assert!(!ep.is_connected());
    }

    #[test]
    fn test_wrong_password_fails_authentication() {
        let cluster = MockCluster::new(&["s1:1"]);
        cluster.server("s1:1").set_password(Some("secret"));
        let mut settings = endpoint_settings();
        settings.credentials = Some(Credentials {
            username: "app".to_string(),
            password: "wrong".to_string(),
        });
        let ep = Arc::new(Endpoint::new("s1:1", settings, cluster.clone(), EndpointSignals::default()));
        ep.register().unwrap();
        let err = ep.authenticate().unwrap_err();
        assert!(matches!(err, ClientError::AuthenticationFailed(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_ping_skips_busy_endpoint() {
        let cluster = MockCluster::new(&["s1:1"]);
        let ep = endpoint(&cluster, "s1:1");
        ep.register().unwrap();
        ep.send(&Request::new(Verb::Get)).unwrap();

        ep.ping_server();
        assert_eq!(cluster.server("s1:1").requests_of(Verb::Ping), 0);
        ep.ping_server();
        assert_eq!(cluster.server("s1:1").requests_of(Verb::Ping), 1);
    }

    #[test]
    fn test_ping_timeouts_mark_endpoint_down() {
        let cluster = MockCluster::new(&["s1:1"]);
        let ep = endpoint(&cluster, "s1:1");
        ep.register().unwrap();
        cluster.server("s1:1").timeout_verb(Verb::Ping);

        for _ in 0..MAX_PING_TIMEOUTS {
            ep.ping_server();
            assert!(ep.is_connected());
        }
        ep.ping_server();
        assert!(!ep.is_connected());
    }

    #[test]
    fn test_listener_refcount_controls_channel() {
        let cluster = MockCluster::new(&["s1:1"]);
        let ep = endpoint(&cluster, "s1:1");
        let handler = Arc::new(RecordingHandler::new(&["/orders"]));
        let weak: Weak<dyn NotificationHandler> = Arc::downgrade(&handler) as Weak<dyn NotificationHandler>;

        ep.register_listener(true, weak.clone()).unwrap();
        ep.register_listener(true, weak).unwrap();
        assert_eq!(ep.listener_count(), 2);
        assert_eq!(cluster.server("s1:1").subscriber_count(), 1);

        ep.unregister_listener();
        assert!(ep.has_subscription());
        ep.unregister_listener();
        assert!(!ep.has_subscription());
        assert_eq!(ep.listener_count(), 0);
    }

    #[test]
    fn test_subscription_delivers_and_dedups() {
        let cluster = MockCluster::new(&["s1:1"]);
        let ep = endpoint(&cluster, "s1:1");
        let handler = Arc::new(RecordingHandler::new(&["/orders"]));
        ep.register_listener(false, Arc::downgrade(&handler) as Weak<dyn NotificationHandler>)
            .unwrap();

        let server = cluster.server("s1:1");
        server.push_event(NotificationKind::Create, "/orders", 1);
        server.push_event(NotificationKind::Create, "/orders", 1);
        server.push_event(NotificationKind::Update, "/orders", 2);

        assert!(wait_until(|| handler.delivered_count() == 2));
        assert_eq!(handler.delivered_count(), 2);
        ep.unregister_listener();
    }

    #[test]
    fn test_failed_subscription_rolls_back() {
        let cluster = MockCluster::new(&["s1:1"]);
        cluster.server("s1:1").reject_subscriptions(true);
        let ep = endpoint(&cluster, "s1:1");
        let handler = Arc::new(RecordingHandler::new(&[]));

        let err = ep
            .register_listener(true, Arc::downgrade(&handler) as Weak<dyn NotificationHandler>)
            .unwrap_err();
        assert!(matches!(err, ClientError::Io(_)));
        assert_eq!(ep.listener_count(), 0);
        assert!(!ep.is_connected());
    }

    #[test]
    fn test_broken_subscription_marks_endpoint_down() {
        let cluster = MockCluster::new(&["s1:1"]);
        let ep = endpoint(&cluster, "s1:1");
        let handler = Arc::new(RecordingHandler::new(&[]));
        ep.register_listener(false, Arc::downgrade(&handler) as Weak<dyn NotificationHandler>)
            .unwrap();

        cluster.kill("s1:1");
        assert!(wait_until(|| !ep.is_connected()));
        assert_eq!(ep.listener_count(), 0);
        assert!(!ep.has_subscription());
    }

    #[test]
    fn test_fresh_queue_status_reads_handshake() {
        let cluster = MockCluster::new(&["s1:1"]);
        cluster
            .server("s1:1")
            .set_queue(ServerQueueStatus::Redundant, 42);
        let ep = endpoint(&cluster, "s1:1");
        let handshake = ep.fresh_queue_status().unwrap();
        assert_eq!(handshake.queue_status, ServerQueueStatus::Redundant);
        assert_eq!(handshake.queue_size, 42);
    }
}
