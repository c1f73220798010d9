//! In-memory cluster used by unit tests
//!
//! `MockCluster` implements `ConnectionFactory`; every connection it opens
//! talks to a `MockServer` through the real frame codec.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::client::{Connection, ConnectionFactory, Interrupt};
use crate::cluster::Locator;
use crate::config::{ClientConfig, ServerLocation};
use crate::endpoint::{Endpoint, EndpointSettings};
use crate::protocol::codec;
use crate::protocol::{
    ChannelKind, EventId, Handshake, Notification, NotificationKind, Reply, Request, ServerQueueStatus, Verb,
};
use crate::region::{NotificationHandler, Region};
use crate::utils::{ClientError, ConnectionError, Result};

const POLL_STEP: Duration = Duration::from_millis(5);
const WAIT_LIMIT: Duration = Duration::from_secs(2);

pub fn endpoint_settings() -> EndpointSettings {
    EndpointSettings {
        max_connections: 4,
        connect_timeout: Duration::from_millis(200),
        read_timeout: Duration::from_millis(200),
        credentials: None,
    }
}

pub fn test_config(servers: &[&str]) -> ClientConfig {
    ClientConfig {
        servers: servers.iter().map(|s| s.parse().unwrap()).collect(),
        shuffle_endpoints: false,
        client_id: "test-client".to_string(),
        max_connections: 4,
        connect_timeout: Duration::from_millis(200),
        read_timeout: Duration::from_millis(200),
        ping_interval: Duration::from_secs(3600),
        redundancy_monitor_interval: Duration::from_secs(3600),
        ack_interval: Duration::from_secs(3600),
        ..ClientConfig::default()
    }
}

pub fn durable_config(servers: &[&str]) -> ClientConfig {
    ClientConfig {
        is_durable: true,
        ..test_config(servers)
    }
}

/// Poll `check` until it holds or two seconds pass
pub fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT_LIMIT;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(POLL_STEP);
    }
    check()
}

#[derive(Default)]
struct ServerState {
    up: bool,
    generation: u64,
    requests: Vec<Verb>,
    timeout_verbs: HashSet<Verb>,
    failing_verbs: HashMap<Verb, String>,
    corrupt_transaction_ids: bool,
    password: Option<String>,
    session_epoch: u64,
    reject_subscriptions: bool,
    queue_status: ServerQueueStatus,
    queue_size: u64,
    subscribers: HashMap<u64, Sender<Vec<u8>>>,
    acked: Vec<EventId>,
    close_messages: Vec<bool>,
}

/// One fake cache server
pub struct MockServer {
    name: String,
    state: Mutex<ServerState>,
    next_subscriber: AtomicU64,
}

impl MockServer {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(ServerState {
                up: true,
                ..ServerState::default()
            }),
            next_subscriber: AtomicU64::new(0),
        }
    }

    pub fn requests_of(&self, verb: Verb) -> usize {
        self.state.lock().requests.iter().filter(|v| **v == verb).count()
    }

    /// Never answer `verb`; the caller sees a read timeout
    pub fn timeout_verb(&self, verb: Verb) {
        self.state.lock().timeout_verbs.insert(verb);
    }

    /// Answer `verb` with a server exception of class `class`
    pub fn fail_verb(&self, verb: Verb, class: &str) {
        self.state.lock().failing_verbs.insert(verb, class.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.timeout_verbs.clear();
        state.failing_verbs.clear();
    }

    pub fn corrupt_transaction_ids(&self, corrupt: bool) {
        self.state.lock().corrupt_transaction_ids = corrupt;
    }

    pub fn set_password(&self, password: Option<&str>) {
        self.state.lock().password = password.map(str::to_string);
    }

    /// Forget every login; the next request on any connection needs
    /// credentials again
    pub fn expire_sessions(&self) {
        self.state.lock().session_epoch += 1;
    }

    pub fn reject_subscriptions(&self, reject: bool) {
        self.state.lock().reject_subscriptions = reject;
    }

    pub fn set_queue(&self, status: ServerQueueStatus, size: u64) {
        let mut state = self.state.lock();
        state.queue_status = status;
        state.queue_size = size;
    }

    pub fn queue_status(&self) -> ServerQueueStatus {
        self.state.lock().queue_status
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    pub fn push_event(&self, kind: NotificationKind, region: &str, sequence: i64) {
        self.push(Notification::new(kind, region).with_event_id(EventId::new(b"member-1".to_vec(), 1, sequence)));
    }

    /// Send `notification` on every open subscription channel
    pub fn push(&self, notification: Notification) {
        let frame = codec::encode_notification(&notification);
        for tx in self.state.lock().subscribers.values() {
            let _ = tx.send(frame.clone());
        }
    }

    pub fn acked(&self) -> Vec<EventId> {
        self.state.lock().acked.clone()
    }

    pub fn close_messages(&self) -> Vec<bool> {
        self.state.lock().close_messages.clone()
    }

    fn handle(
        &self,
        request: &Request,
        transaction_id: i64,
        generation: u64,
        session: &mut Option<u64>,
    ) -> std::result::Result<Reply, ConnectionError> {
        let mut state = self.state.lock();
        state.requests.push(request.verb);
        if !state.up || state.generation != generation {
            return Err(ConnectionError::Closed);
        }
        if state.timeout_verbs.contains(&request.verb) {
            return Err(ConnectionError::Timeout(200));
        }
        let reply_id = if state.corrupt_transaction_ids {
            transaction_id + 1000
        } else {
            transaction_id
        };

        if request.verb == Verb::UserCredential {
            let given = request.args.get(1).map(|p| String::from_utf8_lossy(p).into_owned());
            if state.password.is_some() && given != state.password {
                return Ok(Reply::exception(reply_id, "AuthenticationFailedException", "bad credentials"));
            }
            *session = Some(state.session_epoch);
            return Ok(Reply::ok(reply_id));
        }
        if state.password.is_some() && *session != Some(state.session_epoch) {
            return Ok(Reply::exception(reply_id, "AuthenticationRequiredException", "login first"));
        }
        if let Some(class) = state.failing_verbs.get(&request.verb) {
            return Ok(Reply::exception(reply_id, class, "injected failure"));
        }

        match request.verb {
            Verb::MakePrimary => state.queue_status = ServerQueueStatus::Primary,
            Verb::PeriodicAck => {
                let ids: Vec<EventId> = request.args.iter().filter_map(|a| EventId::from_bytes(a).ok()).collect();
                state.acked.extend(ids);
            }
            Verb::CloseConnection => {
                let keep_alive = request.args.first().is_some_and(|a| a.as_slice() == b"1");
                state.close_messages.push(keep_alive);
                if !keep_alive {
                    state.queue_status = ServerQueueStatus::NonRedundant;
                    state.queue_size = 0;
                }
            }
            _ => {}
        }
        Ok(Reply::ok(reply_id))
    }
}

/// Fake cluster keyed by endpoint name
pub struct MockCluster {
    servers: HashMap<String, Arc<MockServer>>,
}

impl MockCluster {
    pub fn new(names: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            servers: names
                .iter()
                .map(|n| (n.to_string(), Arc::new(MockServer::new(n))))
                .collect(),
        })
    }

    pub fn server(&self, name: &str) -> Arc<MockServer> {
        Arc::clone(&self.servers[name])
    }

    /// Take a server down; open connections break and its queue is lost
    pub fn kill(&self, name: &str) {
        let server = self.server(name);
        let mut state = server.state.lock();
        state.up = false;
        state.generation += 1;
        state.queue_status = ServerQueueStatus::NonRedundant;
        state.queue_size = 0;
        state.subscribers.clear();
    }

    pub fn revive(&self, name: &str) {
        self.server(name).state.lock().up = true;
    }
}

impl ConnectionFactory for MockCluster {
    fn connect(
        &self,
        endpoint: &str,
        kind: ChannelKind,
        _timeout: Duration,
    ) -> std::result::Result<Box<dyn Connection>, ConnectionError> {
        let refused = || ConnectionError::ConnectFailed {
            endpoint: endpoint.to_string(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"),
        };
        let server = self.servers.get(endpoint).cloned().ok_or_else(refused)?;

        let mut state = server.state.lock();
        if !state.up {
            return Err(refused());
        }
        let handshake = Handshake {
            queue_status: state.queue_status,
            queue_size: state.queue_size,
            requires_auth: state.password.is_some(),
        };

        let mut inbox = None;
        let mut subscriber_id = None;
        if let ChannelKind::Subscription { secondary } = kind {
            if state.reject_subscriptions {
                return Err(ConnectionError::HandshakeFailed {
                    endpoint: endpoint.to_string(),
                    reason: "subscriptions rejected".to_string(),
                });
            }
            state.queue_status = if secondary {
                ServerQueueStatus::Redundant
            } else {
                ServerQueueStatus::Primary
            };
            let (tx, rx) = unbounded();
            let id = server.next_subscriber.fetch_add(1, Ordering::Relaxed);
            state.subscribers.insert(id, tx);
            inbox = Some(rx);
            subscriber_id = Some(id);
        }
        let generation = state.generation;
        drop(state);

        Ok(Box::new(MockConnection {
            server,
            generation,
            handshake,
            session: None,
            inbox,
            subscriber_id,
            interrupted: Arc::new(AtomicBool::new(false)),
            closed: false,
        }))
    }
}

struct MockConnection {
    server: Arc<MockServer>,
    generation: u64,
    handshake: Handshake,
    session: Option<u64>,
    inbox: Option<Receiver<Vec<u8>>>,
    subscriber_id: Option<u64>,
    interrupted: Arc<AtomicBool>,
    closed: bool,
}

impl MockConnection {
    fn is_dead(&self) -> bool {
        let state = self.server.state.lock();
        !state.up || state.generation != self.generation
    }
}

impl Connection for MockConnection {
    fn send(&mut self, frame: &[u8], _timeout: Duration) -> std::result::Result<Vec<u8>, ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        let (request, transaction_id) = codec::decode_request(frame)
            .map_err(|e| ConnectionError::Io(io::Error::new(io::ErrorKind::InvalidData, e.to_string())))?;
        let reply = self
            .server
            .handle(&request, transaction_id, self.generation, &mut self.session)?;
        Ok(codec::encode_reply(&reply))
    }

    fn receive(&mut self, timeout: Duration) -> std::result::Result<Option<Vec<u8>>, ConnectionError> {
        let Some(inbox) = self.inbox.clone() else {
            return Err(ConnectionError::Closed);
        };
        let deadline = Instant::now() + timeout;
        loop {
            if self.closed || self.interrupted.load(Ordering::Acquire) || self.is_dead() {
                return Err(ConnectionError::Closed);
            }
            if let Ok(frame) = inbox.recv_timeout(POLL_STEP) {
                return Ok(Some(frame));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
        }
    }

    fn handshake(&self) -> &Handshake {
        &self.handshake
    }

    fn interrupt_handle(&self) -> Option<Interrupt> {
        let flag = Arc::clone(&self.interrupted);
        Some(Box::new(move || flag.store(true, Ordering::Release)))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(id) = self.subscriber_id.take() {
            self.server.state.lock().subscribers.remove(&id);
        }
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.close();
    }
}

/// Notification handler that records what reaches it
pub struct RecordingHandler {
    regions: HashSet<String>,
    seen: Mutex<HashSet<EventId>>,
    delivered: Mutex<Vec<Notification>>,
    markers: AtomicUsize,
}

impl RecordingHandler {
    pub fn new(regions: &[&str]) -> Self {
        Self {
            regions: regions.iter().map(|r| r.to_string()).collect(),
            seen: Mutex::new(HashSet::new()),
            delivered: Mutex::new(Vec::new()),
            markers: AtomicUsize::new(0),
        }
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered.lock().len()
    }
}

impl NotificationHandler for RecordingHandler {
    fn check_dup_and_add(&self, event_id: &EventId) -> bool {
        self.seen.lock().insert(event_id.clone())
    }

    fn is_region_attached(&self, region: &str) -> bool {
        self.regions.contains(region)
    }

    fn deliver(&self, notification: Notification) {
        self.delivered.lock().push(notification);
    }

    fn process_marker(&self) {
        self.markers.fetch_add(1, Ordering::Relaxed);
    }
}

/// Region that records notifications and replays a single interest
/// registration per new queue
pub struct MockRegion {
    path: String,
    received: Mutex<Vec<NotificationKind>>,
    registrations: AtomicUsize,
}

impl MockRegion {
    pub fn new(path: &str) -> Arc<Self> {
        Arc::new(Self {
            path: path.to_string(),
            received: Mutex::new(Vec::new()),
            registrations: AtomicUsize::new(0),
        })
    }

    pub fn count_of(&self, kind: NotificationKind) -> usize {
        self.received.lock().iter().filter(|k| **k == kind).count()
    }

    pub fn register_count(&self) -> usize {
        self.registrations.load(Ordering::Acquire)
    }
}

impl Region for MockRegion {
    fn full_path(&self) -> &str {
        &self.path
    }

    fn receive_notification(&self, notification: &Notification) {
        self.received.lock().push(notification.kind);
    }

    fn register_keys(&self, endpoint: &Endpoint) -> Result<()> {
        endpoint.send(&Request::new(Verb::RegisterInterest).with_arg(self.path.as_bytes()))?;
        self.registrations.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// Locator answering from a fixed server list
pub struct MockLocator {
    servers: Vec<ServerLocation>,
}

impl MockLocator {
    pub fn new(servers: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            servers: servers.iter().map(|s| s.parse().unwrap()).collect(),
        })
    }
}

impl Locator for MockLocator {
    fn select_servers(
        &self,
        how_many: Option<usize>,
        exclude: &HashSet<ServerLocation>,
    ) -> Result<Vec<ServerLocation>> {
        if self.servers.is_empty() {
            return Err(ClientError::NoLocatorsAvailable);
        }
        let found = self.servers.iter().filter(|s| !exclude.contains(s)).cloned();
        Ok(match how_many {
            Some(n) => found.take(n).collect(),
            None => found.collect(),
        })
    }
}
