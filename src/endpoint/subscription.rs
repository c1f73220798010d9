//! Notification receiver for an endpoint's subscription channel

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::endpoint::Endpoint;
use crate::client::{Connection, Interrupt};
use crate::protocol::codec;
use crate::protocol::{Notification, NotificationKind};
use crate::region::NotificationHandler;

/// How long one receive call blocks before the running flag is rechecked
pub const NOTIFICATION_RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// What happened to one pushed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    Duplicate,
    /// No attached region with that path
    Dropped,
    Marker,
    Ignored,
}

/// Route one notification through dedup to its region
pub fn dispatch(handler: &dyn NotificationHandler, notification: Notification) -> DispatchOutcome {
    match notification.kind {
        NotificationKind::ServerToClientPing | NotificationKind::AllEndpointsDisconnected => {
            DispatchOutcome::Ignored
        }
        NotificationKind::ClientMarker => {
            handler.process_marker();
            DispatchOutcome::Marker
        }
        _ => {
            if !handler.is_region_attached(&notification.region) {
                trace!(
                    "Dropping {} for unattached region {}",
                    notification.kind.as_str(),
                    notification.region
                );
                return DispatchOutcome::Dropped;
            }
            if let Some(ref id) = notification.event_id {
                if !handler.check_dup_and_add(id) {
                    return DispatchOutcome::Duplicate;
                }
            }
            handler.deliver(notification);
            DispatchOutcome::Delivered
        }
    }
}

/// Handle to the thread reading one subscription channel
pub struct SubscriptionReceiver {
    endpoint: String,
    running: Arc<AtomicBool>,
    interrupt: Option<Interrupt>,
    handle: Option<JoinHandle<()>>,
}

impl SubscriptionReceiver {
    pub(crate) fn spawn(
        endpoint: Weak<Endpoint>,
        name: &str,
        conn: Box<dyn Connection>,
        handler: Weak<dyn NotificationHandler>,
    ) -> io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let interrupt = conn.interrupt_handle();
        let flag = Arc::clone(&running);
        let endpoint_name = name.to_string();

        let handle = thread::Builder::new()
            .name(format!("notify-{}", name))
            .spawn(move || receive_loop(endpoint, endpoint_name, conn, handler, flag))?;

        Ok(Self {
            endpoint: name.to_string(),
            running,
            interrupt,
            handle: Some(handle),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Ask the receiver to exit without waiting for it
    pub fn stop_noblock(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            if let Some(ref interrupt) = self.interrupt {
                interrupt();
            }
        }
    }

    pub(crate) fn mark_stopped(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Wait for the receiver thread. Never called from the receiver itself.
    pub fn join(mut self) {
        self.stop_noblock();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("Notification receiver for {} panicked", self.endpoint);
            }
        }
    }
}

impl Drop for SubscriptionReceiver {
    fn drop(&mut self) {
        self.stop_noblock();
    }
}

fn receive_loop(
    endpoint: Weak<Endpoint>,
    name: String,
    mut conn: Box<dyn Connection>,
    handler: Weak<dyn NotificationHandler>,
    running: Arc<AtomicBool>,
) {
    debug!("Notification receiver for {} started", name);
    while running.load(Ordering::Acquire) {
        match conn.receive(NOTIFICATION_RECEIVE_TIMEOUT) {
            Ok(None) => continue,
            Ok(Some(frame)) => {
                let notification = match codec::decode_notification(&frame) {
                    Ok(n) => n,
                    Err(e) => {
                        warn!("Discarding malformed notification from {}: {}", name, e);
                        continue;
                    }
                };
                let Some(handler) = handler.upgrade() else {
                    debug!("Subscriber for {} is gone", name);
                    break;
                };
                dispatch(handler.as_ref(), notification);
            }
            Err(e) => {
                if running.load(Ordering::Acquire) {
                    warn!("Subscription channel to {} failed: {}", name, e);
                    if let Some(ep) = endpoint.upgrade() {
                        ep.subscription_lost();
                    }
                }
                break;
            }
        }
    }
    conn.close();
    debug!("Notification receiver for {} stopped", name);
}
