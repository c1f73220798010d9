//! Connection primitives consumed by the endpoint layer

use std::time::Duration;

use crate::protocol::{ChannelKind, Handshake};
use crate::utils::ConnectionError;

/// Closure that aborts a blocked `receive` from another thread
pub type Interrupt = Box<dyn Fn() + Send + Sync>;

/// One physical connection to a cache server
pub trait Connection: Send {
    /// Send one request frame and wait up to `timeout` for its reply frame
    fn send(&mut self, frame: &[u8], timeout: Duration) -> Result<Vec<u8>, ConnectionError>;

    /// Wait up to `timeout` for a pushed frame. `Ok(None)` means nothing
    /// arrived in time.
    fn receive(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, ConnectionError>;

    /// Server state reported when the connection was opened
    fn handshake(&self) -> &Handshake;

    /// Handle that can unblock `receive` from another thread, if supported
    fn interrupt_handle(&self) -> Option<Interrupt> {
        None
    }

    fn close(&mut self);
}

/// Opens connections to endpoints by name (`host:port`)
pub trait ConnectionFactory: Send + Sync {
    fn connect(
        &self,
        endpoint: &str,
        kind: ChannelKind,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>, ConnectionError>;
}
