//! One cache server as seen by the client

pub mod endpoint;
pub mod subscription;

pub use endpoint::{
    Endpoint, EndpointRef, EndpointSettings, EndpointSignals, EndpointState, MAX_PING_TIMEOUTS,
};
pub use subscription::{dispatch, DispatchOutcome, SubscriptionReceiver, NOTIFICATION_RECEIVE_TIMEOUT};
