//! Requests, replies and pushed notifications
//!
//! Payloads are opaque byte arguments produced by the value codec; only the
//! verb and reply kind matter to the connectivity core.

use serde::Serialize;

use super::event_id::EventId;
use crate::utils::{ClientError, Result};

/// Request verbs the core sends or routes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    // ===== Connection control =====
    Ping,
    UserCredential,
    CloseConnection,

    // ===== Subscription queue =====
    MakePrimary,
    PeriodicAck,
    ClientReady,
    RegisterInterest,
    RegisterInterestList,
    UnregisterInterest,
    UnregisterInterestList,

    // ===== Continuous queries =====
    ExecuteCq,
    ExecuteCqWithIr,
    StopCq,
    CloseCq,

    // ===== Bulk / long-running =====
    Query,
    PutAll,
    RemoveAll,
    ExecuteFunction,
    ExecuteRegionFunction,

    // ===== Region operations =====
    Get,
    GetAll,
    Put,
    Destroy,
    Invalidate,
    KeySet,
}

const ALL_VERBS: &[Verb] = &[
    Verb::Ping,
    Verb::UserCredential,
    Verb::CloseConnection,
    Verb::MakePrimary,
    Verb::PeriodicAck,
    Verb::ClientReady,
    Verb::RegisterInterest,
    Verb::RegisterInterestList,
    Verb::UnregisterInterest,
    Verb::UnregisterInterestList,
    Verb::ExecuteCq,
    Verb::ExecuteCqWithIr,
    Verb::StopCq,
    Verb::CloseCq,
    Verb::Query,
    Verb::PutAll,
    Verb::RemoveAll,
    Verb::ExecuteFunction,
    Verb::ExecuteRegionFunction,
    Verb::Get,
    Verb::GetAll,
    Verb::Put,
    Verb::Destroy,
    Verb::Invalidate,
    Verb::KeySet,
];

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Ping => "PING",
            Verb::UserCredential => "USER_CREDENTIAL",
            Verb::CloseConnection => "CLOSE_CONNECTION",
            Verb::MakePrimary => "MAKE_PRIMARY",
            Verb::PeriodicAck => "PERIODIC_ACK",
            Verb::ClientReady => "CLIENT_READY",
            Verb::RegisterInterest => "REGISTER_INTEREST",
            Verb::RegisterInterestList => "REGISTER_INTEREST_LIST",
            Verb::UnregisterInterest => "UNREGISTER_INTEREST",
            Verb::UnregisterInterestList => "UNREGISTER_INTEREST_LIST",
            Verb::ExecuteCq => "EXECUTECQ",
            Verb::ExecuteCqWithIr => "EXECUTECQ_WITH_IR",
            Verb::StopCq => "STOPCQ",
            Verb::CloseCq => "CLOSECQ",
            Verb::Query => "QUERY",
            Verb::PutAll => "PUTALL",
            Verb::RemoveAll => "REMOVEALL",
            Verb::ExecuteFunction => "EXECUTE_FUNCTION",
            Verb::ExecuteRegionFunction => "EXECUTE_REGION_FUNCTION",
            Verb::Get => "GET",
            Verb::GetAll => "GETALL",
            Verb::Put => "PUT",
            Verb::Destroy => "DESTROY",
            Verb::Invalidate => "INVALIDATE",
            Verb::KeySet => "KEY_SET",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        ALL_VERBS.iter().copied().find(|v| v.as_str() == name)
    }

    /// A timeout on these verbs says nothing reliable about server health:
    /// the caller gets the timeout and the endpoint is left alone.
    pub fn is_timeout_tolerant(&self) -> bool {
        matches!(
            self,
            Verb::Query
                | Verb::PutAll
                | Verb::RemoveAll
                | Verb::ExecuteFunction
                | Verb::ExecuteRegionFunction
                | Verb::ExecuteCqWithIr
        )
    }

    pub fn is_cq(&self) -> bool {
        matches!(
            self,
            Verb::ExecuteCq | Verb::ExecuteCqWithIr | Verb::StopCq | Verb::CloseCq
        )
    }

    pub fn is_register_interest(&self) -> bool {
        matches!(
            self,
            Verb::RegisterInterest
                | Verb::RegisterInterestList
                | Verb::UnregisterInterest
                | Verb::UnregisterInterestList
        )
    }

    /// Extra attempts on a fresh connection after a transient failure
    pub fn max_send_retries(&self) -> u32 {
        if self.is_timeout_tolerant() {
            0
        } else {
            1
        }
    }
}

/// Outbound request. The transaction id is assigned by the endpoint at send
/// time.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub verb: Verb,
    pub args: Vec<Vec<u8>>,
}

impl Request {
    pub fn new(verb: Verb) -> Self {
        Self {
            verb,
            args: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<Vec<u8>>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn ping() -> Self {
        Self::new(Verb::Ping)
    }

    pub fn make_primary(sent_ready_for_events: bool) -> Self {
        Self::new(Verb::MakePrimary).with_arg(flag(sent_ready_for_events))
    }

    pub fn client_ready() -> Self {
        Self::new(Verb::ClientReady)
    }

    pub fn periodic_ack(ids: &[EventId]) -> Self {
        Self {
            verb: Verb::PeriodicAck,
            args: ids.iter().map(EventId::to_bytes).collect(),
        }
    }

    pub fn close_connection(keep_alive: bool) -> Self {
        Self::new(Verb::CloseConnection).with_arg(flag(keep_alive))
    }

    pub fn user_credential(username: &str, password: &str) -> Self {
        Self::new(Verb::UserCredential)
            .with_arg(username.as_bytes())
            .with_arg(password.as_bytes())
    }
}

fn flag(value: bool) -> Vec<u8> {
    if value {
        b"1".to_vec()
    } else {
        b"0".to_vec()
    }
}

/// Kind of reply frame
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyKind {
    Reply,
    Exception { class: String, message: String },
}

/// Reply to a request
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub kind: ReplyKind,
    pub transaction_id: i64,
    pub payload: Vec<Vec<u8>>,
}

impl Reply {
    pub fn ok(transaction_id: i64) -> Self {
        Self {
            kind: ReplyKind::Reply,
            transaction_id,
            payload: Vec::new(),
        }
    }

    pub fn exception(transaction_id: i64, class: &str, message: &str) -> Self {
        Self {
            kind: ReplyKind::Exception {
                class: class.to_string(),
                message: message.to_string(),
            },
            transaction_id,
            payload: Vec::new(),
        }
    }

    /// Turn server exceptions into errors; authentication problems get their
    /// own kinds so callers can re-authenticate.
    pub fn into_result(self) -> Result<Reply> {
        match self.kind {
            ReplyKind::Reply => Ok(self),
            ReplyKind::Exception { class, message } => {
                if class.contains("AuthenticationRequired") {
                    Err(ClientError::AuthenticationRequired(message))
                } else if class.contains("AuthenticationFailed") || class.contains("NotAuthorized")
                {
                    Err(ClientError::AuthenticationFailed(message))
                } else {
                    Err(ClientError::ServerException { class, message })
                }
            }
        }
    }
}

/// Kinds of server-pushed messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Create,
    Update,
    Invalidate,
    Destroy,
    DestroyRegion,
    ClearRegion,
    CqEvent,
    ClientMarker,
    ServerToClientPing,
    /// Raised locally when no endpoint can host the primary queue
    AllEndpointsDisconnected,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Create => "CREATE",
            NotificationKind::Update => "UPDATE",
            NotificationKind::Invalidate => "INVALIDATE",
            NotificationKind::Destroy => "DESTROY",
            NotificationKind::DestroyRegion => "DESTROY_REGION",
            NotificationKind::ClearRegion => "CLEAR_REGION",
            NotificationKind::CqEvent => "CQ_EVENT",
            NotificationKind::ClientMarker => "CLIENT_MARKER",
            NotificationKind::ServerToClientPing => "SERVER_TO_CLIENT_PING",
            NotificationKind::AllEndpointsDisconnected => "ALL_ENDPOINTS_DISCONNECTED",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        [
            NotificationKind::Create,
            NotificationKind::Update,
            NotificationKind::Invalidate,
            NotificationKind::Destroy,
            NotificationKind::DestroyRegion,
            NotificationKind::ClearRegion,
            NotificationKind::CqEvent,
            NotificationKind::ClientMarker,
            NotificationKind::ServerToClientPing,
            NotificationKind::AllEndpointsDisconnected,
        ]
        .into_iter()
        .find(|k| k.as_str() == name)
    }
}

/// Server-pushed event
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub kind: NotificationKind,
    /// Full path of the target region
    pub region: String,
    pub event_id: Option<EventId>,
    pub payload: Vec<Vec<u8>>,
}

impl Notification {
    pub fn new(kind: NotificationKind, region: impl Into<String>) -> Self {
        Self {
            kind,
            region: region.into(),
            event_id: None,
            payload: Vec::new(),
        }
    }

    pub fn with_event_id(mut self, event_id: EventId) -> Self {
        self.event_id = Some(event_id);
        self
    }

    pub fn all_endpoints_disconnected(region: &str) -> Self {
        Self::new(NotificationKind::AllEndpointsDisconnected, region)
    }
}

/// Server-side state of this client's subscription queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ServerQueueStatus {
    #[default]
    NonRedundant,
    Redundant,
    Primary,
}

impl ServerQueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServerQueueStatus::NonRedundant => "NON_REDUNDANT",
            ServerQueueStatus::Redundant => "REDUNDANT",
            ServerQueueStatus::Primary => "PRIMARY",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "NON_REDUNDANT" => Some(ServerQueueStatus::NonRedundant),
            "REDUNDANT" => Some(ServerQueueStatus::Redundant),
            "PRIMARY" => Some(ServerQueueStatus::Primary),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verb_names_are_unique_and_parse() {
        for verb in ALL_VERBS {
            assert_eq!(Verb::parse(verb.as_str()), Some(*verb));
        }
        assert_eq!(Verb::parse("NOPE"), None);
    }

    #[test]
    fn test_timeout_tolerant_verbs_do_not_retry() {
        assert!(Verb::Query.is_timeout_tolerant());
        assert_eq!(Verb::Query.max_send_retries(), 0);
        assert!(!Verb::Get.is_timeout_tolerant());
        assert_eq!(Verb::Get.max_send_retries(), 1);
    }

    #[test]
    fn test_exception_mapping() {
        let auth = Reply::exception(1, "AuthenticationRequiredException", "login");
        assert!(matches!(
            auth.into_result(),
            Err(ClientError::AuthenticationRequired(_))
        ));

        let denied = Reply::exception(1, "NotAuthorizedException", "no");
        assert!(matches!(
            denied.into_result(),
            Err(ClientError::AuthenticationFailed(_))
        ));

        let other = Reply::exception(1, "CacheServerException", "boom");
        assert!(matches!(
            other.into_result(),
            Err(ClientError::ServerException { .. })
        ));

        assert!(Reply::ok(4).into_result().is_ok());
    }

    #[test]
    fn test_periodic_ack_carries_every_id() {
        let ids = vec![EventId::new(b"a".to_vec(), 1, 1), EventId::new(b"b".to_vec(), 2, 5)];
        let request = Request::periodic_ack(&ids);
        assert_eq!(request.verb, Verb::PeriodicAck);
        assert_eq!(request.args.len(), 2);
        assert_eq!(EventId::from_bytes(&request.args[1]).unwrap(), ids[1]);
    }
}
