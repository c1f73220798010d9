//! Frame codec
//!
//! Every frame is a single RESP array whose first element names the frame
//! type. Value payloads travel as opaque bulk strings.

use std::io::Cursor;

use super::event_id::EventId;
use super::message::{
    Notification, NotificationKind, Reply, ReplyKind, Request, ServerQueueStatus, Verb,
};
use crate::utils::{ProtocolError, RespDecoder, RespEncoder, RespValue};

const REPLY_TAG: &str = "REPLY";
const EXCEPTION_TAG: &str = "EXCEPTION";
const EVENT_TAG: &str = "EVENT";
const HANDSHAKE_TAG: &str = "HANDSHAKE";
const HANDSHAKE_OK_TAG: &str = "HANDSHAKE_OK";

/// Purpose of a physical connection, announced in the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Request/reply traffic
    Operation,
    /// Server-push channel hosting this client's queue
    Subscription { secondary: bool },
    /// Short-lived connection used only to read the queue status
    Probe,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Operation => "OPERATION",
            ChannelKind::Subscription { secondary: false } => "PRIMARY",
            ChannelKind::Subscription { secondary: true } => "SECONDARY",
            ChannelKind::Probe => "PROBE",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "OPERATION" => Some(ChannelKind::Operation),
            "PRIMARY" => Some(ChannelKind::Subscription { secondary: false }),
            "SECONDARY" => Some(ChannelKind::Subscription { secondary: true }),
            "PROBE" => Some(ChannelKind::Probe),
            _ => None,
        }
    }
}

/// What the server reports when a connection is opened
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Handshake {
    pub queue_status: ServerQueueStatus,
    pub queue_size: u64,
    pub requires_auth: bool,
}

fn decode_array(frame: &[u8]) -> Result<Vec<RespValue>, ProtocolError> {
    let mut decoder = RespDecoder::new(Cursor::new(frame));
    let value = decoder
        .decode()
        .map_err(|e| ProtocolError::InvalidFrame(e.to_string()))?;
    let actual = value.type_name();
    value.into_array().ok_or_else(|| ProtocolError::UnexpectedFrame {
        expected: "array".to_string(),
        actual: actual.to_string(),
    })
}

fn text(value: &RespValue, field: &str) -> Result<String, ProtocolError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::Parse(format!("{} is not a string", field)))
}

fn integer(value: &RespValue, field: &str) -> Result<i64, ProtocolError> {
    value
        .as_i64()
        .ok_or_else(|| ProtocolError::Parse(format!("{} is not an integer", field)))
}

fn bulk_args(values: Vec<RespValue>) -> Result<Vec<Vec<u8>>, ProtocolError> {
    values
        .into_iter()
        .map(|v| {
            v.into_bytes()
                .ok_or_else(|| ProtocolError::Parse("argument is not a bulk string".to_string()))
        })
        .collect()
}

fn expect_tag(items: &[RespValue], min_len: usize) -> Result<String, ProtocolError> {
    if items.len() < min_len {
        return Err(ProtocolError::InvalidFrame(format!(
            "{} elements, need at least {}",
            items.len(),
            min_len
        )));
    }
    text(&items[0], "frame tag")
}

pub fn encode_request(request: &Request, transaction_id: i64) -> Vec<u8> {
    let mut encoder = RespEncoder::with_capacity(64);
    encoder.encode_array_header(request.args.len() + 2);
    encoder.encode_bulk(request.verb.as_str().as_bytes());
    encoder.encode_integer(transaction_id);
    for arg in &request.args {
        encoder.encode_bulk(arg);
    }
    encoder.into_bytes()
}

pub fn decode_request(frame: &[u8]) -> Result<(Request, i64), ProtocolError> {
    let mut items = decode_array(frame)?;
    let name = expect_tag(&items, 2)?;
    let verb = Verb::parse(&name).ok_or(ProtocolError::UnknownVerb(name))?;
    let transaction_id = integer(&items[1], "transaction id")?;
    let args = bulk_args(items.split_off(2))?;
    Ok((Request { verb, args }, transaction_id))
}

pub fn encode_reply(reply: &Reply) -> Vec<u8> {
    let mut encoder = RespEncoder::with_capacity(64);
    match &reply.kind {
        ReplyKind::Reply => {
            encoder.encode_array_header(reply.payload.len() + 2);
            encoder.encode_bulk(REPLY_TAG.as_bytes());
            encoder.encode_integer(reply.transaction_id);
            for part in &reply.payload {
                encoder.encode_bulk(part);
            }
        }
        ReplyKind::Exception { class, message } => {
            encoder.encode_array_header(4);
            encoder.encode_bulk(EXCEPTION_TAG.as_bytes());
            encoder.encode_integer(reply.transaction_id);
            encoder.encode_bulk(class.as_bytes());
            encoder.encode_bulk(message.as_bytes());
        }
    }
    encoder.into_bytes()
}

pub fn decode_reply(frame: &[u8]) -> Result<Reply, ProtocolError> {
    let mut items = decode_array(frame)?;
    let tag = expect_tag(&items, 2)?;
    let transaction_id = integer(&items[1], "transaction id")?;
    match tag.as_str() {
        REPLY_TAG => Ok(Reply {
            kind: ReplyKind::Reply,
            transaction_id,
            payload: bulk_args(items.split_off(2))?,
        }),
        EXCEPTION_TAG if items.len() == 4 => Ok(Reply {
            kind: ReplyKind::Exception {
                class: text(&items[2], "exception class")?,
                message: text(&items[3], "exception message")?,
            },
            transaction_id,
            payload: Vec::new(),
        }),
        other => Err(ProtocolError::UnexpectedFrame {
            expected: REPLY_TAG.to_string(),
            actual: other.to_string(),
        }),
    }
}

pub fn encode_notification(notification: &Notification) -> Vec<u8> {
    let mut encoder = RespEncoder::with_capacity(128);
    encoder.encode_array_header(notification.payload.len() + 4);
    encoder.encode_bulk(EVENT_TAG.as_bytes());
    encoder.encode_bulk(notification.kind.as_str().as_bytes());
    encoder.encode_bulk(notification.region.as_bytes());
    match &notification.event_id {
        Some(id) => encoder.encode_bulk(&id.to_bytes()),
        None => encoder.encode_null(),
    }
    for part in &notification.payload {
        encoder.encode_bulk(part);
    }
    encoder.into_bytes()
}

pub fn decode_notification(frame: &[u8]) -> Result<Notification, ProtocolError> {
    let mut items = decode_array(frame)?;
    let tag = expect_tag(&items, 4)?;
    if tag != EVENT_TAG {
        return Err(ProtocolError::UnexpectedFrame {
            expected: EVENT_TAG.to_string(),
            actual: tag,
        });
    }
    let kind_name = text(&items[1], "notification kind")?;
    let kind = NotificationKind::parse(&kind_name)
        .ok_or_else(|| ProtocolError::Parse(format!("unknown notification kind {}", kind_name)))?;
    let region = text(&items[2], "region")?;
    let event_id = match &items[3] {
        RespValue::Null => None,
        value => {
            let bytes = value
                .as_bytes()
                .ok_or_else(|| ProtocolError::Parse("event id is not a bulk string".to_string()))?;
            Some(EventId::from_bytes(bytes)?)
        }
    };
    Ok(Notification {
        kind,
        region,
        event_id,
        payload: bulk_args(items.split_off(4))?,
    })
}

pub fn encode_handshake_request(kind: ChannelKind, client_id: &str) -> Vec<u8> {
    let mut encoder = RespEncoder::with_capacity(64);
    encoder.encode_command(&[
        HANDSHAKE_TAG.as_bytes(),
        kind.as_str().as_bytes(),
        client_id.as_bytes(),
    ]);
    encoder.into_bytes()
}

pub fn decode_handshake_request(frame: &[u8]) -> Result<(ChannelKind, String), ProtocolError> {
    let items = decode_array(frame)?;
    let tag = expect_tag(&items, 3)?;
    if tag != HANDSHAKE_TAG {
        return Err(ProtocolError::UnexpectedFrame {
            expected: HANDSHAKE_TAG.to_string(),
            actual: tag,
        });
    }
    let kind_name = text(&items[1], "channel kind")?;
    let kind = ChannelKind::parse(&kind_name)
        .ok_or_else(|| ProtocolError::Parse(format!("unknown channel kind {}", kind_name)))?;
    Ok((kind, text(&items[2], "client id")?))
}

pub fn encode_handshake_reply(handshake: &Handshake) -> Vec<u8> {
    let mut encoder = RespEncoder::with_capacity(64);
    encoder.encode_value(&RespValue::Array(vec![
        RespValue::bulk(HANDSHAKE_OK_TAG),
        RespValue::bulk(handshake.queue_status.as_str()),
        RespValue::Integer(handshake.queue_size as i64),
        RespValue::Integer(i64::from(handshake.requires_auth)),
    ]));
    encoder.into_bytes()
}

pub fn decode_handshake_reply(frame: &[u8]) -> Result<Handshake, ProtocolError> {
    let items = decode_array(frame)?;
    let tag = expect_tag(&items, 4)?;
    if tag != HANDSHAKE_OK_TAG {
        return Err(ProtocolError::UnexpectedFrame {
            expected: HANDSHAKE_OK_TAG.to_string(),
            actual: tag,
        });
    }
    let status_name = text(&items[1], "queue status")?;
    let queue_status = ServerQueueStatus::parse(&status_name)
        .ok_or_else(|| ProtocolError::Parse(format!("unknown queue status {}", status_name)))?;
    Ok(Handshake {
        queue_status,
        queue_size: integer(&items[2], "queue size")?.max(0) as u64,
        requires_auth: integer(&items[3], "auth flag")? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_frame_layout() {
        let request = Request::new(Verb::Get).with_arg(b"key".to_vec());
        let frame = encode_request(&request, 42);
        assert_eq!(frame, b"*3\r\n$3\r\nGET\r\n:42\r\n$3\r\nkey\r\n".to_vec());
        let (decoded, tx) = decode_request(&frame).unwrap();
        assert_eq!(tx, 42);
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_exception_reply() {
        let frame = encode_reply(&Reply::exception(7, "CacheServerException", "down"));
        let reply = decode_reply(&frame).unwrap();
        assert_eq!(reply.transaction_id, 7);
        assert_eq!(
            reply.kind,
            ReplyKind::Exception {
                class: "CacheServerException".to_string(),
                message: "down".to_string()
            }
        );
    }

    #[test]
    fn test_notification_without_event_id() {
        let marker = Notification::new(NotificationKind::ClientMarker, "");
        let decoded = decode_notification(&encode_notification(&marker)).unwrap();
        assert_eq!(decoded, marker);
    }

    #[test]
    fn test_notification_with_event_id_and_payload() {
        let mut event = Notification::new(NotificationKind::Update, "/orders")
            .with_event_id(EventId::new(b"srv-1".to_vec(), 4, 10));
        event.payload.push(b"value".to_vec());
        let decoded = decode_notification(&encode_notification(&event)).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_unknown_verb_rejected() {
        let mut encoder = RespEncoder::with_capacity(32);
        encoder.encode_array_header(2);
        encoder.encode_bulk(b"FLY");
        encoder.encode_integer(1);
        assert!(matches!(
            decode_request(encoder.as_bytes()),
            Err(ProtocolError::UnknownVerb(_))
        ));
    }

    #[test]
    fn test_handshake_exchange() {
        let frame = encode_handshake_request(ChannelKind::Subscription { secondary: true }, "c1");
        let (kind, client) = decode_handshake_request(&frame).unwrap();
        assert_eq!(kind, ChannelKind::Subscription { secondary: true });
        assert_eq!(client, "c1");

        let reply = Handshake {
            queue_status: ServerQueueStatus::Redundant,
            queue_size: 12,
            requires_auth: true,
        };
        assert_eq!(decode_handshake_reply(&encode_handshake_reply(&reply)).unwrap(), reply);
    }

    #[test]
    fn test_reply_to_wrong_frame_type() {
        let frame = encode_notification(&Notification::new(NotificationKind::Create, "/r"));
        assert!(decode_reply(&frame).is_err());
    }
}
