//! Event identifiers attached to server-pushed notifications

use std::fmt;

use serde::Serialize;

use crate::utils::ProtocolError;

/// Identifies the producer of a stream of events: one thread on one server
/// member. Sequence ids are monotonic per source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EventSource {
    pub member_id: Vec<u8>,
    pub thread_id: i64,
}

/// Unique id of one pushed event
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct EventId {
    pub member_id: Vec<u8>,
    pub thread_id: i64,
    pub sequence_id: i64,
}

impl EventId {
    pub fn new(member_id: impl Into<Vec<u8>>, thread_id: i64, sequence_id: i64) -> Self {
        Self {
            member_id: member_id.into(),
            thread_id,
            sequence_id,
        }
    }

    pub fn source(&self) -> EventSource {
        EventSource {
            member_id: self.member_id.clone(),
            thread_id: self.thread_id,
        }
    }

    /// Layout: u16 member length, member bytes, i64 thread, i64 sequence (big endian)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.member_id.len() + 16);
        out.extend_from_slice(&(self.member_id.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.member_id);
        out.extend_from_slice(&self.thread_id.to_be_bytes());
        out.extend_from_slice(&self.sequence_id.to_be_bytes());
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < 2 {
            return Err(ProtocolError::InvalidFrame("event id too short".to_string()));
        }
        let member_len = u16::from_be_bytes([data[0], data[1]]) as usize;
        let expected = 2 + member_len + 16;
        if data.len() != expected {
            return Err(ProtocolError::InvalidFrame(format!(
                "event id length {} (expected {})",
                data.len(),
                expected
            )));
        }
        let member_id = data[2..2 + member_len].to_vec();
        let rest = &data[2 + member_len..];
        let mut thread = [0u8; 8];
        let mut sequence = [0u8; 8];
        thread.copy_from_slice(&rest[..8]);
        sequence.copy_from_slice(&rest[8..16]);
        Ok(Self {
            member_id,
            thread_id: i64::from_be_bytes(thread),
            sequence_id: i64::from_be_bytes(sequence),
        })
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EventId[{}:{}:{}]",
            String::from_utf8_lossy(&self.member_id),
            self.thread_id,
            self.sequence_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_layout() {
        let id = EventId::new(b"m1".to_vec(), 3, 9);
        let bytes = id.to_bytes();
        assert_eq!(bytes.len(), 2 + 2 + 16);
        assert_eq!(&bytes[..4], &[0, 2, b'm', b'1']);
        assert_eq!(EventId::from_bytes(&bytes).unwrap(), id);
    }

    #[test]
    fn test_rejects_bad_length() {
        let mut bytes = EventId::new(b"abc".to_vec(), 1, 1).to_bytes();
        bytes.pop();
        assert!(EventId::from_bytes(&bytes).is_err());
        assert!(EventId::from_bytes(&[0]).is_err());
    }

    #[test]
    fn test_source_ignores_sequence() {
        let a = EventId::new(b"m".to_vec(), 1, 1);
        let b = EventId::new(b"m".to_vec(), 1, 2);
        assert_eq!(a.source(), b.source());
        assert_ne!(a, b);
    }
}
