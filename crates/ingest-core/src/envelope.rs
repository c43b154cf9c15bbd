use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::ids::ConnectionId;

/// One received frame, tagged with the connection it arrived on.
///
/// Envelopes are immutable once built. The payload is never interpreted here;
/// it goes to storage as-is and, optionally, through a [`PayloadDecoder`]
/// for diagnostics.
///
/// [`PayloadDecoder`]: crate::decode::PayloadDecoder
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventEnvelope {
    sender_id: ConnectionId,
    sequence: u64,
    payload: Bytes,
    received_at: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(sender_id: ConnectionId, sequence: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            sender_id,
            sequence,
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }

    pub fn sender_id(&self) -> &ConnectionId {
        &self.sender_id
    }

    /// Receipt index within the connection, starting at 0.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_keeps_payload_bytes_verbatim() {
        let raw = vec![0x08, 0x96, 0x01, 0xff, 0x00];
        let env = EventEnvelope::new(ConnectionId::from_raw("conn_a"), 3, raw.clone());
        assert_eq!(env.payload().as_ref(), raw.as_slice());
        assert_eq!(env.sender_id().as_str(), "conn_a");
        assert_eq!(env.sequence(), 3);
        assert_eq!(env.len(), 5);
    }

    #[test]
    fn empty_payload_is_allowed() {
        let env = EventEnvelope::new(ConnectionId::new(), 0, Bytes::new());
        assert!(env.is_empty());
    }

    #[test]
    fn clones_share_the_payload_buffer() {
        let env = EventEnvelope::new(ConnectionId::new(), 0, Bytes::from_static(b"abc"));
        let copy = env.clone();
        assert_eq!(env.payload().as_ptr(), copy.payload().as_ptr());
    }
}
