use crate::error::{ParloError, Result};
use bytes::{Buf, BufMut, BytesMut};
use std::time::{Duration, SystemTime};

/// Packet ids reserved for the protocol itself. Application protocols must
/// not use these.
pub mod ids {
    /// Keep-alive packet carrying a [`HeartbeatPayload`](super::HeartbeatPayload).
    pub const HEARTBEAT: u8 = 0xFD;

    /// Goodbye packet sent by a server.
    pub const SERVER_GOODBYE: u8 = 0xFE;

    /// Goodbye packet sent by a client. Sufficiently high that no protocol
    /// should need this many packet ids.
    pub const CLIENT_GOODBYE: u8 = 0xFF;
}

/// Grace period a server announces before closing.
pub const SERVER_GRACE_PERIOD: Duration = Duration::from_secs(60);

/// Grace period a client announces before closing.
pub const CLIENT_GRACE_PERIOD: Duration = Duration::from_secs(5);

pub(crate) fn unix_millis(t: SystemTime) -> i64 {
    match t.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

pub(crate) fn unix_seconds(t: SystemTime) -> i64 {
    match t.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

/// Body of a heartbeat packet. Carried as the payload of a frame with id
/// [`ids::HEARTBEAT`]; the decoder expects exactly this body, the id byte is
/// consumed by the framer.
///
/// Both fields together let the receiver estimate the round trip without any
/// request/response pairing: `sent_timestamp_ms` gives the one-way delay
/// (modulo clock offset), and `time_since_last_ms` is the sender's own
/// interval jitter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeartbeatPayload {
    /// Milliseconds elapsed on the sender since its previous heartbeat.
    pub time_since_last_ms: i64,
    /// Milliseconds since the epoch at the moment of emission.
    pub sent_timestamp_ms: i64,
}

impl HeartbeatPayload {
    pub const SERIALIZED_LEN: usize = 2 * size_of::<i64>();

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_i64_le(self.time_since_last_ms);
        buf.put_i64_le(self.sent_timestamp_ms);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<HeartbeatPayload> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            return Err(ParloError::Framing(format!(
                "heartbeat body has {} bytes, expected {}",
                buf.remaining(),
                Self::SERIALIZED_LEN,
            )));
        }
        Ok(HeartbeatPayload {
            time_since_last_ms: buf.get_i64_le(),
            sent_timestamp_ms: buf.get_i64_le(),
        })
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(Self::SERIALIZED_LEN);
        self.ser(&mut buf);
        buf.to_vec()
    }
}

/// Body of a goodbye packet: the grace period the sender will honor before
/// closing, and the send time in whole seconds since the epoch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GoodbyePayload {
    pub timeout_seconds: i64,
    pub sent_time_seconds: i64,
}

impl GoodbyePayload {
    pub const SERIALIZED_LEN: usize = 2 * size_of::<i64>();

    pub fn new(timeout: Duration) -> GoodbyePayload {
        GoodbyePayload {
            timeout_seconds: timeout.as_secs() as i64,
            sent_time_seconds: unix_seconds(SystemTime::now()),
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_i64_le(self.timeout_seconds);
        buf.put_i64_le(self.sent_time_seconds);
    }

    pub fn deser(buf: &mut impl Buf) -> Result<GoodbyePayload> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            return Err(ParloError::Framing(format!(
                "goodbye body has {} bytes, expected {}",
                buf.remaining(),
                Self::SERIALIZED_LEN,
            )));
        }
        Ok(GoodbyePayload {
            timeout_seconds: buf.get_i64_le(),
            sent_time_seconds: buf.get_i64_le(),
        })
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(Self::SERIALIZED_LEN);
        self.ser(&mut buf);
        buf.to_vec()
    }
}
