//! Datagram wire format.
//!
//! Every datagram is `[1 byte tag][N bytes payload]`. A [`Packet`] keeps the
//! whole datagram (tag included) together with the remote endpoint it came
//! from or is going to.

use std::net::{IpAddr, SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};

/// Tags the session layer registers for itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketKind {
    HeartbeatRequest = 0,
    HeartbeatAcknowledge = 1,
    ConnectionRequest = 2,
    ConnectionAcknowledge = 3,
    DisconnectRequest = 4,
    DisconnectAcknowledge = 5,
    ClientDisconnectAlert = 6,
}

impl PacketKind {
    pub const ALL: [PacketKind; 7] = [
        PacketKind::HeartbeatRequest,
        PacketKind::HeartbeatAcknowledge,
        PacketKind::ConnectionRequest,
        PacketKind::ConnectionAcknowledge,
        PacketKind::DisconnectRequest,
        PacketKind::DisconnectAcknowledge,
        PacketKind::ClientDisconnectAlert,
    ];

    pub const fn tag(self) -> u8 {
        self as u8
    }

    pub const fn name(self) -> &'static str {
        match self {
            PacketKind::HeartbeatRequest => "HeartbeatRequest",
            PacketKind::HeartbeatAcknowledge => "HeartbeatAcknowledge",
            PacketKind::ConnectionRequest => "ConnectionRequest",
            PacketKind::ConnectionAcknowledge => "ConnectionAcknowledge",
            PacketKind::DisconnectRequest => "DisconnectRequest",
            PacketKind::DisconnectAcknowledge => "DisconnectAcknowledge",
            PacketKind::ClientDisconnectAlert => "ClientDisconnectAlert",
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.tag() == tag)
    }
}

/// A received (or about to be sent) datagram plus its remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    data: Bytes,
    endpoint: SocketAddr,
}

impl Packet {
    pub fn new(data: impl Into<Bytes>, endpoint: SocketAddr) -> Self {
        Self {
            data: data.into(),
            endpoint,
        }
    }

    /// Copies a datagram out of a receive buffer that will be reused.
    pub fn copy_from(datagram: &[u8], endpoint: SocketAddr) -> Self {
        Self::new(Bytes::copy_from_slice(datagram), endpoint)
    }

    /// Builds an outbound packet with the tag prepended to `payload`.
    pub fn tagged(tag: u8, payload: &[u8], endpoint: SocketAddr) -> Self {
        Self::new(encode(tag, payload), endpoint)
    }

    /// The full datagram, tag byte first.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn tag(&self) -> Option<u8> {
        self.data.first().copied()
    }

    /// Everything after the tag byte.
    pub fn payload(&self) -> &[u8] {
        self.data.get(1..).unwrap_or_default()
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn address(&self) -> IpAddr {
        self.endpoint.ip()
    }

    pub fn port(&self) -> u16 {
        self.endpoint.port()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Prepends the tag byte to `payload`.
pub fn encode(tag: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + payload.len());
    buf.put_u8(tag);
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Splits a datagram into tag and payload. `None` for an empty datagram.
pub fn decode(datagram: &[u8]) -> Option<(u8, &[u8])> {
    datagram.split_first().map(|(tag, rest)| (*tag, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> SocketAddr {
        "127.0.0.1:51234".parse().unwrap()
    }

    #[test]
    fn tagged_packet_roundtrips_byte_exact() {
        let payload = [0u8, 255, 17, 3];
        let out = Packet::tagged(PacketKind::ClientDisconnectAlert.tag(), &payload, endpoint());
        assert_eq!(out.data().as_ref(), &[6, 0, 255, 17, 3]);

        let (tag, body) = decode(out.data()).unwrap();
        assert_eq!(tag, 6);
        assert_eq!(body, payload);
    }

    #[test]
    fn empty_payload_is_tag_only() {
        let p = Packet::tagged(PacketKind::ConnectionRequest.tag(), &[], endpoint());
        assert_eq!(p.data().len(), 1);
        assert_eq!(p.tag(), Some(2));
        assert!(p.payload().is_empty());
    }

    #[test]
    fn empty_datagram_has_no_tag() {
        let p = Packet::copy_from(&[], endpoint());
        assert!(p.is_empty());
        assert_eq!(p.tag(), None);
        assert!(p.payload().is_empty());
        assert_eq!(decode(&[]), None);
    }

    #[test]
    fn copy_outlives_receive_buffer() {
        let mut buf = vec![3u8, 9];
        let p = Packet::copy_from(&buf, endpoint());
        buf[1] = 0;
        assert_eq!(p.payload(), &[9]);
        assert_eq!(p.address(), endpoint().ip());
        assert_eq!(p.port(), 51234);
    }

    #[test]
    fn kinds_map_to_fixed_tags() {
        for (i, kind) in PacketKind::ALL.into_iter().enumerate() {
            assert_eq!(kind.tag() as usize, i);
            assert_eq!(PacketKind::from_tag(i as u8), Some(kind));
        }
        assert_eq!(PacketKind::from_tag(7), None);
    }
}
