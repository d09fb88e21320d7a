/*
   0               1               2               3
   0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |   kind (8)    |               session id (64) ...             |
  +-+-+-+-+-+-+-+-+                                               +
  |                                                               |
  +               +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |               |                   seq (32) ...                |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |               |                 peer seq (32) ...             |
  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
  |               |
  +-+-+-+-+-+-+-+-+
*/
//! Punch and handshake datagrams.
//!
//! Every datagram is exactly [`PACKET_LEN`] bytes, integers in network byte
//! order. `peer seq` is zero for `Bullet` and `Syn`.

pub mod handshake;
pub mod session;

pub use handshake::{Handshake, Verdict};
pub use session::SessionId;

use crate::error::{Error, Result};

pub const PACKET_LEN: usize = 17;

const OFF_KIND: usize = 0;
const OFF_SESSION: usize = 1;
const OFF_SEQ: usize = 9;
const OFF_PEER_SEQ: usize = 13;

#[derive(Eq, PartialEq, Copy, Clone, Debug)]
#[repr(u8)]
pub enum ProtocolType {
    /// Opens the NAT mapping, carries no handshake meaning
    Bullet = 0,
    Syn = 1,
    SynAck = 2,
    Ack = 3,
    Unknown = 255,
}

impl From<u8> for ProtocolType {
    fn from(value: u8) -> Self {
        match value {
            0 => ProtocolType::Bullet,
            1 => ProtocolType::Syn,
            2 => ProtocolType::SynAck,
            3 => ProtocolType::Ack,
            _ => ProtocolType::Unknown,
        }
    }
}

impl From<ProtocolType> for u8 {
    fn from(value: ProtocolType) -> Self {
        value as u8
    }
}

#[derive(Eq, PartialEq, Copy, Clone, Debug)]
pub struct HandshakePacket {
    pub kind: ProtocolType,
    /// The sender's session
    pub session_id: SessionId,
    pub seq: u32,
    /// Echo of the receiver's sequence number
    pub peer_seq: u32,
}

impl HandshakePacket {
    pub fn bullet(session_id: SessionId, seq: u32) -> Self {
        Self::new(ProtocolType::Bullet, session_id, seq, 0)
    }
    pub fn syn(session_id: SessionId, seq: u32) -> Self {
        Self::new(ProtocolType::Syn, session_id, seq, 0)
    }
    pub fn syn_ack(session_id: SessionId, seq: u32, peer_seq: u32) -> Self {
        Self::new(ProtocolType::SynAck, session_id, seq, peer_seq)
    }
    pub fn ack(session_id: SessionId, seq: u32, peer_seq: u32) -> Self {
        Self::new(ProtocolType::Ack, session_id, seq, peer_seq)
    }
    fn new(kind: ProtocolType, session_id: SessionId, seq: u32, peer_seq: u32) -> Self {
        Self {
            kind,
            session_id,
            seq,
            peer_seq,
        }
    }

    pub fn encode(&self) -> [u8; PACKET_LEN] {
        let mut buf = [0u8; PACKET_LEN];
        buf[OFF_KIND] = self.kind.into();
        buf[OFF_SESSION..OFF_SEQ].copy_from_slice(&self.session_id.to_be_bytes());
        buf[OFF_SEQ..OFF_PEER_SEQ].copy_from_slice(&self.seq.to_be_bytes());
        buf[OFF_PEER_SEQ..PACKET_LEN].copy_from_slice(&self.peer_seq.to_be_bytes());
        buf
    }

    /// Rejects anything that is not exactly one well-formed datagram.
    pub fn parse(buf: &[u8]) -> Result<HandshakePacket> {
        if buf.len() < PACKET_LEN {
            return Err(Error::PacketTooShort {
                len: buf.len(),
                required: PACKET_LEN,
            });
        }
        if buf.len() > PACKET_LEN {
            return Err(Error::InvalidPacket(format!(
                "trailing bytes: len is {}",
                buf.len()
            )));
        }
        let kind = ProtocolType::from(buf[OFF_KIND]);
        if kind == ProtocolType::Unknown {
            return Err(Error::InvalidPacket(format!("unknown kind {}", buf[OFF_KIND])));
        }
        let mut session = [0u8; 8];
        session.copy_from_slice(&buf[OFF_SESSION..OFF_SEQ]);
        let mut seq = [0u8; 4];
        seq.copy_from_slice(&buf[OFF_SEQ..OFF_PEER_SEQ]);
        let mut peer_seq = [0u8; 4];
        peer_seq.copy_from_slice(&buf[OFF_PEER_SEQ..PACKET_LEN]);
        Ok(HandshakePacket {
            kind,
            session_id: SessionId::from_be_bytes(session),
            seq: u32::from_be_bytes(seq),
            peer_seq: u32::from_be_bytes(peer_seq),
        })
    }
}

#[cfg(test)]
mod test {
    use super::{HandshakePacket, ProtocolType, SessionId, PACKET_LEN};
    use crate::error::Error;

    #[test]
    fn test_protocol_type() {
        assert_eq!(ProtocolType::from(2), ProtocolType::SynAck);
        assert_eq!(ProtocolType::from(128), ProtocolType::Unknown);
    }

    #[test]
    fn syn_ack_layout() {
        let packet = HandshakePacket::syn_ack(SessionId::new(0x0102030405060708), 9, 0xA0B0C0D0);
        let buf = packet.encode();
        assert_eq!(
            buf,
            [2, 1, 2, 3, 4, 5, 6, 7, 8, 0, 0, 0, 9, 0xA0, 0xB0, 0xC0, 0xD0]
        );
        assert_eq!(HandshakePacket::parse(&buf).unwrap(), packet);
    }

    #[test]
    fn bullet_and_syn_leave_peer_seq_zero() {
        let session = SessionId::new(7);
        assert_eq!(HandshakePacket::bullet(session, 5).encode()[13..], [0; 4]);
        assert_eq!(HandshakePacket::syn(session, 5).encode()[13..], [0; 4]);
    }

    #[test]
    fn reject_malformed() {
        assert!(matches!(
            HandshakePacket::parse(b"Punch"),
            Err(Error::PacketTooShort { len: 5, .. })
        ));
        let mut buf = HandshakePacket::ack(SessionId::new(1), 1, 1).encode();
        buf[0] = 9;
        assert!(matches!(
            HandshakePacket::parse(&buf),
            Err(Error::InvalidPacket(_))
        ));
        let long = [0u8; PACKET_LEN + 1];
        assert!(HandshakePacket::parse(&long).is_err());
    }
}
