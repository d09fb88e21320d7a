//! Session-bound three-way handshake.
//!
//! ```text
//!  A                                         B
//!  |---- Bullet(sA) ----------------------->|   opens A's NAT mapping
//!  |---- Syn(sA, isnA) -------------------->|
//!  |<--- SynAck(sB, isnB+1, echo isnA) -----|
//!  |---- Ack(sA, isnA+2, echo isnB+1) ----->|
//! ```
//!
//! When both sides send `Syn` at the same time each answers the other's
//! `Syn` with a `SynAck`, and each completes on the `SynAck` it receives.
//!
//! [`Handshake`] does no I/O. It only decides what an incoming packet means
//! relative to the local session and the session the peer is currently
//! known to advertise; confirming that advertisement against the
//! rendezvous store is left to the caller.

use super::{HandshakePacket, ProtocolType, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Not a handshake step for this session pair.
    Discard(&'static str),
    /// The packet comes from a session other than the one cached for the
    /// peer. Re-read the peer's record and classify again if it now
    /// advertises `claimed`.
    Refresh { claimed: SessionId },
    /// Answer the peer's `Syn`.
    Respond(HandshakePacket),
    /// The peer proved it holds both current session ids. `reply` is the
    /// closing `Ack` to send, if any.
    Complete { reply: Option<HandshakePacket> },
}

#[derive(Debug, Clone)]
pub struct Handshake {
    session_id: SessionId,
    isn: u32,
    // seq of the peer Syn we answered with a SynAck
    answered_syn: Option<u32>,
}

impl Handshake {
    pub fn new(session_id: SessionId, isn: u32) -> Handshake {
        Self {
            session_id,
            isn,
            answered_syn: None,
        }
    }
    /// A fresh session with a random initial sequence number.
    pub fn random() -> Handshake {
        Self::new(SessionId::random(), rand::random())
    }
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }
    pub fn isn(&self) -> u32 {
        self.isn
    }
    pub fn bullet(&self) -> HandshakePacket {
        HandshakePacket::bullet(self.session_id, self.isn)
    }
    pub fn syn(&self) -> HandshakePacket {
        HandshakePacket::syn(self.session_id, self.isn)
    }
    fn syn_ack_seq(&self) -> u32 {
        self.isn.wrapping_add(1)
    }
    fn ack_seq(&self) -> u32 {
        self.isn.wrapping_add(2)
    }
    /// The `SynAck` answering `syn`. Does not record anything, so it can be
    /// used after the handshake is over to answer a peer that missed our
    /// `Ack`.
    pub fn answer(&self, syn: &HandshakePacket) -> HandshakePacket {
        HandshakePacket::syn_ack(self.session_id, self.syn_ack_seq(), syn.seq)
    }
    /// Forget everything learned from a previous peer session.
    pub fn reset_peer(&mut self) {
        self.answered_syn = None;
    }

    /// Classify `packet` against `advertised`, the peer session id the
    /// caller currently holds as live.
    pub fn classify(&mut self, packet: &HandshakePacket, advertised: SessionId) -> Verdict {
        match packet.kind {
            ProtocolType::Bullet => return Verdict::Discard("bullet"),
            ProtocolType::Unknown => return Verdict::Discard("unknown kind"),
            _ => {}
        }
        if packet.session_id != advertised {
            return Verdict::Refresh {
                claimed: packet.session_id,
            };
        }
        match packet.kind {
            ProtocolType::Syn => {
                self.answered_syn = Some(packet.seq);
                Verdict::Respond(self.answer(packet))
            }
            ProtocolType::SynAck => {
                if packet.peer_seq != self.isn {
                    return Verdict::Discard("syn-ack echoes another seq");
                }
                if let Some(peer_isn) = self.answered_syn {
                    if packet.seq != peer_isn.wrapping_add(1) {
                        return Verdict::Discard("syn-ack seq does not follow the peer syn");
                    }
                }
                Verdict::Complete {
                    reply: Some(HandshakePacket::ack(
                        self.session_id,
                        self.ack_seq(),
                        packet.seq,
                    )),
                }
            }
            ProtocolType::Ack => {
                let Some(peer_isn) = self.answered_syn else {
                    return Verdict::Discard("ack without a syn-ack");
                };
                if packet.peer_seq != self.syn_ack_seq() {
                    return Verdict::Discard("ack echoes another seq");
                }
                if packet.seq != peer_isn.wrapping_add(2) {
                    return Verdict::Discard("ack seq does not follow the peer syn");
                }
                Verdict::Complete { reply: None }
            }
            ProtocolType::Bullet | ProtocolType::Unknown => Verdict::Discard("not a handshake step"),
        }
    }
}
