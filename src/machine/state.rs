use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use rendezvous_punch_core::protocol::{Handshake, SessionId};
use rendezvous_punch_core::socket::PunchSocket;
use rendezvous_punch_core::store::EndpointRecord;

use super::registration::Registration;

/// The peer's record as last read from the store, and where it points.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub identity: String,
    pub record: EndpointRecord,
    pub addr: SocketAddr,
}

impl PeerInfo {
    pub fn session_id(&self) -> SessionId {
        self.record.session_id
    }
}

/// Everything one connection attempt owns: the socket, our registration,
/// our session and the retry counters.
pub struct Attempt {
    pub(crate) socket: Arc<PunchSocket>,
    pub(crate) registration: Registration,
    pub(crate) handshake: Handshake,
    pub(crate) peer_identity: String,
    pub(crate) polls: usize,
    pub(crate) send_failures: usize,
    pub(crate) punch_attempts: usize,
}

impl Attempt {
    pub(crate) fn new(
        socket: PunchSocket,
        registration: Registration,
        handshake: Handshake,
        peer_identity: &str,
    ) -> Attempt {
        Self {
            socket: Arc::new(socket),
            registration,
            handshake,
            peer_identity: peer_identity.to_string(),
            polls: 0,
            send_failures: 0,
            punch_attempts: 0,
        }
    }
    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }
    pub fn session_id(&self) -> SessionId {
        self.handshake.session_id()
    }
    pub fn peer_identity(&self) -> &str {
        &self.peer_identity
    }
    pub(crate) async fn release(self) {
        let Attempt {
            socket,
            registration,
            ..
        } = self;
        drop(socket);
        registration.release().await;
    }
}

impl fmt::Debug for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attempt")
            .field("local_addr", &self.local_addr())
            .field("session_id", &self.session_id())
            .field("peer_identity", &self.peer_identity)
            .field("polls", &self.polls)
            .field("send_failures", &self.send_failures)
            .field("punch_attempts", &self.punch_attempts)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    StoreUnavailable,
    PeerInfoUnavailable,
    PunchSendFailed,
    HandshakeTimeout,
    Cancelled,
}

/// Where a peer is in a connection attempt. Each state holds exactly the
/// data that exists in it.
#[derive(Debug, Default)]
pub enum ConnectionState {
    #[default]
    Initial,
    RegisteredWithServer(Attempt),
    ReceivedPeerInfo(Attempt, PeerInfo),
    SentPunchPacket(Attempt, PeerInfo),
    EstablishedConnection(Attempt, PeerInfo),
    Failed {
        reason: FailReason,
        attempt: Option<Attempt>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Initial,
    RegisteredWithServer,
    ReceivedPeerInfo,
    SentPunchPacket,
    EstablishedConnection,
    Failed(FailReason),
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl ConnectionState {
    pub fn kind(&self) -> StateKind {
        match self {
            ConnectionState::Initial => StateKind::Initial,
            ConnectionState::RegisteredWithServer(_) => StateKind::RegisteredWithServer,
            ConnectionState::ReceivedPeerInfo(..) => StateKind::ReceivedPeerInfo,
            ConnectionState::SentPunchPacket(..) => StateKind::SentPunchPacket,
            ConnectionState::EstablishedConnection(..) => StateKind::EstablishedConnection,
            ConnectionState::Failed { reason, .. } => StateKind::Failed(*reason),
        }
    }
    pub fn is_established(&self) -> bool {
        matches!(self, ConnectionState::EstablishedConnection(..))
    }
    pub fn attempt(&self) -> Option<&Attempt> {
        match self {
            ConnectionState::Initial => None,
            ConnectionState::RegisteredWithServer(attempt)
            | ConnectionState::ReceivedPeerInfo(attempt, _)
            | ConnectionState::SentPunchPacket(attempt, _)
            | ConnectionState::EstablishedConnection(attempt, _) => Some(attempt),
            ConnectionState::Failed { attempt, .. } => attempt.as_ref(),
        }
    }
    pub fn peer(&self) -> Option<&PeerInfo> {
        match self {
            ConnectionState::ReceivedPeerInfo(_, peer)
            | ConnectionState::SentPunchPacket(_, peer)
            | ConnectionState::EstablishedConnection(_, peer) => Some(peer),
            _ => None,
        }
    }
    pub(crate) fn into_attempt(self) -> Option<Attempt> {
        match self {
            ConnectionState::Initial => None,
            ConnectionState::RegisteredWithServer(attempt)
            | ConnectionState::ReceivedPeerInfo(attempt, _)
            | ConnectionState::SentPunchPacket(attempt, _)
            | ConnectionState::EstablishedConnection(attempt, _) => Some(attempt),
            ConnectionState::Failed { attempt, .. } => attempt,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ConnectionState, FailReason, StateKind};

    #[test]
    fn initial_holds_nothing() {
        let state = ConnectionState::default();
        assert_eq!(state.kind(), StateKind::Initial);
        assert!(state.attempt().is_none());
        assert!(state.peer().is_none());
        assert!(!state.is_established());
    }

    #[test]
    fn failed_keeps_reason() {
        let state = ConnectionState::Failed {
            reason: FailReason::HandshakeTimeout,
            attempt: None,
        };
        assert_eq!(state.kind(), StateKind::Failed(FailReason::HandshakeTimeout));
        assert_eq!(state.kind().to_string(), "Failed(HandshakeTimeout)");
        assert!(state.into_attempt().is_none());
    }
}
