//! Direct UDP connections between two peers behind NATs, coordinated through
//! a shared rendezvous store.
//!
//! Each [`Peer`] publishes `port|session` under its identity, looks up the
//! other side, punches its NAT and runs a three-way handshake bound to both
//! sides' current session ids. Once connected the same UDP socket carries
//! application datagrams.
//!
//! ```no_run
//! use rendezvous_punch::{Builder, PeerConfig};
//! # async fn f() -> rendezvous_punch::Result<()> {
//! let mut peer = Builder::new()
//!     .identity("10.0.0.1")
//!     .redis("rendezvous.example.com:6379")
//!     .config(PeerConfig::default())
//!     .build()?;
//! if peer.connect("10.0.0.2").await? {
//!     peer.send(b"hello").await?;
//! }
//! peer.close().await;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rendezvous_punch_core::protocol::{Handshake, HandshakePacket, ProtocolType, SessionId};
use rendezvous_punch_core::socket::PunchSocket;
use tokio::time::Instant;

pub mod config;
mod error;
pub mod machine;

pub use config::PeerConfig;
pub use error::{Error, Result};
pub use machine::{ConnectionState, FailReason, PeerMachine, StateKind};
pub use rendezvous_punch_core::store::{
    Endpoint, EndpointRecord, MemoryStore, RedisStore, RendezvousStore, StoreError,
};
pub use tokio_util::sync::CancellationToken;

pub struct Peer {
    machine: PeerMachine,
}

impl Peer {
    pub fn new(
        identity: impl Into<String>,
        store: Arc<dyn RendezvousStore>,
        config: PeerConfig,
    ) -> Peer {
        Self {
            machine: PeerMachine::new(identity, store, config),
        }
    }
    pub fn identity(&self) -> &str {
        self.machine.identity()
    }
    pub fn state(&self) -> &ConnectionState {
        self.machine.state()
    }
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.machine.state().attempt().map(|attempt| attempt.local_addr())
    }
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.machine.state().peer().map(|peer| peer.addr)
    }

    /// Connect to `peer_identity`. `Ok(true)` once both sides agree on their
    /// current sessions, `Ok(false)` when the attempt ran out of retries.
    /// Any previous connection is closed first.
    pub async fn connect(&mut self, peer_identity: &str) -> Result<bool> {
        self.machine
            .run(peer_identity, CancellationToken::new(), None)
            .await
    }
    /// Like [`connect`](Peer::connect); cancelling `token` tears the attempt
    /// down and returns `Ok(false)`.
    pub async fn connect_with_cancel(
        &mut self,
        peer_identity: &str,
        token: CancellationToken,
    ) -> Result<bool> {
        self.machine.run(peer_identity, token, None).await
    }
    pub async fn connect_timeout(
        &mut self,
        peer_identity: &str,
        timeout: Duration,
    ) -> Result<bool> {
        self.machine
            .run(
                peer_identity,
                CancellationToken::new(),
                Some(Instant::now() + timeout),
            )
            .await
    }

    pub async fn send(&self, buf: &[u8]) -> Result<usize> {
        let link = self.link()?;
        link.send(buf).await
    }
    /// Receive one datagram from the peer. Handshake traffic the peer keeps
    /// sending after the connection is up is answered or dropped here.
    pub async fn receive(&self, buf: &mut [u8]) -> Result<usize> {
        let link = self.link()?;
        link.recv(buf, None).await
    }
    pub async fn receive_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let link = self.link()?;
        link.recv(buf, Some(Instant::now() + timeout)).await
    }

    /// Halves of the connection for two independent tasks. Both share the
    /// socket, which stays open until the `Peer` is closed and both halves
    /// are dropped.
    pub fn split(&self) -> Result<(PeerSender, PeerReceiver)> {
        let link = Arc::new(self.link()?);
        Ok((
            PeerSender { link: link.clone() },
            PeerReceiver { link },
        ))
    }

    /// Release the socket, deregister and return to `Initial`.
    pub async fn close(&mut self) {
        self.machine.teardown().await;
    }

    fn link(&self) -> Result<Link> {
        match self.machine.state() {
            ConnectionState::EstablishedConnection(attempt, peer) => Ok(Link {
                socket: attempt.socket.clone(),
                peer_addr: peer.addr,
                peer_session: peer.session_id(),
                handshake: attempt.handshake.clone(),
            }),
            _ => Err(Error::InvalidState("not connected")),
        }
    }
}

#[derive(Clone)]
pub struct PeerSender {
    link: Arc<Link>,
}

impl PeerSender {
    pub fn peer_addr(&self) -> SocketAddr {
        self.link.peer_addr
    }
    pub async fn send(&self, buf: &[u8]) -> Result<usize> {
        self.link.send(buf).await
    }
}

pub struct PeerReceiver {
    link: Arc<Link>,
}

impl PeerReceiver {
    pub fn peer_addr(&self) -> SocketAddr {
        self.link.peer_addr
    }
    pub async fn receive(&self, buf: &mut [u8]) -> Result<usize> {
        self.link.recv(buf, None).await
    }
    pub async fn receive_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.link.recv(buf, Some(Instant::now() + timeout)).await
    }
}

struct Link {
    socket: Arc<PunchSocket>,
    peer_addr: SocketAddr,
    peer_session: SessionId,
    handshake: Handshake,
}

impl Link {
    async fn send(&self, buf: &[u8]) -> Result<usize> {
        Ok(self.socket.send_to(buf, self.peer_addr).await?)
    }

    async fn recv(&self, buf: &mut [u8], deadline: Option<Instant>) -> Result<usize> {
        loop {
            let (len, from) = match deadline {
                Some(deadline) => self.socket.recv_from_until(buf, deadline).await?,
                None => self.socket.recv_from(buf).await?,
            };
            if from != self.peer_addr {
                log::debug!("ignore datagram from {from}");
                continue;
            }
            let packet = match HandshakePacket::parse(&buf[..len]) {
                Ok(packet) if packet.session_id == self.peer_session => packet,
                _ => return Ok(len),
            };
            if packet.kind == ProtocolType::Syn {
                // our closing Ack was lost
                let reply = self.handshake.answer(&packet).encode();
                if let Err(e) = self.socket.send_to(&reply, self.peer_addr).await {
                    log::debug!("answer syn {e:?}");
                }
            }
        }
    }
}

pub struct Builder {
    identity: Option<String>,
    store: Option<Arc<dyn RendezvousStore>>,
    config: Option<PeerConfig>,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            identity: None,
            store: None,
            config: None,
        }
    }
    pub fn identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }
    pub fn store<S: RendezvousStore + 'static>(mut self, store: S) -> Self {
        self.store = Some(Arc::new(store));
        self
    }
    pub fn redis(self, addr: impl Into<String>) -> Self {
        self.store(RedisStore::new(addr))
    }
    pub fn config(mut self, config: PeerConfig) -> Self {
        self.config = Some(config);
        self
    }
    pub fn build(self) -> Result<Peer> {
        let identity = self
            .identity
            .ok_or(Error::InvalidConfig("identity is required".into()))?;
        let store = self
            .store
            .ok_or(Error::InvalidConfig("store is required".into()))?;
        let config = self.config.unwrap_or_default();
        config.validate()?;
        Ok(Peer::new(identity, store, config))
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}
