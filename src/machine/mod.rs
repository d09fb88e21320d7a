//! The peer state machine.
//!
//! ```text
//! Initial ──▶ RegisteredWithServer ──▶ ReceivedPeerInfo ──▶ SentPunchPacket ──▶ EstablishedConnection
//!                 ▲      │  ▲                 │  ▲                 │
//!                 └─poll─┘  └──send failed────┘  └────timeout──────┘
//!
//! any state ──▶ Failed          EstablishedConnection / Failed ──teardown──▶ Initial
//! ```
//!
//! One transition runs at a time; every wait inside a transition is bounded
//! by [`PeerConfig`] and interrupted by the attempt's cancellation token or
//! deadline.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::SystemTime;

use rendezvous_punch_core::error::Error as CoreError;
use rendezvous_punch_core::protocol::{Handshake, HandshakePacket, Verdict, PACKET_LEN};
use rendezvous_punch_core::socket::PunchSocket;
use rendezvous_punch_core::store::{Endpoint, EndpointRecord, RendezvousStore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::PeerConfig;
use crate::error::{Error, Result};

mod registration;
mod state;

use registration::Registration;
pub use state::{Attempt, ConnectionState, FailReason, PeerInfo, StateKind};

#[derive(Default)]
struct Interrupt {
    token: CancellationToken,
    deadline: Option<Instant>,
}

enum Fetch {
    Found(PeerInfo),
    Absent,
    Cancelled,
    Failed(Error),
}

type Transition = (ConnectionState, Option<Error>);

fn next(state: ConnectionState) -> Transition {
    (state, None)
}

fn fail(reason: FailReason, attempt: Option<Attempt>) -> Transition {
    (ConnectionState::Failed { reason, attempt }, None)
}

fn fatal(attempt: Option<Attempt>, error: Error) -> Transition {
    (
        ConnectionState::Failed {
            reason: FailReason::StoreUnavailable,
            attempt,
        },
        Some(error),
    )
}

pub struct PeerMachine {
    identity: String,
    store: Arc<dyn RendezvousStore>,
    config: PeerConfig,
    state: ConnectionState,
    interrupt: Interrupt,
}

impl PeerMachine {
    pub fn new(
        identity: impl Into<String>,
        store: Arc<dyn RendezvousStore>,
        config: PeerConfig,
    ) -> PeerMachine {
        Self {
            identity: identity.into(),
            store,
            config,
            state: ConnectionState::Initial,
            interrupt: Interrupt::default(),
        }
    }
    pub fn identity(&self) -> &str {
        &self.identity
    }
    pub fn config(&self) -> &PeerConfig {
        &self.config
    }
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Run a whole attempt against `peer_identity`, tearing down whatever
    /// the machine held before. `Ok(false)` covers every bounded failure;
    /// a cancelled or timed out attempt is torn down before returning.
    pub async fn run(
        &mut self,
        peer_identity: &str,
        token: CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<bool> {
        self.interrupt = Interrupt { token, deadline };
        self.start(peer_identity).await?;
        let rs = self.drive().await;
        if self.state.kind() == StateKind::Failed(FailReason::Cancelled) {
            log::info!("connect {} -> {peer_identity} cancelled", self.identity);
            self.teardown().await;
        }
        rs
    }

    /// Leave `Initial`: bind the socket and register a fresh session.
    pub async fn start(&mut self, peer_identity: &str) -> Result<()> {
        if self.state.kind() != StateKind::Initial {
            self.teardown().await;
        }
        self.config.validate()?;
        let socket = PunchSocket::bind(self.config.bind_addr)?;
        let handshake = Handshake::random();
        let mut endpoint = Endpoint::new(socket.port(), handshake.session_id());
        if let Some(host) = self.config.advertise_host {
            endpoint = endpoint.with_host(host);
        }
        let registration = Registration::register(
            self.store.clone(),
            &self.identity,
            endpoint,
            self.config.registration_ttl,
        );
        let (state, error) = match self.suspend(registration).await {
            Some(Ok(registration)) => next(ConnectionState::RegisteredWithServer(Attempt::new(
                socket,
                registration,
                handshake,
                peer_identity,
            ))),
            Some(Err(e)) => fatal(None, e.into()),
            None => {
                // the SET may still land
                if let Err(e) = self.store.deregister(&self.identity).await {
                    log::warn!("deregister {} {e:?}", self.identity);
                }
                fail(FailReason::Cancelled, None)
            }
        };
        self.enter(state);
        error.map_or(Ok(()), Err)
    }

    /// Step until `EstablishedConnection` (`true`) or `Failed` (`false`).
    pub async fn drive(&mut self) -> Result<bool> {
        loop {
            match self.state.kind() {
                StateKind::EstablishedConnection => return Ok(true),
                StateKind::Failed(reason) => {
                    log::warn!("connect {} failed: {reason:?}", self.identity);
                    return Ok(false);
                }
                StateKind::Initial => return Err(Error::InvalidState("attempt not started")),
                _ => self.step().await?,
            }
        }
    }

    /// Perform exactly one transition. From a terminal state this tears the
    /// attempt down.
    pub async fn step(&mut self) -> Result<()> {
        let state = std::mem::take(&mut self.state);
        let (state, error) = match state {
            ConnectionState::Initial => {
                return Err(Error::InvalidState("start an attempt before stepping"))
            }
            ConnectionState::RegisteredWithServer(attempt) => self.on_registered(attempt).await,
            ConnectionState::ReceivedPeerInfo(attempt, peer) => {
                self.on_peer_info(attempt, peer).await
            }
            ConnectionState::SentPunchPacket(attempt, peer) => {
                self.on_punch_sent(attempt, peer).await
            }
            terminal @ (ConnectionState::EstablishedConnection(..)
            | ConnectionState::Failed { .. }) => {
                self.state = terminal;
                self.teardown().await;
                return Ok(());
            }
        };
        self.enter(state);
        error.map_or(Ok(()), Err)
    }

    /// Release the socket, delete our record and return to `Initial`.
    pub async fn teardown(&mut self) {
        let state = std::mem::take(&mut self.state);
        let from = state.kind();
        if let Some(attempt) = state.into_attempt() {
            attempt.release().await;
        }
        if from != StateKind::Initial {
            log::debug!("{}: {from} -> {}", self.identity, StateKind::Initial);
        }
    }

    fn enter(&mut self, state: ConnectionState) {
        log::debug!("{}: -> {}", self.identity, state.kind());
        self.state = state;
    }

    async fn suspend<F: Future>(&self, fut: F) -> Option<F::Output> {
        let deadline = async {
            match self.interrupt.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.interrupt.token.cancelled() => None,
            _ = deadline => None,
            out = fut => Some(out),
        }
    }

    async fn on_registered(&self, mut attempt: Attempt) -> Transition {
        let fetched = self.fetch_peer(&attempt.peer_identity).await;
        match fetched {
            Fetch::Found(peer) => {
                log::info!(
                    "{}: found {} at {} session={}",
                    self.identity,
                    peer.identity,
                    peer.addr,
                    peer.session_id()
                );
                next(ConnectionState::ReceivedPeerInfo(attempt, peer))
            }
            Fetch::Absent => {
                attempt.polls += 1;
                if attempt.polls >= self.config.max_poll_attempts {
                    return fail(FailReason::PeerInfoUnavailable, Some(attempt));
                }
                match self.suspend(tokio::time::sleep(self.config.poll_interval)).await {
                    Some(()) => next(ConnectionState::RegisteredWithServer(attempt)),
                    None => fail(FailReason::Cancelled, Some(attempt)),
                }
            }
            Fetch::Cancelled => fail(FailReason::Cancelled, Some(attempt)),
            Fetch::Failed(e) => fatal(Some(attempt), e),
        }
    }

    async fn on_peer_info(&self, mut attempt: Attempt, peer: PeerInfo) -> Transition {
        if peer.record.is_expired(SystemTime::now()) {
            log::info!(
                "{}: record of {} expired, looking it up again",
                self.identity,
                peer.identity
            );
            attempt.handshake.reset_peer();
            return next(ConnectionState::RegisteredWithServer(attempt));
        }
        let bullet = attempt.handshake.bullet().encode();
        let syn = attempt.handshake.syn().encode();
        let socket = attempt.socket.clone();
        let punch = async {
            socket.send_to(&bullet, peer.addr).await?;
            socket.send_to(&syn, peer.addr).await
        };
        let sent = self.suspend(punch).await;
        match sent {
            None => fail(FailReason::Cancelled, Some(attempt)),
            Some(Err(e)) => {
                attempt.send_failures += 1;
                log::warn!(
                    "{}: punch {} failed ({}/{}) {e:?}",
                    self.identity,
                    peer.addr,
                    attempt.send_failures,
                    self.config.max_send_failures
                );
                if attempt.send_failures >= self.config.max_send_failures {
                    return fail(FailReason::PunchSendFailed, Some(attempt));
                }
                // the peer may have moved, fetch its record again
                attempt.handshake.reset_peer();
                next(ConnectionState::RegisteredWithServer(attempt))
            }
            Some(Ok(_)) => {
                log::debug!("{}: punched {}", self.identity, peer.addr);
                match self.suspend(tokio::time::sleep(self.config.settle_delay)).await {
                    Some(()) => next(ConnectionState::SentPunchPacket(attempt, peer)),
                    None => fail(FailReason::Cancelled, Some(attempt)),
                }
            }
        }
    }

    async fn on_punch_sent(&self, mut attempt: Attempt, mut peer: PeerInfo) -> Transition {
        let deadline = Instant::now() + self.config.response_timeout;
        let socket = attempt.socket.clone();
        let mut buf = [0u8; PACKET_LEN * 4];
        loop {
            let rs = match self.suspend(socket.recv_from_until(&mut buf, deadline)).await {
                Some(rs) => rs,
                None => return fail(FailReason::Cancelled, Some(attempt)),
            };
            let (len, from) = match rs {
                Ok(rs) => rs,
                Err(CoreError::Timeout) => break,
                Err(e) => {
                    log::debug!("{}: recv {e:?}", self.identity);
                    continue;
                }
            };
            if from != peer.addr {
                log::debug!("{}: ignore datagram from {from}", self.identity);
                continue;
            }
            let packet = match HandshakePacket::parse(&buf[..len]) {
                Ok(packet) => packet,
                Err(e) => {
                    log::debug!("{}: ignore datagram {e:?}", self.identity);
                    continue;
                }
            };
            let mut verdict = attempt.handshake.classify(&packet, peer.session_id());
            if let Verdict::Refresh { claimed } = verdict {
                let fetched = self.fetch_peer(&attempt.peer_identity).await;
                match fetched {
                    Fetch::Found(current) => {
                        if current.session_id() != peer.session_id() {
                            attempt.handshake.reset_peer();
                        }
                        peer = current;
                        if peer.session_id() != claimed || from != peer.addr {
                            log::info!(
                                "{}: drop {:?} from stale session {claimed}, {} advertises {}",
                                self.identity,
                                packet.kind,
                                peer.identity,
                                peer.session_id()
                            );
                            continue;
                        }
                        log::info!(
                            "{}: {} moved to session {claimed}",
                            self.identity,
                            peer.identity
                        );
                        verdict = attempt.handshake.classify(&packet, peer.session_id());
                    }
                    Fetch::Absent => {
                        log::info!("{}: record of {} is gone", self.identity, peer.identity);
                        continue;
                    }
                    Fetch::Cancelled => return fail(FailReason::Cancelled, Some(attempt)),
                    Fetch::Failed(e) => return fatal(Some(attempt), e),
                }
            }
            match verdict {
                Verdict::Discard(reason) => {
                    log::debug!("{}: drop {:?}: {reason}", self.identity, packet.kind);
                }
                Verdict::Refresh { .. } => {}
                Verdict::Respond(reply) => {
                    if let Err(e) = socket.send_to(&reply.encode(), peer.addr).await {
                        log::debug!("{}: answer syn {e:?}", self.identity);
                    }
                }
                Verdict::Complete { reply } => {
                    if self.config.verify_on_accept {
                        let fetched = self.fetch_peer(&attempt.peer_identity).await;
                        match fetched {
                            Fetch::Found(current) if current.session_id() == packet.session_id => {
                                peer = current;
                            }
                            Fetch::Found(current) => {
                                log::warn!(
                                    "{}: stale session mismatch, {} completed with {} but advertises {}",
                                    self.identity,
                                    peer.identity,
                                    packet.session_id,
                                    current.session_id()
                                );
                                attempt.handshake.reset_peer();
                                peer = current;
                                continue;
                            }
                            Fetch::Absent => {
                                log::warn!(
                                    "{}: {} completed but its record is gone",
                                    self.identity,
                                    peer.identity
                                );
                                continue;
                            }
                            Fetch::Cancelled => return fail(FailReason::Cancelled, Some(attempt)),
                            Fetch::Failed(e) => return fatal(Some(attempt), e),
                        }
                    }
                    if let Some(ack) = reply {
                        let ack = ack.encode();
                        for _ in 0..self.config.ack_redundancy.max(1) {
                            if let Err(e) = socket.send_to(&ack, peer.addr).await {
                                log::debug!("{}: send ack {e:?}", self.identity);
                            }
                        }
                    }
                    log::info!(
                        "{}: established with {} at {} session={}",
                        self.identity,
                        peer.identity,
                        peer.addr,
                        peer.session_id()
                    );
                    return next(ConnectionState::EstablishedConnection(attempt, peer));
                }
            }
        }
        attempt.punch_attempts += 1;
        log::debug!(
            "{}: no handshake from {} ({}/{})",
            self.identity,
            peer.addr,
            attempt.punch_attempts,
            self.config.max_punch_attempts
        );
        if attempt.punch_attempts >= self.config.max_punch_attempts {
            return fail(FailReason::HandshakeTimeout, Some(attempt));
        }
        next(ConnectionState::ReceivedPeerInfo(attempt, peer))
    }

    async fn fetch_peer(&self, peer_identity: &str) -> Fetch {
        let record = match self.suspend(self.store.lookup(peer_identity)).await {
            None => return Fetch::Cancelled,
            Some(Err(e)) => return Fetch::Failed(e.into()),
            Some(Ok(None)) => return Fetch::Absent,
            Some(Ok(Some(record))) => record,
        };
        if record.is_expired(SystemTime::now()) {
            return Fetch::Absent;
        }
        let resolved = self.suspend(self.resolve(peer_identity, &record)).await;
        match resolved {
            None => Fetch::Cancelled,
            Some(Ok(addr)) => Fetch::Found(PeerInfo {
                identity: peer_identity.to_string(),
                record,
                addr,
            }),
            Some(Err(e)) => {
                log::warn!("{}: resolve {peer_identity} {e:?}", self.identity);
                Fetch::Absent
            }
        }
    }

    async fn resolve(&self, peer_identity: &str, record: &EndpointRecord) -> Result<SocketAddr> {
        if let Some(host) = record.host {
            return Ok(SocketAddr::new(host, record.port));
        }
        if let Ok(ip) = peer_identity.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, record.port));
        }
        let lookup = tokio::net::lookup_host((peer_identity, record.port));
        let mut addrs = tokio::time::timeout(self.config.response_timeout, lookup)
            .await
            .map_err(|_| std::io::Error::from(std::io::ErrorKind::TimedOut))??;
        addrs
            .find(|addr| addr.is_ipv4() == self.config.bind_addr.is_ipv4())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("no usable address for {peer_identity}"),
                )
                .into()
            })
    }
}
