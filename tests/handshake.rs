//! Two peers meeting over loopback through an in-process rendezvous store.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rendezvous_punch::{
    Builder, CancellationToken, ConnectionState, Endpoint, EndpointRecord, Error, FailReason,
    MemoryStore, Peer, PeerConfig, PeerMachine, RendezvousStore, StateKind, StoreError,
};
use rendezvous_punch_core::protocol::{HandshakePacket, ProtocolType, SessionId};
use tokio::net::UdpSocket;
use tokio::time::timeout;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const TEST_TIMEOUT: Duration = Duration::from_secs(20);

fn config() -> PeerConfig {
    PeerConfig::default()
        .set_bind_addr(SocketAddr::new(LOCALHOST, 0))
        .set_advertise_host(LOCALHOST)
        .set_registration_ttl(Duration::from_secs(60))
        .set_poll_interval(Duration::from_millis(20))
        .set_max_poll_attempts(100)
        .set_settle_delay(Duration::from_millis(10))
        .set_response_timeout(Duration::from_millis(200))
        .set_max_punch_attempts(10)
}

fn pair(store: &MemoryStore) -> (Peer, Peer) {
    (
        Peer::new("A", Arc::new(store.clone()), config()),
        Peer::new("B", Arc::new(store.clone()), config()),
    )
}

async fn connect_pair(a: &mut Peer, b: &mut Peer) {
    let (ra, rb) = timeout(TEST_TIMEOUT, async {
        tokio::join!(a.connect("B"), b.connect("A"))
    })
    .await
    .unwrap();
    assert!(ra.unwrap(), "A did not connect: {:?}", a.state());
    assert!(rb.unwrap(), "B did not connect: {:?}", b.state());
}

#[tokio::test]
async fn happy_path_carries_payload() {
    let store = MemoryStore::new();
    let (mut a, mut b) = pair(&store);
    connect_pair(&mut a, &mut b).await;

    assert_eq!(a.state().kind(), StateKind::EstablishedConnection);
    assert_eq!(b.state().kind(), StateKind::EstablishedConnection);
    assert_eq!(a.peer_addr(), b.local_addr());
    assert_eq!(b.peer_addr(), a.local_addr());
    let a_session = a.state().attempt().unwrap().session_id();
    assert_eq!(b.state().peer().unwrap().session_id(), a_session);

    let payload: [u8; 16] = *b"sixteen byte msg";
    assert_eq!(a.send(&payload).await.unwrap(), 16);
    let mut buf = [0u8; 1500];
    let len = b
        .receive_timeout(&mut buf, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(&buf[..len], &payload);

    a.close().await;
    b.close().await;
    assert!(store.is_empty());
}

#[tokio::test]
async fn close_deregisters_and_allows_reuse() {
    let store = MemoryStore::new();
    let (mut a, mut b) = pair(&store);
    connect_pair(&mut a, &mut b).await;
    let first = a.state().attempt().unwrap().session_id();

    a.close().await;
    assert!(!store.contains("A"));
    assert!(store.contains("B"));
    assert_eq!(a.state().kind(), StateKind::Initial);
    assert!(a.local_addr().is_none());
    b.close().await;

    connect_pair(&mut a, &mut b).await;
    assert_ne!(a.state().attempt().unwrap().session_id(), first);
    b.send(b"again").await.unwrap();
    let mut buf = [0u8; 64];
    let len = a
        .receive_timeout(&mut buf, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(&buf[..len], b"again");
}

#[tokio::test]
async fn stepping_an_established_machine_tears_it_down() {
    let store = MemoryStore::new();
    let mut a = PeerMachine::new("A", Arc::new(store.clone()), config());
    let mut b = PeerMachine::new("B", Arc::new(store.clone()), config());
    let (ra, rb) = timeout(TEST_TIMEOUT, async {
        tokio::join!(
            a.run("B", CancellationToken::new(), None),
            b.run("A", CancellationToken::new(), None)
        )
    })
    .await
    .unwrap();
    assert!(ra.unwrap() && rb.unwrap());

    a.step().await.unwrap();
    assert_eq!(a.state().kind(), StateKind::Initial);
    assert!(!store.contains("A"));
    assert!(matches!(a.step().await, Err(Error::InvalidState(_))));
}

#[tokio::test]
async fn stale_session_never_completes() {
    let store = MemoryStore::new();
    let old_b = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
    let port = old_b.local_addr().unwrap().port();
    let s1 = SessionId::new(0x51);
    let s2 = SessionId::new(0x52);
    let ttl = Duration::from_secs(60);
    store
        .register("B", &Endpoint::new(port, s1).with_host(LOCALHOST), ttl)
        .await
        .unwrap();

    // B restarts with s2 while its old instance keeps answering as s1
    let b_store = store.clone();
    let syn_acks = Arc::new(AtomicUsize::new(0));
    let answered = syn_acks.clone();
    tokio::spawn(async move {
        let mut buf = [0u8; 64];
        while let Ok((len, from)) = old_b.recv_from(&mut buf).await {
            let Ok(packet) = HandshakePacket::parse(&buf[..len]) else {
                continue;
            };
            if packet.kind != ProtocolType::Syn {
                continue;
            }
            b_store
                .register("B", &Endpoint::new(port, s2).with_host(LOCALHOST), ttl)
                .await
                .unwrap();
            let reply = HandshakePacket::syn_ack(s1, 1000, packet.seq);
            old_b.send_to(&reply.encode(), from).await.unwrap();
            answered.fetch_add(1, Ordering::SeqCst);
        }
    });

    let mut a = Peer::new(
        "A",
        Arc::new(store.clone()),
        config().set_max_punch_attempts(3),
    );
    let connected = timeout(TEST_TIMEOUT, a.connect("B")).await.unwrap().unwrap();
    assert!(!connected);
    assert_eq!(
        a.state().kind(),
        StateKind::Failed(FailReason::HandshakeTimeout)
    );
    assert!(syn_acks.load(Ordering::SeqCst) >= 1);
    assert!(matches!(a.send(b"x").await, Err(Error::InvalidState(_))));
    a.close().await;
    assert!(!store.contains("A"));
}

#[derive(Default)]
struct AbsentStore {
    lookups: AtomicUsize,
}

#[async_trait]
impl RendezvousStore for AbsentStore {
    async fn register(&self, _: &str, _: &Endpoint, _: Duration) -> Result<(), StoreError> {
        Ok(())
    }
    async fn lookup(&self, _: &str) -> Result<Option<EndpointRecord>, StoreError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }
    async fn deregister(&self, _: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

#[tokio::test]
async fn polling_for_absent_peer_is_bounded() {
    let store = Arc::new(AbsentStore::default());
    let mut a = Peer::new("A", store.clone(), config().set_max_poll_attempts(5));
    let connected = timeout(TEST_TIMEOUT, a.connect("B")).await.unwrap().unwrap();
    assert!(!connected);
    assert_eq!(
        a.state().kind(),
        StateKind::Failed(FailReason::PeerInfoUnavailable)
    );
    assert_eq!(store.lookups.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn expired_peer_record_is_not_used() {
    let store = MemoryStore::new();
    let silent = UdpSocket::bind((LOCALHOST, 0)).await.unwrap();
    let port = silent.local_addr().unwrap().port();
    store
        .register(
            "B",
            &Endpoint::new(port, SessionId::new(7)).with_host(LOCALHOST),
            Duration::from_millis(100),
        )
        .await
        .unwrap();

    let mut a = Peer::new(
        "A",
        Arc::new(store.clone()),
        config().set_max_poll_attempts(5),
    );
    let connected = timeout(TEST_TIMEOUT, a.connect("B")).await.unwrap().unwrap();
    assert!(!connected);
    assert_eq!(
        a.state().kind(),
        StateKind::Failed(FailReason::PeerInfoUnavailable)
    );
    assert!(!store.contains("B"));
}

#[tokio::test]
async fn cancelled_connect_deregisters() {
    let store = MemoryStore::new();
    let mut a = Peer::new("A", Arc::new(store.clone()), config());
    let token = CancellationToken::new();
    let cancel = token.clone();
    let probe = store.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(probe.contains("A"));
        cancel.cancel();
    });
    let connected = timeout(TEST_TIMEOUT, a.connect_with_cancel("nobody", token))
        .await
        .unwrap()
        .unwrap();
    assert!(!connected);
    assert_eq!(a.state().kind(), StateKind::Initial);
    assert!(!store.contains("A"));
}

#[tokio::test]
async fn connect_deadline_tears_down() {
    let store = MemoryStore::new();
    let mut a = Peer::new("A", Arc::new(store.clone()), config());
    let connected = timeout(
        TEST_TIMEOUT,
        a.connect_timeout("nobody", Duration::from_millis(150)),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(!connected);
    assert!(matches!(a.state(), ConnectionState::Initial));
    assert!(store.is_empty());
}

#[tokio::test]
async fn data_calls_before_connect_are_invalid() {
    let a = Peer::new("A", Arc::new(MemoryStore::new()), config());
    assert!(matches!(a.send(b"early").await, Err(Error::InvalidState(_))));
    let mut buf = [0u8; 16];
    assert!(matches!(
        a.receive(&mut buf).await,
        Err(Error::InvalidState(_))
    ));
    assert!(matches!(a.split(), Err(Error::InvalidState(_))));
}

#[tokio::test]
async fn split_halves_run_concurrently() {
    let store = MemoryStore::new();
    let (mut a, mut b) = pair(&store);
    connect_pair(&mut a, &mut b).await;
    let (a_tx, a_rx) = a.split().unwrap();
    let (b_tx, b_rx) = b.split().unwrap();

    const COUNT: u8 = 5;
    fn sender(tx: rendezvous_punch::PeerSender, tag: u8) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            for i in 0..COUNT {
                tx.send(&[tag, i]).await.unwrap();
            }
        })
    }
    fn receiver(rx: rendezvous_punch::PeerReceiver) -> tokio::task::JoinHandle<Vec<Vec<u8>>> {
        tokio::spawn(async move {
            let mut got = Vec::new();
            let mut buf = [0u8; 64];
            while got.len() < COUNT as usize {
                let len = rx
                    .receive_timeout(&mut buf, Duration::from_secs(2))
                    .await
                    .unwrap();
                got.push(buf[..len].to_vec());
            }
            got
        })
    }
    let a_got = receiver(a_rx);
    let b_got = receiver(b_rx);
    sender(a_tx, b'a').await.unwrap();
    sender(b_tx, b'b').await.unwrap();

    let a_got = a_got.await.unwrap();
    let b_got = b_got.await.unwrap();
    assert_eq!(a_got, (0..COUNT).map(|i| vec![b'b', i]).collect::<Vec<_>>());
    assert_eq!(b_got, (0..COUNT).map(|i| vec![b'a', i]).collect::<Vec<_>>());
}

struct BrokenStore {
    fail_register: bool,
}

#[async_trait]
impl RendezvousStore for BrokenStore {
    async fn register(&self, _: &str, _: &Endpoint, _: Duration) -> Result<(), StoreError> {
        if self.fail_register {
            return Err(StoreError::Io(std::io::ErrorKind::ConnectionRefused.into()));
        }
        Ok(())
    }
    async fn lookup(&self, _: &str) -> Result<Option<EndpointRecord>, StoreError> {
        Err(StoreError::Protocol("READONLY".into()))
    }
    async fn deregister(&self, _: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

#[tokio::test]
async fn store_failures_are_errors() {
    for fail_register in [true, false] {
        let mut a = Peer::new("A", Arc::new(BrokenStore { fail_register }), config());
        let rs = timeout(TEST_TIMEOUT, a.connect("B")).await.unwrap();
        assert!(matches!(rs, Err(Error::StoreUnavailable(_))), "{rs:?}");
        assert_eq!(
            a.state().kind(),
            StateKind::Failed(FailReason::StoreUnavailable)
        );
        a.close().await;
        assert_eq!(a.state().kind(), StateKind::Initial);
    }
}

#[tokio::test]
async fn ttl_within_attempt_budget_is_rejected() {
    let short = config().set_registration_ttl(Duration::from_secs(1));
    let built = Builder::new()
        .identity("A")
        .store(MemoryStore::new())
        .config(short.clone())
        .build();
    assert!(matches!(built, Err(Error::InvalidConfig(_))));

    let store = MemoryStore::new();
    let mut a = Peer::new("A", Arc::new(store.clone()), short);
    assert!(matches!(
        a.connect("B").await,
        Err(Error::InvalidConfig(_))
    ));
    assert!(store.is_empty());
    assert!(matches!(
        Builder::new().store(MemoryStore::new()).build(),
        Err(Error::InvalidConfig(_))
    ));
}
