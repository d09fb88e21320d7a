//! Rendezvous store adapters.
//!
//! A rendezvous store maps an identity to the endpoint a peer is currently
//! reachable on, under a TTL lease. Writes are last-writer-wins per key and
//! nothing is atomic across two identities, so every record read here is a
//! snapshot that may already be stale.
//!
//! Adapters never retry. A failed `register` or `lookup` is returned to the
//! caller as is; `deregister` failures are for the caller to log and
//! ignore, a lapsed lease having the same effect.
//!
//! # Examples
//!
//! ```rust
//! use rendezvous_punch_core::protocol::SessionId;
//! use rendezvous_punch_core::store::{Endpoint, MemoryStore, RendezvousStore};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), rendezvous_punch_core::store::StoreError> {
//! let store = MemoryStore::new();
//! let endpoint = Endpoint::new(5000, SessionId::new(1));
//! store.register("A", &endpoint, Duration::from_secs(600)).await?;
//! let record = store.lookup("A").await?.unwrap();
//! assert_eq!(record.port, 5000);
//! # Ok(())
//! # }
//! ```

use std::io;
use std::net::IpAddr;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use thiserror::Error;

use crate::protocol::SessionId;

pub mod memory;
pub mod redis;
pub(crate) mod resp;

pub use memory::MemoryStore;
pub use redis::RedisStore;

pub const DEFAULT_TTL: Duration = Duration::from_secs(600);

const VALUE_DELIMITER: char = '|';

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Io(#[from] io::Error),
    #[error("store protocol error: {0}")]
    Protocol(String),
    #[error("malformed record for '{identity}': {reason}")]
    Malformed { identity: String, reason: String },
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// What a peer publishes about itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub port: u16,
    pub session_id: SessionId,
    /// Reachable host, when it cannot be derived from the identity.
    pub host: Option<IpAddr>,
}

impl Endpoint {
    pub fn new(port: u16, session_id: SessionId) -> Self {
        Self {
            port,
            session_id,
            host: None,
        }
    }
    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.host = Some(host);
        self
    }

    /// `<port>|<session>` or `<port>|<session>|<host>`.
    pub fn encode(&self) -> String {
        match self.host {
            Some(host) => format!(
                "{}{VALUE_DELIMITER}{}{VALUE_DELIMITER}{host}",
                self.port, self.session_id
            ),
            None => format!("{}{VALUE_DELIMITER}{}", self.port, self.session_id),
        }
    }

    pub fn decode(value: &str) -> std::result::Result<Endpoint, String> {
        let mut split = value.trim().split(VALUE_DELIMITER);
        let port = split
            .next()
            .ok_or("missing port")?
            .parse::<u16>()
            .map_err(|e| format!("port: {e}"))?;
        let session_id = split
            .next()
            .ok_or("missing session id")?
            .parse::<SessionId>()?;
        let host = match split.next() {
            Some(host) => Some(
                host.parse::<IpAddr>()
                    .map_err(|e| format!("host '{host}': {e}"))?,
            ),
            None => None,
        };
        if split.next().is_some() {
            return Err("too many fields".to_string());
        }
        Ok(Endpoint {
            port,
            session_id,
            host,
        })
    }
}

/// A looked-up [`Endpoint`] together with its lease.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointRecord {
    pub port: u16,
    pub session_id: SessionId,
    pub host: Option<IpAddr>,
    /// `None` when the store holds the key without a lease.
    pub expires_at: Option<SystemTime>,
}

impl EndpointRecord {
    pub fn new(endpoint: Endpoint, expires_at: Option<SystemTime>) -> Self {
        Self {
            port: endpoint.port,
            session_id: endpoint.session_id,
            host: endpoint.host,
            expires_at,
        }
    }
    pub fn endpoint(&self) -> Endpoint {
        Endpoint {
            port: self.port,
            session_id: self.session_id,
            host: self.host,
        }
    }
    pub fn is_expired(&self, now: SystemTime) -> bool {
        matches!(self.expires_at, Some(expires_at) if expires_at <= now)
    }
}

#[async_trait]
pub trait RendezvousStore: Send + Sync {
    /// Overwrite the record for `identity` and restart its lease.
    async fn register(&self, identity: &str, endpoint: &Endpoint, ttl: Duration) -> Result<()>;
    /// `None` when absent or expired.
    async fn lookup(&self, identity: &str) -> Result<Option<EndpointRecord>>;
    async fn deregister(&self, identity: &str) -> Result<()>;
}

#[async_trait]
impl<S: RendezvousStore + ?Sized> RendezvousStore for std::sync::Arc<S> {
    async fn register(&self, identity: &str, endpoint: &Endpoint, ttl: Duration) -> Result<()> {
        (**self).register(identity, endpoint, ttl).await
    }
    async fn lookup(&self, identity: &str) -> Result<Option<EndpointRecord>> {
        (**self).lookup(identity).await
    }
    async fn deregister(&self, identity: &str) -> Result<()> {
        (**self).deregister(identity).await
    }
}
