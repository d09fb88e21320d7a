use std::io;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::resp::{self, Reply};
use super::{Endpoint, EndpointRecord, RendezvousStore, Result, StoreError};

const IO_TIMEOUT: Duration = Duration::from_secs(5);

struct Connection {
    stream: TcpStream,
    buf: BytesMut,
}

/// Rendezvous store backed by a Redis-compatible server.
///
/// Records are written with `SET key value EX ttl`, read with `GET` and
/// `PTTL`, and removed with `DEL`. One connection is opened lazily and
/// reused; after any I/O failure it is dropped so the next call reconnects.
/// Calls are never retried here.
pub struct RedisStore {
    addr: String,
    prefix: String,
    io_timeout: Duration,
    conn: Mutex<Option<Connection>>,
}

impl RedisStore {
    /// `addr` is `host:port`.
    pub fn new(addr: impl Into<String>) -> RedisStore {
        Self {
            addr: addr.into(),
            prefix: String::new(),
            io_timeout: IO_TIMEOUT,
            conn: Mutex::new(None),
        }
    }
    /// Namespace every key, e.g. `"punch:"`.
    pub fn set_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
    pub fn set_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }
    pub fn addr(&self) -> &str {
        &self.addr
    }
    fn key(&self, identity: &str) -> String {
        format!("{}{}", self.prefix, identity)
    }

    async fn request(&self, args: &[&[u8]]) -> Result<Reply> {
        let mut slot = self.conn.lock().await;
        let rs = tokio::time::timeout(self.io_timeout, Self::round_trip(&self.addr, &mut slot, args))
            .await
            .unwrap_or_else(|_| {
                Err(StoreError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no reply from {} within {:?}", self.addr, self.io_timeout),
                )))
            });
        match rs {
            Ok(Reply::Error(e)) => Err(StoreError::Protocol(e)),
            Ok(reply) => Ok(reply),
            Err(e) => {
                log::debug!("drop rendezvous connection {}: {e:?}", self.addr);
                slot.take();
                Err(e)
            }
        }
    }

    async fn round_trip(
        addr: &str,
        slot: &mut Option<Connection>,
        args: &[&[u8]],
    ) -> Result<Reply> {
        if slot.is_none() {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            log::debug!("connected to rendezvous store {addr}");
            *slot = Some(Connection {
                stream,
                buf: BytesMut::with_capacity(512),
            });
        }
        let Some(conn) = slot.as_mut() else {
            return Err(StoreError::Io(io::Error::from(io::ErrorKind::NotConnected)));
        };
        let mut out = BytesMut::new();
        resp::encode_command(args, &mut out);
        conn.stream.write_all(&out).await?;
        loop {
            if let Some(reply) = resp::decode(&mut conn.buf).map_err(StoreError::Protocol)? {
                return Ok(reply);
            }
            if conn.stream.read_buf(&mut conn.buf).await? == 0 {
                return Err(StoreError::Io(io::Error::from(io::ErrorKind::UnexpectedEof)));
            }
        }
    }
}

fn unexpected(command: &str, reply: Reply) -> StoreError {
    StoreError::Protocol(format!("unexpected reply to {command}: {reply:?}"))
}

#[async_trait]
impl RendezvousStore for RedisStore {
    async fn register(&self, identity: &str, endpoint: &Endpoint, ttl: Duration) -> Result<()> {
        let key = self.key(identity);
        let value = endpoint.encode();
        let (unit, amount) = if ttl.subsec_millis() == 0 {
            ("EX", ttl.as_secs().max(1))
        } else {
            ("PX", ttl.as_millis() as u64)
        };
        let amount = amount.to_string();
        let reply = self
            .request(&[
                b"SET",
                key.as_bytes(),
                value.as_bytes(),
                unit.as_bytes(),
                amount.as_bytes(),
            ])
            .await?;
        match reply {
            Reply::Simple(ok) if ok == "OK" => Ok(()),
            reply => Err(unexpected("SET", reply)),
        }
    }

    async fn lookup(&self, identity: &str) -> Result<Option<EndpointRecord>> {
        let key = self.key(identity);
        let value = match self.request(&[b"GET", key.as_bytes()]).await? {
            Reply::Bulk(None) => return Ok(None),
            Reply::Bulk(Some(value)) => value,
            reply => return Err(unexpected("GET", reply)),
        };
        let malformed = |reason: String| StoreError::Malformed {
            identity: identity.to_string(),
            reason,
        };
        let value = String::from_utf8(value).map_err(|e| malformed(format!("{e}")))?;
        let endpoint = Endpoint::decode(&value).map_err(malformed)?;
        let expires_at = match self.request(&[b"PTTL", key.as_bytes()]).await? {
            // deleted or expired between GET and PTTL
            Reply::Integer(-2) => return Ok(None),
            Reply::Integer(-1) => None,
            Reply::Integer(ms) if ms >= 0 => {
                Some(SystemTime::now() + Duration::from_millis(ms as u64))
            }
            reply => return Err(unexpected("PTTL", reply)),
        };
        Ok(Some(EndpointRecord::new(endpoint, expires_at)))
    }

    async fn deregister(&self, identity: &str) -> Result<()> {
        let key = self.key(identity);
        match self.request(&[b"DEL", key.as_bytes()]).await? {
            Reply::Integer(_) => Ok(()),
            reply => Err(unexpected("DEL", reply)),
        }
    }
}
