use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Endpoint, EndpointRecord, RendezvousStore, Result};

/// In-process rendezvous store with TTL leases.
///
/// Clones share the same records, so two peers in one process can meet
/// through it.
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<HashMap<String, (Endpoint, Instant, SystemTime)>>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        Self::default()
    }
    fn clean(&self) {
        let now = Instant::now();
        self.records
            .lock()
            .retain(|_identity, (_, deadline, _)| *deadline > now);
    }
    /// Number of live records.
    pub fn len(&self) -> usize {
        self.clean();
        self.records.lock().len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn contains(&self, identity: &str) -> bool {
        self.clean();
        self.records.lock().contains_key(identity)
    }
}

#[async_trait]
impl RendezvousStore for MemoryStore {
    async fn register(&self, identity: &str, endpoint: &Endpoint, ttl: Duration) -> Result<()> {
        let deadline = Instant::now() + ttl;
        let expires_at = SystemTime::now() + ttl;
        self.records
            .lock()
            .insert(identity.to_string(), (*endpoint, deadline, expires_at));
        Ok(())
    }

    async fn lookup(&self, identity: &str) -> Result<Option<EndpointRecord>> {
        self.clean();
        Ok(self
            .records
            .lock()
            .get(identity)
            .map(|(endpoint, _, expires_at)| EndpointRecord::new(*endpoint, Some(*expires_at))))
    }

    async fn deregister(&self, identity: &str) -> Result<()> {
        self.records.lock().remove(identity);
        Ok(())
    }
}
