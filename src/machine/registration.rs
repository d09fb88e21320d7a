use std::sync::Arc;
use std::time::Duration;

use rendezvous_punch_core::store::{Endpoint, RendezvousStore, StoreError};

/// Our record in the rendezvous store, for as long as this value lives.
///
/// [`release`](Registration::release) deletes the record and waits for the
/// store. A registration dropped without being released (a cancelled
/// connect future, a dropped `Peer`) deletes the record from a task spawned
/// on the current runtime; without a runtime the record lapses with its
/// lease.
pub(crate) struct Registration {
    store: Arc<dyn RendezvousStore>,
    identity: String,
    armed: bool,
}

impl Registration {
    pub(crate) async fn register(
        store: Arc<dyn RendezvousStore>,
        identity: &str,
        endpoint: Endpoint,
        ttl: Duration,
    ) -> Result<Registration, StoreError> {
        store.register(identity, &endpoint, ttl).await?;
        log::info!(
            "registered {identity} port={} session={} ttl={ttl:?}",
            endpoint.port,
            endpoint.session_id
        );
        Ok(Self {
            store,
            identity: identity.to_string(),
            armed: true,
        })
    }

    pub(crate) async fn release(mut self) {
        self.armed = false;
        deregister(self.store.as_ref(), &self.identity).await;
    }
}

async fn deregister(store: &dyn RendezvousStore, identity: &str) {
    match store.deregister(identity).await {
        Ok(()) => log::info!("deregistered {identity}"),
        Err(e) => log::warn!("deregister {identity} {e:?}, record lapses with its lease"),
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let identity = std::mem::take(&mut self.identity);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.store.clone();
                handle.spawn(async move {
                    deregister(store.as_ref(), &identity).await;
                });
            }
            Err(_) => {
                log::warn!("no runtime to deregister {identity}, record lapses with its lease")
            }
        }
    }
}
