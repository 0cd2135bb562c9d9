//! Role of this process in the cluster: a consensus member serving from its
//! own store, or a proxy forwarding to the known peers. Promotion, demotion
//! and shutdown flip the HTTP backend and the DNS store together.

use std::sync::Arc;

use crate::server::{
    Backend, DnsStore, DnsStoreSwitch, HttpHandler, MemCluster, ProxyStore,
    Store, StoreConfig,
};
use crate::utils::DiscoverdError;

use parking_lot::Mutex;

/// Store lifecycle of one peer process.
pub struct Membership {
    /// Replicated log joined on promotion.
    cluster: MemCluster,

    /// Address this peer advertises.
    advertise: String,

    /// Config for stores opened on promotion.
    config: StoreConfig,

    /// Configured peer set; everything but ourselves is a proxy target.
    peers: Vec<String>,

    /// Open store while a member. Role changes are serialized by this lock.
    store: tokio::sync::Mutex<Option<Arc<Store>>>,

    /// DNS server to repoint on role changes, if DNS is served.
    dns: Mutex<Option<DnsStoreSwitch>>,
}

// Membership public API implementation
impl Membership {
    pub fn new(
        cluster: MemCluster,
        advertise: &str,
        config: StoreConfig,
        peers: Vec<String>,
    ) -> Arc<Self> {
        Arc::new(Membership {
            cluster,
            advertise: advertise.into(),
            config,
            peers,
            store: tokio::sync::Mutex::new(None),
            dns: Mutex::new(None),
        })
    }

    pub fn advertise_addr(&self) -> &str {
        &self.advertise
    }

    /// Registers the DNS server whose store follows role changes.
    pub fn attach_dns(&self, switch: DnsStoreSwitch) {
        *self.dns.lock() = Some(switch);
    }

    /// Open store, if currently a member.
    pub async fn store(&self) -> Option<Arc<Store>> {
        self.store.lock().await.clone()
    }

    /// Joins the cluster and serves from a local store. Already being a
    /// member is fine.
    pub async fn promote(
        &self,
        handler: &HttpHandler,
    ) -> Result<Arc<Store>, DiscoverdError> {
        let mut slot = self.store.lock().await;
        let store = match slot.as_ref() {
            Some(store) => store.clone(),
            None => {
                let store = Store::open_in(
                    &self.cluster,
                    &self.advertise,
                    self.config.clone(),
                )?;
                *slot = Some(store.clone());
                pf_info!("promoted to member of {:?}", store.peers());
                store
            }
        };

        handler.set_backend(Backend::Local(store.clone()));
        self.point_dns(Box::new(store.clone()));
        Ok(store)
    }

    /// Leaves the cluster, closes the local store and proxies to the other
    /// peers. Not being a member is fine.
    pub async fn demote(&self, handler: &HttpHandler) -> Result<(), DiscoverdError> {
        let mut slot = self.store.lock().await;
        if let Some(store) = slot.take() {
            self.cluster.leave(&self.advertise);
            store.close().await?;
            pf_info!("demoted to proxy");
        }

        let peers = self.proxy_peers();
        handler.set_backend(Backend::Proxy(peers.clone()));
        self.point_dns(Box::new(ProxyStore::new(peers)));
        Ok(())
    }

    /// Closes the local store for good. Returns the last log index it
    /// applied, or 0 if this peer was not a member.
    pub async fn shutdown(&self) -> Result<u64, DiscoverdError> {
        let mut slot = self.store.lock().await;
        let Some(store) = slot.take() else {
            return Ok(0);
        };

        let last_index = store.last_index();
        self.cluster.leave(&self.advertise);
        store.close().await?;
        self.point_dns(Box::new(ProxyStore::new(self.proxy_peers())));
        pf_info!("shut down at index {}", last_index);
        Ok(last_index)
    }
}

// Membership helpers
impl Membership {
    fn proxy_peers(&self) -> Vec<String> {
        self.peers
            .iter()
            .filter(|p| **p != self.advertise)
            .cloned()
            .collect()
    }

    fn point_dns(&self, store: Box<dyn DnsStore>) {
        if let Some(switch) = self.dns.lock().as_ref() {
            switch.set_store(store);
        }
    }
}

#[cfg(test)]
mod membership_tests {
    use super::*;
    use crate::model::ServiceConfig;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn member_round_trip() -> Result<(), DiscoverdError> {
        let cluster = MemCluster::new();
        let first = Store::open_in(&cluster, "10.0.0.1:1111", StoreConfig::default())?;
        first.add_service("a", ServiceConfig::default()).await?;

        let handler = HttpHandler::new(Backend::Proxy(vec![]));
        let membership = Membership::new(
            cluster.clone(),
            "10.0.0.2:1111",
            StoreConfig::default(),
            vec!["10.0.0.1:1111".into(), "10.0.0.2:1111".into()],
        );
        assert!(membership.store().await.is_none());

        let store = membership.promote(&handler).await?;
        assert_eq!(store.service_names(), vec!["a".to_string()]);
        assert_eq!(first.peers().len(), 2);
        let again = membership.promote(&handler).await?;
        assert!(Arc::ptr_eq(&store, &again));

        membership.demote(&handler).await?;
        assert!(membership.store().await.is_none());
        assert_eq!(first.peers(), vec!["10.0.0.1:1111".to_string()]);
        assert_eq!(
            store.add_service("b", ServiceConfig::default()).await,
            Err(DiscoverdError::Shutdown)
        );
        membership.demote(&handler).await?;

        // rejoining catches up with writes made meanwhile
        first.add_service("b", ServiceConfig::default()).await?;
        let store = membership.promote(&handler).await?;
        assert_eq!(store.service_names(), vec!["a".to_string(), "b".to_string()]);

        let last_index = first.last_index();
        assert_eq!(membership.shutdown().await?, last_index);
        assert_eq!(membership.shutdown().await?, 0);
        first.close().await
    }
}
