use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::peer::Peer;

/// Every peer that has completed `join`, keyed by peer id. This is the
/// source of truth for presence.
#[derive(Default)]
pub struct SessionRegistry {
    peers: RwLock<HashMap<String, Arc<Peer>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, peer: Arc<Peer>) {
        let mut peers = self.peers.write().await;
        peers.insert(peer.id().to_string(), peer);
    }

    /// Registers `peer` and returns everyone else registered at that same
    /// instant. Re-registering an existing id replaces the entry.
    pub async fn join(&self, peer: Arc<Peer>) -> Vec<Arc<Peer>> {
        let mut peers = self.peers.write().await;
        let others = peers
            .values()
            .filter(|other| other.id() != peer.id())
            .cloned()
            .collect();
        peers.insert(peer.id().to_string(), peer);
        others
    }

    pub async fn get(&self, peer_id: &str) -> Option<Arc<Peer>> {
        let peers = self.peers.read().await;
        peers.get(peer_id).cloned()
    }

    pub async fn remove(&self, peer_id: &str) -> Option<Arc<Peer>> {
        let mut peers = self.peers.write().await;
        peers.remove(peer_id)
    }

    pub async fn contains(&self, peer_id: &str) -> bool {
        let peers = self.peers.read().await;
        peers.contains_key(peer_id)
    }

    /// All registered peers, in no particular order.
    pub async fn values(&self) -> Vec<Arc<Peer>> {
        let peers = self.peers.read().await;
        peers.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    /// Any registered peer that may act as a recording source.
    pub async fn first_recordable(&self) -> Option<Arc<Peer>> {
        let peers = self.peers.read().await;
        peers.values().find(|peer| !peer.is_injected()).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::RpcChannel;

    fn human() -> Arc<Peer> {
        let (channel, _out) = RpcChannel::new();
        Peer::human(channel)
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let registry = SessionRegistry::new();
        let peer = human();

        registry.put(peer.clone()).await;
        assert!(registry.get(peer.id()).await.is_some());
        assert_eq!(registry.len().await, 1);

        let removed = registry.remove(peer.id()).await;
        assert!(removed.is_some());
        assert!(registry.get(peer.id()).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_unknown_peer() {
        let registry = SessionRegistry::new();
        assert!(registry.remove("nobody").await.is_none());
    }

    #[tokio::test]
    async fn test_join_returns_peers_registered_before() {
        let registry = SessionRegistry::new();
        let first = human();
        let second = human();

        assert!(registry.join(first.clone()).await.is_empty());

        let others = registry.join(second.clone()).await;
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].id(), first.id());
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn test_joining_twice_keeps_one_entry() {
        let registry = SessionRegistry::new();
        let peer = human();

        registry.join(peer.clone()).await;
        let others = registry.join(peer.clone()).await;

        assert!(others.is_empty());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_first_recordable_skips_injected_source() {
        let registry = SessionRegistry::new();
        registry.put(Peer::injected_source("gstreamer")).await;
        assert!(registry.first_recordable().await.is_none());

        let peer = human();
        registry.put(peer.clone()).await;
        assert_eq!(registry.first_recordable().await.unwrap().id(), peer.id());
    }

    #[tokio::test]
    async fn test_human_named_like_injected_source_is_recordable() {
        let registry = SessionRegistry::new();
        let peer = human();
        peer.set_profile("gstreamer".to_string(), serde_json::json!({})).await;
        registry.put(peer.clone()).await;

        assert_eq!(registry.first_recordable().await.unwrap().id(), peer.id());
    }
}
