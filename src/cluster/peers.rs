//! Expiring registry of live daemon addresses.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

/// Set of peers refreshed by heartbeats. Entries vanish once their TTL
/// passes without a refresh; reads never block writers.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    expires_at: DashMap<String, Instant>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record or refresh a peer. Returns `true` when the peer was not live
    /// before this call.
    pub fn set(&self, address: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let previous = self.expires_at.insert(address.to_string(), now + ttl);
        previous.is_none_or(|expiry| expiry <= now)
    }

    /// Snapshot of live peers, sorted.
    pub fn all(&self) -> Vec<String> {
        let now = Instant::now();
        let mut peers: Vec<String> = self
            .expires_at
            .iter()
            .filter(|entry| *entry.value() > now)
            .map(|entry| entry.key().clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn is_live(&self, address: &str) -> bool {
        self.expires_at
            .get(address)
            .is_some_and(|expiry| *expiry > Instant::now())
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.expires_at.len();
        self.expires_at.retain(|_, expiry| *expiry > now);
        before - self.expires_at.len()
    }
}
