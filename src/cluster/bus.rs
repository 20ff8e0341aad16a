//! Publish/subscribe transport between daemons.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::trace;

/// Heartbeat topic; the payload is the sender's address.
pub const PEERS_HEARTBEAT: &str = "peers-heartbeat";

/// Repartition signal; the payload is ignored.
pub const CHECKS_REFETCH: &str = "checks-refetch";

const TOPIC_CAPACITY: usize = 256;

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: String) -> anyhow::Result<()>;

    /// Stream of payloads published on `topic` after this call.
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<String>;
}

/// In-process bus. Every daemon sharing one `LocalBus` sees the others'
/// messages.
#[derive(Debug, Default)]
pub struct LocalBus {
    topics: DashMap<String, broadcast::Sender<String>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<String> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, topic: &str, payload: String) -> anyhow::Result<()> {
        // no subscribers is not an error
        let receivers = self.sender(topic).send(payload).unwrap_or(0);
        trace!("published on {topic} to {receivers} subscribers");
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<String> {
        self.sender(topic).subscribe()
    }
}
