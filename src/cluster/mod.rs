//! Daemon discovery and workload distribution

pub mod bus;
pub mod distributor;
pub mod peers;

pub use bus::{CHECKS_REFETCH, LocalBus, MessageBus, PEERS_HEARTBEAT};
pub use distributor::{CheckDistributor, partition};
pub use peers::PeerRegistry;
