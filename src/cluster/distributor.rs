//! Splits the check workload across live daemons.
//!
//! Partitioning is a plain round-robin over a fixed ordering, recomputed on
//! every refetch. It is not consistent hashing: a membership change can move
//! any check to another daemon, and nothing prevents two daemons with
//! different peer views from briefly evaluating the same check.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use super::peers::PeerRegistry;
use crate::checks::model::CheckDefinition;
use crate::storage::StorageBackend;

/// Assign checks to daemons round-robin.
///
/// Checks are ordered by id, highest first, and dealt to `daemons` in the
/// order given. Every check lands in exactly one bucket and bucket sizes
/// differ by at most one. Every daemon gets a bucket, possibly empty.
pub fn partition(checks: &[CheckDefinition], daemons: &[String]) -> HashMap<String, Vec<CheckDefinition>> {
    let mut buckets: HashMap<String, Vec<CheckDefinition>> = daemons
        .iter()
        .map(|daemon| (daemon.clone(), Vec::new()))
        .collect();
    if daemons.is_empty() {
        return buckets;
    }

    let mut ordered: Vec<&CheckDefinition> = checks.iter().collect();
    ordered.sort_by(|a, b| b.id.cmp(&a.id));

    for (index, check) in ordered.into_iter().enumerate() {
        let daemon = &daemons[index % daemons.len()];
        buckets.entry(daemon.clone()).or_default().push(check.clone());
    }

    buckets
}

pub struct CheckDistributor {
    storage: Arc<dyn StorageBackend>,
    peers: Arc<PeerRegistry>,
    self_address: String,
}

impl CheckDistributor {
    pub fn new(storage: Arc<dyn StorageBackend>, peers: Arc<PeerRegistry>, self_address: String) -> Self {
        Self {
            storage,
            peers,
            self_address,
        }
    }

    /// Daemons taking part in the next partition: live peers plus this one.
    pub fn daemons(&self) -> Vec<String> {
        let mut daemons = self.peers.all();
        daemons.push(self.self_address.clone());
        daemons.sort();
        daemons.dedup();
        daemons
    }

    /// Load every check and keep this daemon's share.
    ///
    /// Definitions whose JSON columns cannot be decoded are logged and left
    /// out of the partition.
    #[instrument(skip(self), fields(daemon = %self.self_address))]
    pub async fn assigned_checks(&self) -> anyhow::Result<Vec<CheckDefinition>> {
        let stored = self.storage.all_checks().await?;

        let mut checks = Vec::with_capacity(stored.len());
        for row in stored {
            let check_id = row.id;
            match row.into_definition() {
                Ok(check) => checks.push(check),
                Err(e) => warn!(check_id, "skipping check with undecodable definition: {e}"),
            }
        }

        let daemons = self.daemons();
        let mut buckets = partition(&checks, &daemons);
        let mine = buckets.remove(&self.self_address).unwrap_or_default();

        debug!(
            "{} of {} checks assigned across {} daemons",
            mine.len(),
            checks.len(),
            daemons.len()
        );
        Ok(mine)
    }
}
