//! Hysteresis evaluation of check triggers.
//!
//! A trigger fires while the number of violations inside its window lies
//! within its inclusive `[low, high]` band. The window never reaches back
//! past the most recent good record, so a recovery resets the count.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, error, instrument, trace};

use super::notifiers::{Delivery, NotificationDispatcher};
use crate::checks::model::{CheckDefinition, CheckId, TriggerId};
use crate::storage::{StorageBackend, StorageResult};

/// Lower bound of a trigger's counting window.
pub fn window_lower_bound(
    last_good: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    window: chrono::Duration,
) -> DateTime<Utc> {
    let window_start = now - window;
    match last_good {
        Some(last_good) => last_good.max(window_start),
        None => window_start,
    }
}

pub struct TriggerEngine {
    storage: Arc<dyn StorageBackend>,
    dispatcher: Arc<NotificationDispatcher>,
    /// Open PagerDuty incidents per (check, trigger), reused while in band
    incident_keys: DashMap<(CheckId, TriggerId), String>,
}

impl TriggerEngine {
    pub fn new(storage: Arc<dyn StorageBackend>, dispatcher: Arc<NotificationDispatcher>) -> Self {
        Self {
            storage,
            dispatcher,
            incident_keys: DashMap::new(),
        }
    }

    pub fn incident_key(&self, check_id: CheckId, trigger_id: TriggerId) -> Option<String> {
        self.incident_keys
            .get(&(check_id, trigger_id))
            .map(|key| key.value().clone())
    }

    /// Drop every incident key held for `check_id`.
    pub fn forget_check(&self, check_id: CheckId) {
        self.incident_keys.retain(|(check, _), _| *check != check_id);
    }

    /// Drop incident keys of triggers no longer defined on `check`.
    pub fn forget_removed_triggers(&self, check: &CheckDefinition) {
        self.incident_keys.retain(|(check_id, trigger_id), _| {
            *check_id != check.id || check.triggers.iter().any(|trigger| trigger.id == *trigger_id)
        });
    }

    /// Evaluate every trigger of `check` and dispatch the in-band ones.
    ///
    /// Returns the number of notifications delivered. Storage errors abort
    /// the run; dispatch errors are logged and do not affect other triggers.
    #[instrument(skip(self, check), fields(cluster_id = check.cluster_id, check_id = check.id))]
    pub async fn run_triggers(&self, check: &CheckDefinition) -> StorageResult<usize> {
        if check.is_silenced {
            trace!("check is silenced");
            return Ok(0);
        }
        if check.triggers.is_empty() {
            return Ok(0);
        }

        let last_good = self
            .storage
            .last_good(check.cluster_id, check.id)
            .await?
            .map(|record| record.created);
        let now = Utc::now();

        let mut delivered = 0;
        for trigger in &check.triggers {
            let key = (check.id, trigger.id);
            let lower_bound = window_lower_bound(last_good, now, trigger.window());
            let violations = self
                .storage
                .violations_since(check.cluster_id, check.id, lower_bound)
                .await?;

            let count = violations.len();
            if count == 0 || !trigger.in_band(count) {
                debug!(trigger_id = trigger.id, "{count} violations, outside band");
                self.incident_keys.remove(&key);
                continue;
            }

            let open_incident = self.incident_key(check.id, trigger.id);
            match self
                .dispatcher
                .dispatch(check, trigger, count, violations.first(), open_incident.as_deref())
                .await
            {
                Ok(Delivery::Incident(incident_key)) => {
                    if !incident_key.is_empty() {
                        self.incident_keys.insert(key, incident_key);
                    }
                    delivered += 1;
                }
                Ok(delivery) if delivery.delivered() => delivered += 1,
                Ok(_) => {}
                Err(e) => error!(
                    trigger_id = trigger.id,
                    transport = trigger.action.transport(),
                    "failed to dispatch notification: {e:#}"
                ),
            }
        }

        Ok(delivered)
    }
}
