//! Helper functions for integration tests

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleet_checks::HostSnapshot;
use fleet_checks::actors::CheckPipeline;
use fleet_checks::checks::ExpressionEvaluator;
use fleet_checks::checks::model::{
    CheckDefinition, Comparison, Expression, ExpressionKind, HostSelection, HttpProbe,
    MetricThreshold, SshProbe, Trigger, TriggerAction,
};
use fleet_checks::checks::probes::{ProbeOutcome, Prober};
use fleet_checks::cluster::LocalBus;
use fleet_checks::config::{Config, parse_config};
use fleet_checks::daemon::{CheckDaemon, DaemonHandle};
use fleet_checks::storage::memory::MemoryBackend;
use fleet_checks::triggers::notifiers::{PagerDutyClient, PagerDutyEvent};
use fleet_checks::triggers::{MailSender, NotificationDispatcher, TriggerEngine};

pub const CLUSTER: i64 = 1;

/// Mail transport that keeps every message
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<SentMail>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailSender for RecordingMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(SentMail {
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}

/// Prober where only the listed hosts are unreachable
#[derive(Default)]
pub struct FakeProber {
    down: HashSet<String>,
}

impl FakeProber {
    pub fn with_down(hosts: &[&str]) -> Self {
        Self {
            down: hosts.iter().map(|host| host.to_string()).collect(),
        }
    }

    fn outcome(&self, hostname: &str) -> ProbeOutcome {
        if self.down.contains(hostname) {
            ProbeOutcome::Unreachable(format!("{hostname} is down"))
        } else {
            ProbeOutcome::Reachable
        }
    }
}

#[async_trait]
impl Prober for FakeProber {
    async fn ping(&self, hostname: &str) -> ProbeOutcome {
        self.outcome(hostname)
    }

    async fn ssh(&self, hostname: &str, _probe: &SshProbe) -> ProbeOutcome {
        self.outcome(hostname)
    }

    async fn http(&self, hostname: &str, _probe: &HttpProbe) -> ProbeOutcome {
        self.outcome(hostname)
    }
}

pub struct NoPagerDuty;

#[async_trait]
impl PagerDutyClient for NoPagerDuty {
    async fn submit_trigger(&self, _event: &PagerDutyEvent) -> anyhow::Result<String> {
        anyhow::bail!("PagerDuty is not configured in this test")
    }
}

/// Check failing when `load.LoadAvg1m > 4` on at least one listed host.
pub fn load_check(id: i64, interval: &str, hosts: &[&str]) -> CheckDefinition {
    CheckDefinition {
        id,
        cluster_id: CLUSTER,
        name: format!("load-{id}"),
        interval: interval.to_string(),
        hosts: HostSelection::List(hosts.iter().map(|host| host.to_string()).collect()),
        expressions: vec![Expression::new(ExpressionKind::RawHostData(MetricThreshold {
            metric: "load.LoadAvg1m".to_string(),
            operator: Comparison::Greater,
            value: 4.0,
            min_host: 1,
        }))],
        triggers: Vec::new(),
        is_silenced: false,
    }
}

pub fn email_trigger(id: i64, low: i64, high: Option<i64>) -> Trigger {
    Trigger {
        id,
        low_violations_count: low,
        high_violations_count: high,
        created_interval_minute: 60,
        action: TriggerAction::Email {
            email: "oncall@example.com".to_string(),
        },
    }
}

pub async fn set_load(storage: &MemoryBackend, hostname: &str, load: f64) {
    storage
        .upsert_host(CLUSTER, HostSnapshot::new(hostname).with_metric("load.LoadAvg1m", load))
        .await;
}

pub fn test_config(address: &str) -> Config {
    parse_config(&format!(
        r#"{{
            "address": "{address}",
            "storage": {{"backend": "none"}},
            "peers": {{"heartbeat_interval": "10s", "peer_ttl": "25s"}},
            "checks": {{"list_fetch_interval": "1h"}}
        }}"#
    ))
    .unwrap()
}

pub fn dispatcher(mailer: Arc<RecordingMailer>) -> Arc<NotificationDispatcher> {
    Arc::new(NotificationDispatcher::new(
        Some(mailer as Arc<dyn MailSender>),
        Arc::new(NoPagerDuty),
        HashMap::new(),
    ))
}

pub fn pipeline(
    storage: Arc<MemoryBackend>,
    dispatcher: Arc<NotificationDispatcher>,
) -> CheckPipeline {
    let evaluator = ExpressionEvaluator::new(
        storage.clone(),
        Arc::new(FakeProber::default()),
        Duration::from_secs(300),
    );
    let triggers = TriggerEngine::new(storage.clone(), dispatcher);
    CheckPipeline::new(evaluator, storage, triggers, 1)
}

pub fn spawn_daemon(
    storage: Arc<MemoryBackend>,
    bus: Arc<LocalBus>,
    address: &str,
    mailer: Arc<RecordingMailer>,
) -> DaemonHandle {
    CheckDaemon::new(
        test_config(address),
        storage,
        bus,
        dispatcher(mailer),
        Arc::new(FakeProber::default()),
    )
    .spawn()
}
