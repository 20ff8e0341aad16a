//! Integration tests for daemons sharing a bus and the per-check pipeline
//!
//! These tests verify that:
//! - Daemons on one bus split the checks between them
//! - A departed daemon's checks move to the survivors
//! - Failing checks record violations and notify through their triggers
//! - The hysteresis band and last-good reset hold across cycles

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use fleet_checks::checks::model::{Trigger, TriggerAction};
use fleet_checks::cluster::LocalBus;
use fleet_checks::config::PagerDutyConfig;
use fleet_checks::storage::memory::MemoryBackend;
use fleet_checks::triggers::NotificationDispatcher;
use fleet_checks::triggers::notifiers::PagerDutyEventsClient;
use pretty_assertions::assert_eq;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

async fn storage_with_checks(ids: impl IntoIterator<Item = i64>) -> Arc<MemoryBackend> {
    let storage = Arc::new(MemoryBackend::new());
    for id in ids {
        storage.insert_check(&load_check(id, "1m", &["web-1"])).await.unwrap();
    }
    storage
}

#[tokio::test(start_paused = true)]
async fn test_two_daemons_split_checks() {
    let storage = storage_with_checks(1..=6).await;
    let bus = Arc::new(LocalBus::new());

    let first = spawn_daemon(storage.clone(), bus.clone(), "10.0.0.1:55655", Arc::default());
    let second = spawn_daemon(storage.clone(), bus.clone(), "10.0.0.2:55655", Arc::default());

    // one heartbeat round
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(first.peers(), vec!["10.0.0.1:55655", "10.0.0.2:55655"]);

    let mine = first.refetch_now().await.unwrap();
    let theirs = second.refetch_now().await.unwrap();

    assert_eq!(mine, vec![2, 4, 6]);
    assert_eq!(theirs, vec![1, 3, 5]);

    let all: HashSet<i64> = mine.iter().chain(theirs.iter()).copied().collect();
    assert_eq!(all.len(), 6);

    first.shutdown().await;
    second.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_departed_daemon_checks_move_to_survivor() {
    let storage = storage_with_checks(1..=4).await;
    let bus = Arc::new(LocalBus::new());

    let survivor = spawn_daemon(storage.clone(), bus.clone(), "10.0.0.1:55655", Arc::default());
    let leaving = spawn_daemon(storage.clone(), bus.clone(), "10.0.0.2:55655", Arc::default());

    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(survivor.refetch_now().await.unwrap().len(), 2);

    leaving.shutdown().await;

    // the peer TTL runs out and the next heartbeat tick repartitions
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(survivor.peers(), vec!["10.0.0.1:55655"]);
    assert_eq!(survivor.assigned_check_ids().await.unwrap(), vec![1, 2, 3, 4]);

    survivor.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failing_check_sends_email() {
    let storage = Arc::new(MemoryBackend::new());
    set_load(&storage, "web-1", 9.0).await;

    let mut check = load_check(1, "1m", &["web-1"]);
    check.triggers.push(email_trigger(1, 1, None));
    storage.insert_check(&check).await.unwrap();

    let mailer = Arc::new(RecordingMailer::default());
    let daemon = spawn_daemon(storage.clone(), Arc::new(LocalBus::new()), "10.0.0.1:55655", mailer.clone());

    assert_eq!(daemon.refetch_now().await.unwrap(), vec![1]);
    tokio::time::sleep(Duration::from_secs(1)).await;

    let sent = mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, "oncall@example.com");
    assert_eq!(sent[0].subject, "Check(ID: 1): load-1, failed 1 times");
    assert!(sent[0].body.contains("web-1"));

    let history = storage.violation_history(1).await;
    assert_eq!(history.len(), 1);
    assert!(history[0].result);

    daemon.shutdown().await;
}

#[tokio::test]
async fn test_hysteresis_band_and_recovery() {
    let storage = Arc::new(MemoryBackend::new());
    let mailer = Arc::new(RecordingMailer::default());
    let pipeline = pipeline(storage.clone(), dispatcher(mailer.clone()));

    let mut check = load_check(3, "1m", &["web-1"]);
    check.triggers.push(email_trigger(1, 2, Some(3)));

    set_load(&storage, "web-1", 9.0).await;
    let mut dispatched = Vec::new();
    for _ in 0..5 {
        dispatched.push(pipeline.run_cycle(&check).await.unwrap().dispatched);
    }
    assert_eq!(dispatched, vec![0, 1, 1, 0, 0]);

    // recovery resets the window
    set_load(&storage, "web-1", 1.0).await;
    let report = pipeline.run_cycle(&check).await.unwrap();
    assert!(!report.verdict);
    assert_eq!(report.dispatched, 0);

    set_load(&storage, "web-1", 9.0).await;
    assert_eq!(pipeline.run_cycle(&check).await.unwrap().dispatched, 0);
    assert_eq!(pipeline.run_cycle(&check).await.unwrap().dispatched, 1);

    assert_eq!(mailer.sent().len(), 3);
    assert_eq!(mailer.sent()[2].subject, "Check(ID: 3): load-3, failed 2 times");
}

#[tokio::test]
async fn test_silenced_check_records_without_notifying() {
    let storage = Arc::new(MemoryBackend::new());
    let mailer = Arc::new(RecordingMailer::default());
    let pipeline = pipeline(storage.clone(), dispatcher(mailer.clone()));

    let mut check = load_check(4, "1m", &["web-1"]);
    check.triggers.push(email_trigger(1, 1, None));
    check.is_silenced = true;

    set_load(&storage, "web-1", 9.0).await;
    let report = pipeline.run_cycle(&check).await.unwrap();

    assert!(report.verdict);
    assert!(report.recorded);
    assert_eq!(report.dispatched, 0);
    assert!(mailer.sent().is_empty());
    assert_eq!(storage.violation_history(4).await.len(), 1);
}

#[tokio::test]
async fn test_pagerduty_incident_key_is_reused() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "status": "success",
            "message": "Event processed",
            "incident_key": "INC-1",
        })))
        .expect(2)
        .mount(&server)
        .await;

    let storage = Arc::new(MemoryBackend::new());
    let client = PagerDutyEventsClient::new(&PagerDutyConfig {
        events_url: server.uri(),
    });
    let dispatcher = Arc::new(NotificationDispatcher::new(None, Arc::new(client), Default::default()));
    let pipeline = pipeline(storage.clone(), dispatcher);

    let mut check = load_check(5, "1m", &["web-1"]);
    check.triggers.push(Trigger {
        id: 8,
        low_violations_count: 1,
        high_violations_count: None,
        created_interval_minute: 60,
        action: TriggerAction::PagerDuty {
            service_key: "svc".to_string(),
            description: "web load".to_string(),
            incident_key: String::new(),
        },
    });

    set_load(&storage, "web-1", 9.0).await;
    pipeline.run_cycle(&check).await.unwrap();
    pipeline.run_cycle(&check).await.unwrap();
    assert_eq!(pipeline.triggers().incident_key(5, 8).as_deref(), Some("INC-1"));

    let requests = server.received_requests().await.unwrap();
    let bodies: Vec<serde_json::Value> = requests
        .iter()
        .map(|request| serde_json::from_slice(&request.body).unwrap())
        .collect();

    assert!(bodies[0].get("incident_key").is_none());
    assert_eq!(bodies[1]["incident_key"], "INC-1");
    assert_eq!(bodies[1]["event_type"], "trigger");
    assert_eq!(bodies[1]["details"][0]["Type"], "RawHostData");
    assert_eq!(bodies[1]["details"][0]["Result"]["BadHostnames"][0], "web-1");
}
