//! Background entry point of a check daemon
//!
//! ```text
//! heartbeat ticker ──publish──▶ bus "peers-heartbeat" ──▶ heartbeat receiver ──▶ PeerRegistry
//!                                                                │ new peer
//! list ticker / bus "checks-refetch" / DaemonHandle ─────────────┴──▶ RefetchActor
//!                                                                       │
//!                                   CheckDistributor (this daemon's share)
//!                                                                       │
//!                                            CheckScheduler ──▶ one CheckWorker per check
//! ```
//!
//! All refetches go through the single refetch actor, so repartitions never
//! race each other.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::actors::check_worker::CheckPipeline;
use crate::actors::messages::RefetchCommand;
use crate::actors::scheduler::CheckScheduler;
use crate::checks::ExpressionEvaluator;
use crate::checks::model::CheckId;
use crate::checks::probes::Prober;
use crate::cluster::{CHECKS_REFETCH, CheckDistributor, MessageBus, PEERS_HEARTBEAT, PeerRegistry};
use crate::config::Config;
use crate::storage::StorageBackend;
use crate::triggers::{NotificationDispatcher, TriggerEngine};

/// Everything a daemon needs, wired once at start-up.
pub struct CheckDaemon {
    config: Config,
    storage: Arc<dyn StorageBackend>,
    bus: Arc<dyn MessageBus>,
    dispatcher: Arc<NotificationDispatcher>,
    prober: Arc<dyn Prober>,
}

impl CheckDaemon {
    pub fn new(
        config: Config,
        storage: Arc<dyn StorageBackend>,
        bus: Arc<dyn MessageBus>,
        dispatcher: Arc<NotificationDispatcher>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        Self {
            config,
            storage,
            bus,
            dispatcher,
            prober,
        }
    }

    /// Start the heartbeat tasks and the refetch actor.
    pub fn spawn(self) -> DaemonHandle {
        let address = self.config.address.clone();
        let peers = Arc::new(PeerRegistry::new());

        let evaluator = ExpressionEvaluator::new(
            self.storage.clone(),
            self.prober,
            self.config.checks.hosts_freshness,
        );
        let triggers = TriggerEngine::new(self.storage.clone(), self.dispatcher);
        let pipeline = Arc::new(CheckPipeline::new(
            evaluator,
            self.storage.clone(),
            triggers,
            self.config.checks.default_retention_days,
        ));

        // subscribe before the first heartbeat goes out
        let heartbeat_rx = self.bus.subscribe(PEERS_HEARTBEAT);
        let refetch_rx = self.bus.subscribe(CHECKS_REFETCH);

        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let actor = RefetchActor {
            distributor: CheckDistributor::new(self.storage, peers.clone(), address.clone()),
            scheduler: CheckScheduler::new(pipeline),
            command_rx: cmd_rx,
            refetch_rx,
            list_fetch_interval: self.config.checks.list_fetch_interval,
        };
        let refetch_task = tokio::spawn(actor.run());

        let peer_ttl = self.config.peers.peer_ttl;
        let heartbeat_tasks = vec![
            tokio::spawn(publish_heartbeats(
                self.bus.clone(),
                peers.clone(),
                address.clone(),
                self.config.peers.heartbeat_interval,
                peer_ttl,
                cmd_tx.clone(),
            )),
            tokio::spawn(receive_heartbeats(
                heartbeat_rx,
                peers.clone(),
                address.clone(),
                peer_ttl,
                cmd_tx.clone(),
            )),
        ];

        info!("check daemon {address} started");
        DaemonHandle {
            sender: cmd_tx,
            bus: self.bus,
            peers,
            address,
            heartbeat_tasks,
            refetch_task,
        }
    }
}

/// Serializes every refetch and owns the scheduler.
struct RefetchActor {
    distributor: CheckDistributor,
    scheduler: CheckScheduler,
    command_rx: mpsc::Receiver<RefetchCommand>,
    refetch_rx: broadcast::Receiver<String>,
    list_fetch_interval: Duration,
}

impl RefetchActor {
    #[instrument(skip(self), name = "refetch")]
    async fn run(mut self) {
        debug!("starting refetch actor");

        // the first tick fetches right away
        let mut ticker = interval(self.list_fetch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut bus_open = true;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    trace!("periodic refetch");
                    self.refetch_logged().await;
                }

                message = self.refetch_rx.recv(), if bus_open => {
                    match message {
                        Ok(_) => {
                            debug!("refetch requested over the bus");
                            self.refetch_logged().await;
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            debug!("{skipped} refetch signals collapsed");
                            self.refetch_logged().await;
                        }
                        Err(RecvError::Closed) => {
                            warn!("refetch subscription closed, relying on periodic refetch");
                            bus_open = false;
                        }
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(RefetchCommand::Refetch { respond_to }) => {
                            let result = self.refetch().await;
                            match respond_to {
                                Some(respond_to) => {
                                    let _ = respond_to.send(result);
                                }
                                None => {
                                    if let Err(e) = result {
                                        error!("refetch failed: {e:#}");
                                    }
                                }
                            }
                        }

                        Some(RefetchCommand::GetAssigned { respond_to }) => {
                            let _ = respond_to.send(self.scheduler.running_ids());
                        }

                        Some(RefetchCommand::Shutdown) | None => {
                            debug!("refetch actor shutting down");
                            break;
                        }
                    }
                }
            }
        }

        self.scheduler.shutdown_all().await;
        debug!("refetch actor stopped");
    }

    async fn refetch(&mut self) -> Result<Vec<CheckId>> {
        let assigned = self
            .distributor
            .assigned_checks()
            .await
            .context("failed to load check definitions")?;
        self.scheduler.apply(assigned).await;
        Ok(self.scheduler.running_ids())
    }

    async fn refetch_logged(&mut self) {
        if let Err(e) = self.refetch().await {
            error!("refetch failed: {e:#}");
        }
    }
}

#[instrument(skip_all, fields(peer = %address))]
async fn publish_heartbeats(
    bus: Arc<dyn MessageBus>,
    peers: Arc<PeerRegistry>,
    address: String,
    heartbeat_interval: Duration,
    peer_ttl: Duration,
    refetch_tx: mpsc::Sender<RefetchCommand>,
) {
    let mut ticker = interval(heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        peers.set(&address, peer_ttl);
        if let Err(e) = bus.publish(PEERS_HEARTBEAT, address.clone()).await {
            warn!("failed to publish heartbeat: {e:#}");
        }

        let expired = peers.purge_expired();
        if expired > 0 {
            info!("{expired} peers expired, repartitioning");
            if refetch_tx.send(RefetchCommand::Refetch { respond_to: None }).await.is_err() {
                break;
            }
        }
    }
}

#[instrument(skip_all, fields(daemon = %address))]
async fn receive_heartbeats(
    mut heartbeat_rx: broadcast::Receiver<String>,
    peers: Arc<PeerRegistry>,
    address: String,
    peer_ttl: Duration,
    refetch_tx: mpsc::Sender<RefetchCommand>,
) {
    loop {
        match heartbeat_rx.recv().await {
            Ok(peer) => {
                let is_new = peers.set(&peer, peer_ttl);
                if is_new && peer != address {
                    info!(peer = %peer, "new peer joined, repartitioning");
                    if refetch_tx.send(RefetchCommand::Refetch { respond_to: None }).await.is_err() {
                        break;
                    }
                }
            }
            Err(RecvError::Lagged(skipped)) => warn!("missed {skipped} heartbeats"),
            Err(RecvError::Closed) => {
                warn!("heartbeat subscription closed");
                break;
            }
        }
    }
}

/// Handle for a running daemon
pub struct DaemonHandle {
    sender: mpsc::Sender<RefetchCommand>,
    bus: Arc<dyn MessageBus>,
    peers: Arc<PeerRegistry>,
    address: String,
    heartbeat_tasks: Vec<JoinHandle<()>>,
    refetch_task: JoinHandle<()>,
}

impl DaemonHandle {
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Live daemons as seen by this one, itself included once it has
    /// sent a heartbeat.
    pub fn peers(&self) -> Vec<String> {
        self.peers.all()
    }

    /// Repartition now and return the ids of the checks this daemon owns.
    pub async fn refetch_now(&self) -> Result<Vec<CheckId>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RefetchCommand::Refetch { respond_to: Some(tx) })
            .await
            .context("failed to send Refetch command")?;

        rx.await.context("failed to receive refetch result")?
    }

    pub async fn assigned_check_ids(&self) -> Result<Vec<CheckId>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RefetchCommand::GetAssigned { respond_to: tx })
            .await
            .context("failed to send GetAssigned command")?;

        rx.await.context("failed to receive assigned checks")
    }

    /// Ask every daemon on the bus, this one included, to repartition.
    pub async fn broadcast_refetch(&self) -> Result<()> {
        self.bus.publish(CHECKS_REFETCH, String::new()).await
    }

    /// Stop heartbeats, then stop every check worker.
    pub async fn shutdown(self) {
        for task in &self.heartbeat_tasks {
            task.abort();
        }

        if self.sender.send(RefetchCommand::Shutdown).await.is_err() {
            trace!("refetch actor already stopped");
        }
        if let Err(e) = self.refetch_task.await {
            warn!("refetch actor ended abnormally: {e}");
        }
        info!("check daemon {} stopped", self.address);
    }
}
