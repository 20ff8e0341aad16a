use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use fleet_checks::{
    checks::probes::SystemProber,
    cluster::LocalBus,
    config::read_config_file,
    daemon::CheckDaemon,
    storage,
    triggers::{
        MailSender, NotificationDispatcher,
        notifiers::{PagerDutyEventsClient, SmtpMailer},
    },
};
use tracing::{info, level_filters::LevelFilter, trace, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file
    #[arg(short)]
    file: String,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("fleet_checks", LevelFilter::DEBUG),
        ("checkd", LevelFilter::TRACE),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let config = read_config_file(&args.file)?;

    let storage = storage::from_config(&config.storage)
        .await
        .context("failed to open storage backend")?;

    let mailer = match &config.email {
        Some(email) => Some(Arc::new(SmtpMailer::new(email)?) as Arc<dyn MailSender>),
        None => {
            warn!("no email configuration, email and SMS triggers will fail");
            None
        }
    };
    let dispatcher = NotificationDispatcher::new(
        mailer,
        Arc::new(PagerDutyEventsClient::new(&config.pagerduty)),
        config.checks.sms_email_gateway.clone(),
    );
    let prober = SystemProber::new(config.checks.probe_timeout)?;

    let daemon = CheckDaemon::new(
        config,
        storage.clone(),
        Arc::new(LocalBus::new()),
        Arc::new(dispatcher),
        Arc::new(prober),
    );
    let handle = daemon.spawn();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");

    handle.shutdown().await;
    storage.close().await?;

    Ok(())
}
