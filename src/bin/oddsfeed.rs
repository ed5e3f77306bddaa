//! oddsfeed CLI - vendor odds feed session with producer health and recovery
//!
//! `run` keeps the feed connected and serves the status API; the other
//! subcommands are one-shot operator tools.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use oddsfeed::alerts::{AlertSink, FanoutAlertSink, RecentAlerts, TracingAlertSink, WebhookAlertSink};
use oddsfeed::api::{self, AppState};
use oddsfeed::recovery::{MemoryRecoveryStore, RecoveryCoordinator, RecoveryStore};
use oddsfeed::{AmqpTransport, FeedConfig, FeedSessionSupervisor, ForwardingHandler, NatsForwarder, SupervisorParts, VendorApiClient};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "oddsfeed")]
#[command(version, about = "Vendor odds feed session, producer health and recovery", long_about = None)]
struct Cli {
    /// Optional YAML config file; environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the feed and serve the status API until interrupted
    Run,

    /// Print the bookmaker identity behind the access token
    Whoami,

    /// Request a recovery and exit
    Recover {
        /// Product to recover (e.g. liveodds, pre); all configured products when omitted
        #[arg(short, long)]
        product: Option<String>,

        /// Recover a single event's odds instead (requires --product)
        #[arg(short, long)]
        event: Option<String>,

        /// With --event: replay settlements and cancellations instead of odds
        #[arg(short, long)]
        stateful: bool,
    },

    /// Load and validate configuration, then print it
    CheckConfig,
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match FeedConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Configuration error: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run(config).await,
        Commands::Whoami => whoami(config).await,
        Commands::Recover {
            product,
            event,
            stateful,
        } => recover(config, product, event, stateful).await,
        Commands::CheckConfig => check_config(&config),
    };

    if let Err(e) = result {
        eprintln!("❌ Error: {}", e);
        process::exit(1);
    }
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn vendor_client(config: &FeedConfig) -> Result<VendorApiClient, Box<dyn std::error::Error>> {
    Ok(VendorApiClient::new(
        config.api_base_url.clone(),
        config.access_token.clone(),
        config.recovery.request_timeout,
    )?)
}

async fn recovery_store(config: &FeedConfig) -> Result<Arc<dyn RecoveryStore>, Box<dyn std::error::Error>> {
    match &config.database_url {
        #[cfg(feature = "postgres")]
        Some(url) => Ok(Arc::new(oddsfeed::recovery::PgRecoveryStore::connect(url).await?)),
        #[cfg(not(feature = "postgres"))]
        Some(_) => {
            tracing::warn!("DATABASE_URL set but built without postgres; audit log kept in memory");
            Ok(Arc::new(MemoryRecoveryStore::new()))
        }
        None => Ok(Arc::new(MemoryRecoveryStore::new())),
    }
}

async fn run(config: FeedConfig) -> CliResult {
    let vendor = Arc::new(vendor_client(&config)?);
    let store = recovery_store(&config).await?;

    let recent = Arc::new(RecentAlerts::new(256));
    let mut alerts = FanoutAlertSink::new()
        .with(Arc::new(TracingAlertSink))
        .with(recent.clone());
    if let Some(url) = &config.alert_webhook_url {
        alerts = alerts.with(Arc::new(WebhookAlertSink::new(url.clone())));
    }
    let alerts: Arc<dyn AlertSink> = Arc::new(alerts);

    let mut supervisor = FeedSessionSupervisor::new(
        config.clone(),
        SupervisorParts {
            identity: vendor.clone(),
            transport: Arc::new(AmqpTransport::new()),
            recovery_api: vendor,
            store,
            alerts,
        },
    );

    let forwarder_cancel = CancellationToken::new();
    let mut forwarder_task = None;
    if let Some(forwarder_config) = &config.forwarder {
        let forwarder = NatsForwarder::connect(forwarder_config)
            .await
            .map_err(|e| format!("NATS connect failed: {}", e))?;
        let (handler, rx) = ForwardingHandler::channel(forwarder_config.buffer);
        supervisor.register_all(Arc::new(handler));
        forwarder_task = Some(forwarder.spawn(rx, forwarder_cancel.clone()));
    }

    let identity = supervisor.start().await?;
    println!("✅ Connected as bookmaker {} ({})", identity.bookmaker_id, identity.virtual_host);

    let state = AppState {
        tracker: supervisor.tracker(),
        coordinator: supervisor.coordinator(),
        stats: supervisor.stats(),
        alerts: recent,
        connector: supervisor.connector(),
    };
    let listener = tokio::net::TcpListener::bind(&config.status_addr).await?;
    tracing::info!("Status API listening on {}", config.status_addr);
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, api::router(state)).await {
            tracing::error!(error = %e, "status API failed");
        }
    });

    let outcome = tokio::select! {
        result = supervisor.wait() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received");
            Ok(())
        }
    };

    supervisor.stop().await;
    forwarder_cancel.cancel();
    if let Some(task) = forwarder_task {
        let _ = task.await;
    }
    server.abort();

    outcome?;
    Ok(())
}

async fn whoami(config: FeedConfig) -> CliResult {
    let identity = vendor_client(&config)?.fetch_identity().await?;
    println!("bookmaker_id: {}", identity.bookmaker_id);
    println!("virtual_host: {}", identity.virtual_host);
    Ok(())
}

async fn recover(
    config: FeedConfig,
    product: Option<String>,
    event: Option<String>,
    stateful: bool,
) -> CliResult {
    let vendor = Arc::new(vendor_client(&config)?);
    let store = recovery_store(&config).await?;
    let coordinator = RecoveryCoordinator::new(vendor, store, config.recovery.clone());

    match (product, event) {
        (Some(product), Some(event)) if stateful => {
            let id = coordinator.trigger_stateful_messages_recovery(&product, &event).await?;
            println!("✅ Stateful messages recovery accepted (request_id {})", id);
        }
        (Some(product), Some(event)) => {
            let id = coordinator.trigger_event_recovery(&product, &event).await?;
            println!("✅ Event recovery accepted (request_id {})", id);
        }
        (None, Some(_)) => return Err("--event requires --product".into()),
        (Some(product), None) => {
            let outcome = coordinator.trigger_product_recovery(&product).await?;
            println!("✅ {}: {:?}", product, outcome);
        }
        (None, None) => {
            let report = coordinator.trigger_full_recovery().await?;
            for (product, outcome) in report.products {
                println!("✅ {}: {:?}", product, outcome);
            }
        }
    }
    // a one-shot run doesn't wait out rate-limit retries
    coordinator.shutdown();
    Ok(())
}

fn check_config(config: &FeedConfig) -> CliResult {
    let mut redacted = config.clone();
    redacted.access_token = "***".to_string();
    println!("{}", serde_yaml::to_string(&redacted)?);
    println!("✅ Configuration is valid");
    Ok(())
}
