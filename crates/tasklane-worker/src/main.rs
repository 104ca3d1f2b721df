use clap::Parser;
use tasklane_worker::{build, Collaborators, Settings};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tl-worker")]
#[command(about = "Tasklane background worker and cron scheduler", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "worker.yaml")]
    config: String,

    /// Broker url (memory:// or tcp://host:port)
    #[arg(short, long)]
    broker: Option<String>,

    /// Worker ID (auto-generated if not provided)
    #[arg(long)]
    worker_id: Option<String>,

    /// Skip the broker when publishing
    #[arg(long)]
    test_mode: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // Load configuration
    let mut settings = if std::path::Path::new(&args.config).exists() {
        Settings::from_file(&args.config)?
    } else {
        tracing::warn!("Config file {} not found, using defaults", args.config);
        Settings::default()
    };

    // Override with CLI args
    if let Some(broker) = args.broker {
        settings.broker.url = broker;
    }
    if let Some(worker_id) = args.worker_id {
        settings.worker.worker_id = Some(worker_id);
    }
    if args.test_mode {
        settings.broker.test_mode = true;
    }

    let collaborators = Collaborators::from_settings(&settings)?;
    let lifecycle = build(&settings, collaborators)?;

    lifecycle.start_all().await?;
    tracing::info!("Worker running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    lifecycle.close_all().await?;

    Ok(())
}
