use axum::Router;
use clap::Parser;
use std::sync::Arc;
use tasklane_broker::{BrokerConfig, BrokerServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tl-broker")]
#[command(about = "Tasklane job broker", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "broker.yaml")]
    config: String,

    /// Broker host
    #[arg(long)]
    host: Option<String>,

    /// Broker port
    #[arg(long)]
    port: Option<u16>,

    /// REST API port
    #[arg(long)]
    rest_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let config_missing = !std::path::Path::new(&args.config).exists();
    let mut config = if config_missing {
        BrokerConfig::default()
    } else {
        BrokerConfig::from_file(&args.config)?
    };

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.monitoring.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if config_missing {
        tracing::warn!("Config file {} not found, using defaults", args.config);
    }

    // Override with CLI args
    if let Some(host) = args.host {
        config.broker.host = host;
    }
    if let Some(port) = args.port {
        config.broker.port = port;
    }
    if let Some(rest_port) = args.rest_port {
        config.api.rest_port = rest_port;
    }

    tracing::info!("Starting broker with config: {:?}", config);

    let broker = Arc::new(BrokerServer::new(config.clone())?);

    // Start REST API
    if config.api.enabled {
        let api_broker = broker.clone();
        let rest_port = config.api.rest_port;
        tokio::spawn(async move {
            if let Err(e) = start_rest_api(api_broker, rest_port).await {
                tracing::error!("REST API error: {}", e);
            }
        });
    }

    // Start metrics server
    let metrics_broker = broker.clone();
    let metrics_port = config.monitoring.prometheus_port;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_broker, metrics_port).await {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    let signal_broker = broker.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
            signal_broker.shutdown();
        }
    });

    // Run broker
    broker.run().await?;

    Ok(())
}

async fn start_rest_api(broker: Arc<BrokerServer>, port: u16) -> anyhow::Result<()> {
    use tasklane_broker::api::create_rest_api;

    let app = create_rest_api(broker);
    let addr = format!("0.0.0.0:{}", port);

    tracing::info!("REST API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn start_metrics_server(broker: Arc<BrokerServer>, port: u16) -> anyhow::Result<()> {
    use axum::{extract::State, http::StatusCode, routing::get};

    async fn metrics_handler(
        State(broker): State<Arc<BrokerServer>>,
    ) -> Result<String, (StatusCode, String)> {
        broker
            .metrics()
            .render()
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
    }

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(broker);

    let addr = format!("0.0.0.0:{}", port);
    tracing::info!("Metrics server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
