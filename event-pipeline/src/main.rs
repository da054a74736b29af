use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use event_pipeline::config::Config;
use event_pipeline::server::{router, serve, setup_metrics_recorder};
use event_pipeline::service::EventPipelineService;

fn init_tracing() {
    // LOG_FORMAT=json for production, plain text otherwise
    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));

    let base_layer = fmt::layer().with_target(true).with_level(true);
    let log_layer = if json {
        base_layer
            .json()
            .with_filter(EnvFilter::from_default_env())
            .boxed()
    } else {
        base_layer
            .with_filter(EnvFilter::from_default_env())
            .boxed()
    };

    tracing_subscriber::registry().with(log_layer).init();
}

fn start_server(config: &Config) -> Result<JoinHandle<()>> {
    let recorder_handle =
        setup_metrics_recorder().context("Failed to install the Prometheus metrics recorder")?;
    let router = router(recorder_handle);
    let bind = config.bind_address();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!(bind = %bind, "Failed to serve health and metrics endpoints: {e:#}");
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting event pipeline service");

    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables. Please check your environment setup.")?;

    // not the whole config, DATABASE_URL carries credentials
    info!(
        topic = %config.kafka_consumer_topic,
        group = %config.kafka_consumer_group,
        target_container = %config.target_container,
        dedup_table = %config.dedup_table,
        batch_size = config.batch_size,
        record_concurrency = config.record_concurrency,
        "Configuration loaded"
    );

    let server_handle = start_server(&config)?;
    info!("Started metrics server on {}", config.bind_address());

    // Configuration and backend errors are fatal, nothing has been consumed yet
    let service = EventPipelineService::new(config).await.context(
        "Failed to create event pipeline service. Check the dedup store, target container and Kafka configuration.",
    )?;

    let result = service.run().await;

    server_handle.abort();

    result
}
