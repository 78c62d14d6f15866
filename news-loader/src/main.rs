//! Load crawled news from the records and completions streams into PostgreSQL, then exit.
use envconfig::Envconfig;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use news_loader::config::Config;
use news_loader::consumer::StreamConsumer;
use news_loader::error::LoaderError;
use news_loader::loader::Loader;
use news_loader::processor::RecordProcessor;
use news_loader::store::postgres::PgNewsStore;
use stream_common::client::RedisStreamClient;
use stream_common::health::HealthRegistry;
use stream_common::metrics::{health_routes, serve, setup_metrics_routes};

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("received shutdown signal");
}

#[tokio::main]
async fn main() -> Result<(), LoaderError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::init_from_env().expect("Invalid configuration:");
    let settings = config.loader_settings();

    info!(
        records = %config.streams.records,
        completions = %config.streams.completions,
        dead_letter = %config.streams.dead_letter,
        consumer = %config.streams.consumer,
        batch = settings.batch,
        block_ms = settings.block.as_millis() as u64,
        quiet_secs = settings.quiet.as_secs(),
        max_run_secs = settings.max_run.as_secs(),
        reset_to_zero = settings.reset_to_zero,
        "starting news loader"
    );

    let client = RedisStreamClient::new(&config.redis_url).await?;
    info!("connected to redis");
    let store = PgNewsStore::new(
        &config.database_url,
        config.max_pg_connections,
        config.company_id_column.as_str(),
    )
    .await?;
    info!("connected to postgres");

    let liveness = HealthRegistry::new("liveness");
    // A records poll blocks for up to BLOCK_MS, so leave room for a slow database on top.
    let loop_deadline = time::Duration::milliseconds(settings.block.as_millis() as i64)
        + time::Duration::seconds(60);
    let loader_liveness = liveness.register("loader", loop_deadline);

    let bind = config.bind();
    let export_prometheus = config.export_prometheus;
    tokio::task::spawn(async move {
        let router = health_routes("news-loader", liveness);
        let router = if export_prometheus {
            setup_metrics_routes(router).expect("failed to install prometheus recorder")
        } else {
            router
        };
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let consumer = StreamConsumer::new(client, config.streams.clone());
    let processor = RecordProcessor::new(
        store,
        config.company_directory(),
        &config.streams.records,
    );
    let mut loader =
        Loader::new(consumer, processor, settings).with_liveness(loader_liveness);

    loader.run(shutdown()).await?;

    Ok(())
}
