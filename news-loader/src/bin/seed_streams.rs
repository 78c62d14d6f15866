//! Publish a synthetic batch of news and its completion sentinel, for local runs of the loader.
use chrono::{Duration, Utc};
use envconfig::Envconfig;
use tracing::info;

use news_loader::decode::RecordItem;
use news_loader::error::LoaderError;
use news_loader::publisher::Publisher;
use stream_common::client::RedisStreamClient;

#[derive(Envconfig)]
struct Config {
    #[envconfig(default = "redis://localhost:6379/")]
    redis_url: String,

    #[envconfig(from = "STREAM_RECORDS", default = "crawl:records")]
    records_stream: String,

    #[envconfig(from = "STREAM_COMPLETED", default = "crawl:completed")]
    completions_stream: String,

    #[envconfig(from = "REDIS_CHUNK_SIZE", default = "200")]
    chunk_size: usize,

    #[envconfig(from = "SEED_SOURCE", default = "toss")]
    source: String,

    #[envconfig(from = "SEED_BATCH_ID")]
    batch_id: Option<String>,

    #[envconfig(from = "SEED_COUNT", default = "5")]
    count: usize,

    /// Announce this many records instead of the number published, to exercise partial batches.
    #[envconfig(from = "SEED_ANNOUNCED_COUNT")]
    announced: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), LoaderError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");
    let now = Utc::now();
    let batch_id = config
        .batch_id
        .unwrap_or_else(|| now.format("%Y%m%d%H%M%S").to_string());

    let records: Vec<RecordItem> = (0..config.count)
        .map(|n| RecordItem {
            url: Some(format!(
                "https://news.example.com/{}/{}/{}",
                config.source, batch_id, n
            )),
            title: Some(format!("{} news #{}", config.source, n)),
            published_at: Some((now - Duration::days(n as i64)).to_rfc3339()),
            thumbnail_url: None,
            source: Some(config.source.clone()),
        })
        .collect();

    let client = RedisStreamClient::new(&config.redis_url).await?;
    let publisher = Publisher::new(
        client,
        &config.records_stream,
        &config.completions_stream,
        config.chunk_size,
    );

    let entries = publisher
        .publish_records(&config.source, &batch_id, &records)
        .await?;
    let announced = config.announced.unwrap_or(records.len() as u64);
    let sentinel_id = publisher
        .publish_completion(&config.source, &batch_id, announced)
        .await?;

    info!(
        source = %config.source,
        batch_id = %batch_id,
        records = records.len(),
        entries,
        announced,
        sentinel_id = %sentinel_id,
        "published batch"
    );

    Ok(())
}
