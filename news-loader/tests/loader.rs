use std::collections::{BTreeSet, HashMap};
use std::future;
use std::time;

use assert_json_diff::assert_json_include;
use async_trait::async_trait;
use envconfig::Envconfig;
use serde_json::{json, Value};
use stream_common::health::HealthRegistry;
use stream_common::mock::{MockStreamCall, MockStreamClient};
use stream_common::streams::{
    GroupCreation, StreamClient, StreamEntry, StreamResult, StreamSummary,
};

use news_loader::companies::CompanyDirectory;
use news_loader::config::StreamConfig;
use news_loader::consumer::StreamConsumer;
use news_loader::error::LoaderError;
use news_loader::loader::{Loader, LoaderSettings};
use news_loader::processor::RecordProcessor;
use news_loader::progress::ProgressKey;
use news_loader::shutdown::{Decision, ExitReason, LoaderState};
use news_loader::store::memory::{MemoryNewsStore, StoredCompany};

const RECORDS: &str = "crawl:records";
const COMPLETIONS: &str = "crawl:completed";
const DEAD_LETTER: &str = "crawl:dlq";
const GROUP_RECORDS: &str = "db-loaders";

const QUIET: time::Duration = time::Duration::from_secs(10);
const MAX_RUN: time::Duration = time::Duration::from_secs(60);

fn settings() -> LoaderSettings {
    LoaderSettings {
        batch: 200,
        block: time::Duration::from_secs(1),
        completions_batch: 100,
        completions_block: time::Duration::ZERO,
        quiet: QUIET,
        max_run: MAX_RUN,
        reset_to_zero: false,
        delete_records: false,
        delete_sentinels: false,
        trim_on_exit: false,
        keep_last_records: 0,
        keep_last_completed: 0,
        required_sources: BTreeSet::new(),
    }
}

fn loader(
    client: &MockStreamClient,
    store: &MemoryNewsStore,
    settings: LoaderSettings,
) -> Loader<MockStreamClient, MemoryNewsStore> {
    let streams = StreamConfig::init_from_hashmap(&HashMap::new()).expect("default stream config");
    let consumer = StreamConsumer::new(client.clone(), streams);
    let processor = RecordProcessor::new(store.clone(), CompanyDirectory::default(), RECORDS);

    Loader::new(consumer, processor, settings)
}

fn sentinel(client: &MockStreamClient, batch_id: &str, source: &str, row_count: u64) -> String {
    let row_count = row_count.to_string();
    client.seed(
        COMPLETIONS,
        &[
            ("batch_id", batch_id),
            ("source", source),
            ("row_count", row_count.as_str()),
        ],
    )
}

fn records(client: &MockStreamClient, batch_id: &str, source: &str, records: Value) -> String {
    let records = records.to_string();
    client.seed(
        RECORDS,
        &[
            ("batch_id", batch_id),
            ("source", source),
            ("schema", "v1"),
            ("records", records.as_str()),
        ],
    )
}

fn news_urls(store: &MemoryNewsStore, company: &str) -> Vec<String> {
    store.news(company).into_iter().map(|row| row.url).collect()
}

#[tokio::test(start_paused = true)]
async fn test_loads_batch_and_drains() {
    let client = MockStreamClient::new();
    let store = MemoryNewsStore::new();
    let mut loader = loader(&client, &store, settings());

    sentinel(&client, "B1", "toss", 2);
    records(
        &client,
        "B1",
        "toss",
        json!([
            {"url": "https://toss.im/1", "title": "one", "published_at": "2025-01-02T10:00:00+09:00"},
            {"url": "https://toss.im/2", "title": "two", "published_at": "2025-01-03"},
        ]),
    );

    loader.start().await.unwrap();
    assert_eq!(loader.step().await.unwrap(), Decision::Continue);
    assert_eq!(loader.state(), LoaderState::Draining);
    assert_eq!(loader.progress().done(&ProgressKey::new("B1", "toss")), 2);

    assert_eq!(
        store.companies(),
        vec![StoredCompany {
            id: 1,
            name: "Toss".to_owned(),
            name_kr: Some("토스".to_owned()),
        }]
    );
    let news = store.news("Toss");
    assert_eq!(
        news.iter()
            .map(|row| row.published_at.as_deref())
            .collect::<Vec<_>>(),
        vec![Some("2025-01-02"), Some("2025-01-03")]
    );

    let started = tokio::time::Instant::now();
    let summary = loader.run(future::pending()).await.unwrap();

    assert_eq!(summary.exit_reason, ExitReason::Drained);
    assert!(started.elapsed() >= QUIET);
    assert_eq!(summary.totals.inserted, 2);
    assert_eq!(summary.totals.updated, 0);
    assert_eq!(summary.totals.acked_records, 1);
    assert_eq!(summary.totals.acked_completions, 1);
    assert!(client.pending_ids(RECORDS, GROUP_RECORDS).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_replayed_entry_is_idempotent() {
    let client = MockStreamClient::new();
    let store = MemoryNewsStore::new();
    let mut loader = loader(&client, &store, settings());

    let batch = json!([
        {"url": "https://kakao.com/1", "title": "one"},
        {"url": "https://kakao.com/2", "title": "two"},
    ]);
    records(&client, "B1", "kakao", batch.clone());
    records(&client, "B1", "kakao", batch);

    let summary = loader.run(future::pending()).await.unwrap();

    assert_eq!(summary.exit_reason, ExitReason::QuietWithoutSentinels);
    assert_eq!(
        news_urls(&store, "Kakao"),
        vec!["https://kakao.com/1", "https://kakao.com/2"]
    );
    assert_eq!(summary.totals.inserted, 2);
    assert_eq!(summary.totals.updated, 2);
}

#[tokio::test(start_paused = true)]
async fn test_second_version_of_url_wins() {
    let client = MockStreamClient::new();
    let store = MemoryNewsStore::new();
    let mut loader = loader(&client, &store, settings());

    records(
        &client,
        "B1",
        "naver",
        json!([{"url": "https://naver.com/1", "title": "draft", "published_at": "2025-01-01"}]),
    );
    records(
        &client,
        "B2",
        "naver",
        json!([{"url": "https://naver.com/1", "title": "final", "thumbnail_url": "https://img/1"}]),
    );

    loader.run(future::pending()).await.unwrap();

    let news = store.news("Naver");
    assert_eq!(news.len(), 1);
    assert_eq!(news[0].title.as_deref(), Some("final"));
    assert_eq!(news[0].published_at, None);
    assert_eq!(news[0].thumbnail_url.as_deref(), Some("https://img/1"));
}

#[tokio::test(start_paused = true)]
async fn test_incomplete_batch_runs_until_max_run() {
    let client = MockStreamClient::new();
    let store = MemoryNewsStore::new();
    let mut loader = loader(&client, &store, settings());

    sentinel(&client, "B1", "toss", 5);
    let four: Vec<Value> = (0..4)
        .map(|n| json!({"url": format!("https://toss.im/{}", n)}))
        .collect();
    records(&client, "B1", "toss", Value::Array(four));

    loader.start().await.unwrap();
    loader.step().await.unwrap();
    assert_eq!(loader.state(), LoaderState::Running);

    let started = tokio::time::Instant::now();
    let summary = loader.run(future::pending()).await.unwrap();

    assert_eq!(summary.exit_reason, ExitReason::MaxRunReached);
    assert!(started.elapsed() >= MAX_RUN - QUIET);
    assert_eq!(loader.progress().done(&ProgressKey::new("B1", "toss")), 4);
}

#[tokio::test(start_paused = true)]
async fn test_complete_batch_finishes() {
    let client = MockStreamClient::new();
    let store = MemoryNewsStore::new();
    let mut loader = loader(&client, &store, settings());

    sentinel(&client, "B1", "toss", 5);
    let five: Vec<Value> = (0..5)
        .map(|n| json!({"url": format!("https://toss.im/{}", n)}))
        .collect();
    records(&client, "B1", "toss", Value::Array(five));

    let summary = loader.run(future::pending()).await.unwrap();

    assert_eq!(summary.exit_reason, ExitReason::Drained);
}

#[tokio::test(start_paused = true)]
async fn test_required_sources_gate() {
    let client = MockStreamClient::new();
    let store = MemoryNewsStore::new();
    let mut required = settings();
    required.required_sources = ["toss", "naver"].iter().map(|s| s.to_string()).collect();
    let mut missing_naver = loader(&client, &store, required.clone());

    sentinel(&client, "B1", "toss", 1);
    records(&client, "B1", "toss", json!([{"url": "https://toss.im/1"}]));

    let summary = missing_naver.run(future::pending()).await.unwrap();
    assert_eq!(summary.exit_reason, ExitReason::MaxRunReached);

    // Once the missing source announces its (empty) batch, the loader can drain.
    let client = MockStreamClient::new();
    let store = MemoryNewsStore::new();
    let mut all_sources = loader(&client, &store, required);

    sentinel(&client, "B1", "toss", 1);
    sentinel(&client, "B1", "naver", 0);
    records(&client, "B1", "toss", json!([{"url": "https://toss.im/1"}]));

    let summary = all_sources.run(future::pending()).await.unwrap();
    assert_eq!(summary.exit_reason, ExitReason::Drained);
}

#[tokio::test(start_paused = true)]
async fn test_quiet_exit_without_sentinels() {
    let client = MockStreamClient::new();
    let store = MemoryNewsStore::new();
    let mut loader = loader(&client, &store, settings());

    let started = tokio::time::Instant::now();
    let summary = loader.run(future::pending()).await.unwrap();

    assert_eq!(summary.exit_reason, ExitReason::QuietWithoutSentinels);
    assert!(started.elapsed() >= QUIET);
    assert!(started.elapsed() < MAX_RUN);
    assert!(client.get_calls().iter().any(|call| matches!(
        call,
        MockStreamCall::Pending { stream, .. } if stream == RECORDS
    )));
}

#[tokio::test(start_paused = true)]
async fn test_pending_check_failure_stops() {
    let client = MockStreamClient::new().fail_command("XINFO GROUPS", COMPLETIONS);
    let store = MemoryNewsStore::new();
    let mut loader = loader(&client, &store, settings());

    let summary = loader.run(future::pending()).await.unwrap();

    assert_eq!(summary.exit_reason, ExitReason::PendingCheckFailed);
}

#[tokio::test(start_paused = true)]
async fn test_poison_entry_is_dead_lettered() {
    let client = MockStreamClient::new();
    let store = MemoryNewsStore::new();
    let mut loader = loader(&client, &store, settings());

    sentinel(&client, "B1", "toss", 2);
    records(&client, "B1", "toss", json!([{"url": "https://toss.im/1"}]));
    let poison = client.seed(
        RECORDS,
        &[("batch_id", "B1"), ("source", "toss"), ("records", "[{oops")],
    );
    records(&client, "B1", "toss", json!([{"url": "https://toss.im/2"}]));

    let summary = loader.run(future::pending()).await.unwrap();

    assert_eq!(summary.exit_reason, ExitReason::Drained);
    assert_eq!(summary.totals.dead_lettered, 1);
    assert_eq!(summary.totals.acked_records, 3);
    assert_eq!(
        news_urls(&store, "Toss"),
        vec!["https://toss.im/1", "https://toss.im/2"]
    );

    let letters = client.entries(DEAD_LETTER);
    assert_eq!(letters.len(), 1);
    let letter = &letters[0];
    assert_eq!(letter.get("stream"), Some(RECORDS));
    assert_eq!(letter.get("msg_id"), Some(poison.as_str()));
    assert!(letter
        .get("reason")
        .is_some_and(|reason| reason.starts_with("invalid records json")));

    let original: Value = serde_json::from_str(letter.get("fields").unwrap()).unwrap();
    assert_json_include!(
        actual: original,
        expected: json!({"batch_id": "B1", "source": "toss", "records": "[{oops"})
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_write_is_dead_lettered() {
    let client = MockStreamClient::new();
    let store = MemoryNewsStore::new().fail_on_url("https://toss.im/bad");
    let mut loader = loader(&client, &store, settings());

    sentinel(&client, "B1", "toss", 1);
    records(
        &client,
        "B1",
        "toss",
        json!([{"url": "https://toss.im/ok"}, {"url": "https://toss.im/bad"}]),
    );
    records(&client, "B2", "toss", json!([{"url": "https://toss.im/later"}]));

    loader.start().await.unwrap();
    loader.step().await.unwrap();

    // The failed entry was rolled back as a whole and does not count as done.
    assert_eq!(news_urls(&store, "Toss"), vec!["https://toss.im/later"]);
    assert_eq!(loader.progress().done(&ProgressKey::new("B1", "toss")), 0);
    assert_eq!(client.entries(DEAD_LETTER).len(), 1);
    assert!(client.pending_ids(RECORDS, GROUP_RECORDS).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_dead_letter_failure_leaves_entry_pending() {
    let client = MockStreamClient::new().fail_command("XADD", DEAD_LETTER);
    let store = MemoryNewsStore::new();
    let mut loader = loader(&client, &store, settings());

    let poison = client.seed(RECORDS, &[("batch_id", "B1"), ("records", "{}")]);
    records(&client, "B1", "toss", json!([{"url": "https://toss.im/1"}]));

    loader.start().await.unwrap();
    loader.step().await.unwrap();

    assert_eq!(client.pending_ids(RECORDS, GROUP_RECORDS), vec![poison]);
    assert_eq!(loader.totals().acked_records, 1);
    assert_eq!(loader.totals().dead_lettered, 0);

    // Quiet, but something is still pending: only the hard cap ends the run.
    let summary = loader.run(future::pending()).await.unwrap();
    assert_eq!(summary.exit_reason, ExitReason::MaxRunReached);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_sentinel_is_acked_and_dropped() {
    let client = MockStreamClient::new();
    let store = MemoryNewsStore::new();
    let mut loader = loader(&client, &store, settings());

    client.seed(COMPLETIONS, &[("source", "toss"), ("row_count", "3")]);

    loader.start().await.unwrap();
    loader.step().await.unwrap();

    assert!(loader.progress().is_empty());
    assert_eq!(loader.totals().acked_completions, 1);
    assert!(client.pending_ids(COMPLETIONS, "db-sentinels").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_signal_stops_and_trims() {
    let client = MockStreamClient::new();
    let store = MemoryNewsStore::new();
    let mut trimming = settings();
    trimming.trim_on_exit = true;
    trimming.keep_last_records = 1;
    let mut loader = loader(&client, &store, trimming);

    sentinel(&client, "B1", "toss", 10);
    records(&client, "B1", "toss", json!([{"url": "https://toss.im/1"}]));
    records(&client, "B1", "toss", json!([{"url": "https://toss.im/2"}]));

    let summary = loader
        .run(tokio::time::sleep(time::Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(summary.exit_reason, ExitReason::Signal);
    assert_eq!(loader.state(), LoaderState::Stopped(ExitReason::Signal));
    assert_eq!(client.entries(RECORDS).len(), 1);
    assert!(client.entries(COMPLETIONS).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stream_failure_is_fatal_after_exit_hooks() {
    let client = MockStreamClient::new().fail_command("XACK", RECORDS);
    let store = MemoryNewsStore::new();
    let mut trimming = settings();
    trimming.trim_on_exit = true;
    let mut loader = loader(&client, &store, trimming);

    records(&client, "B1", "toss", json!([{"url": "https://toss.im/1"}]));

    let result = loader.run(future::pending()).await;

    assert!(matches!(result, Err(LoaderError::Stream(_))));
    assert!(client
        .get_calls()
        .iter()
        .any(|call| matches!(call, MockStreamCall::Trim { stream, .. } if stream == RECORDS)));

    // Streams are described once at start and once on the way out.
    let described = client
        .get_calls()
        .into_iter()
        .filter(|call| matches!(call, MockStreamCall::Summary { stream } if stream == RECORDS))
        .count();
    assert_eq!(described, 2);
}

#[tokio::test(start_paused = true)]
async fn test_delete_after_ack() {
    let client = MockStreamClient::new();
    let store = MemoryNewsStore::new();
    let mut deleting = settings();
    deleting.delete_records = true;
    deleting.delete_sentinels = true;
    let mut loader = loader(&client, &store, deleting);

    sentinel(&client, "B1", "toss", 1);
    records(&client, "B1", "toss", json!([{"url": "https://toss.im/1"}]));

    loader.start().await.unwrap();
    loader.step().await.unwrap();

    assert!(client.entries(RECORDS).is_empty());
    assert!(client.entries(COMPLETIONS).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reset_to_zero_replays_acked_entries() {
    let client = MockStreamClient::new();
    let store = MemoryNewsStore::new();

    records(&client, "B1", "toss", json!([{"url": "https://toss.im/1"}]));
    let mut first = loader(&client, &store, settings());
    first.run(future::pending()).await.unwrap();

    let mut replaying = settings();
    replaying.reset_to_zero = true;
    let mut second = loader(&client, &store, replaying);
    let summary = second.run(future::pending()).await.unwrap();

    assert_eq!(summary.totals.acked_records, 1);
    assert_eq!(summary.totals.updated, 1);
    assert_eq!(news_urls(&store, "Toss"), vec!["https://toss.im/1"]);
}

#[tokio::test(start_paused = true)]
async fn test_reports_liveness_every_iteration() {
    let client = MockStreamClient::new();
    let store = MemoryNewsStore::new();
    let registry = HealthRegistry::new("liveness");
    let handle = registry.register("loader", ::time::Duration::seconds(30));
    let mut loader = loader(&client, &store, settings()).with_liveness(handle);

    assert!(!registry.get_status().healthy);

    loader.start().await.unwrap();
    loader.step().await.unwrap();

    assert!(registry.get_status().healthy);
}

/// A client whose reads on the records stream never return, like a half-open connection.
struct StalledRecords(MockStreamClient);

#[async_trait]
impl StreamClient for StalledRecords {
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> StreamResult<GroupCreation> {
        self.0.create_group(stream, group, start_id).await
    }

    async fn set_group_id(&self, stream: &str, group: &str, id: &str) -> StreamResult<()> {
        self.0.set_group_id(stream, group, id).await
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: time::Duration,
    ) -> StreamResult<Vec<StreamEntry>> {
        if stream == RECORDS {
            return future::pending().await;
        }
        self.0.read_group(stream, group, consumer, count, block).await
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> StreamResult<u64> {
        self.0.ack(stream, group, ids).await
    }

    async fn delete(&self, stream: &str, ids: &[String]) -> StreamResult<u64> {
        self.0.delete(stream, ids).await
    }

    async fn pending(&self, stream: &str, group: &str) -> StreamResult<u64> {
        self.0.pending(stream, group).await
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> StreamResult<String> {
        self.0.append(stream, fields, max_len).await
    }

    async fn trim(&self, stream: &str, max_len: usize) -> StreamResult<u64> {
        self.0.trim(stream, max_len).await
    }

    async fn summary(&self, stream: &str) -> StreamResult<StreamSummary> {
        self.0.summary(stream).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_max_run_stops_a_stalled_read() {
    let client = MockStreamClient::new();
    let store = MemoryNewsStore::new();
    let streams = StreamConfig::init_from_hashmap(&HashMap::new()).expect("default stream config");
    let mut trimming = settings();
    trimming.trim_on_exit = true;
    let mut loader = Loader::new(
        StreamConsumer::new(StalledRecords(client.clone()), streams),
        RecordProcessor::new(store, CompanyDirectory::default(), RECORDS),
        trimming,
    );

    let started = tokio::time::Instant::now();
    let summary = tokio::time::timeout(
        time::Duration::from_secs(3600),
        loader.run(future::pending()),
    )
    .await
    .expect("run returns once the maximum run time is up")
    .unwrap();

    assert_eq!(summary.exit_reason, ExitReason::MaxRunReached);
    assert_eq!(loader.state(), LoaderState::Stopped(ExitReason::MaxRunReached));
    assert!(started.elapsed() >= MAX_RUN);
    assert!(started.elapsed() < MAX_RUN * 2);
    assert!(client
        .get_calls()
        .iter()
        .any(|call| matches!(call, MockStreamCall::Trim { stream, .. } if stream == RECORDS)));
}
