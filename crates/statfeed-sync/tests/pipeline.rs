use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use statfeed_core::{Cadence, ConflictPolicy, FeedConfig, FeedShape, FeedState, NaturalKey};
use statfeed_storage::{ArtifactStore, FetchError, FetchedPayload, PayloadSource};
use statfeed_store::{BatchWriter, MemoryBatchStore};
use statfeed_sync::{build_runners, FeedRunner, Scheduler};
use tokio::sync::Semaphore;

fn fixture(name: &str) -> Vec<u8> {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(name);
    std::fs::read(&path).unwrap_or_else(|err| panic!("reading {}: {err}", path.display()))
}

fn payload(body: Vec<u8>) -> FetchedPayload {
    FetchedPayload {
        status: 200,
        final_url: "http://fixture.test/feed.json".into(),
        fetched_at: Utc::now(),
        body,
    }
}

fn feed(name: &str, table: &str, shape: FeedShape, policy: ConflictPolicy) -> FeedConfig {
    FeedConfig {
        name: name.into(),
        url: format!("http://fixture.test/{name}.json"),
        table: table.into(),
        shape,
        policy,
        cadence: Cadence::Every(Duration::from_secs(21_600)),
    }
}

fn historical() -> FeedConfig {
    feed(
        "state_historical",
        "statehistorical",
        FeedShape::Array,
        ConflictPolicy::AppendIfNewHash,
    )
}

fn us_current() -> FeedConfig {
    feed(
        "us_current",
        "uscurrent",
        FeedShape::Object,
        ConflictPolicy::UpsertByNaturalKey(NaturalKey::Singleton("US".into())),
    )
}

enum Step {
    Body(Vec<u8>),
    Timeout,
    Status(u16),
}

/// Replays a fixed sequence of fetch outcomes, then repeats the last one.
struct ScriptedSource {
    steps: Mutex<VecDeque<Step>>,
}

impl ScriptedSource {
    fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
        })
    }
}

#[async_trait]
impl PayloadSource for ScriptedSource {
    async fn fetch(&self, _feed: &str, url: &str) -> Result<FetchedPayload, FetchError> {
        let step = {
            let mut steps = self.steps.lock().expect("steps");
            if steps.len() > 1 {
                steps.pop_front()
            } else {
                steps.front().map(|s| match s {
                    Step::Body(b) => Step::Body(b.clone()),
                    Step::Timeout => Step::Timeout,
                    Step::Status(code) => Step::Status(*code),
                })
            }
        };
        match step {
            Some(Step::Body(body)) => Ok(payload(body)),
            Some(Step::Timeout) => Err(FetchError::Timeout {
                url: url.into(),
                timeout: Duration::from_secs(10),
            }),
            Some(Step::Status(status)) => Err(FetchError::HttpStatus {
                status,
                url: url.into(),
            }),
            None => panic!("script exhausted"),
        }
    }
}

/// Blocks every fetch until a permit is released, tracking concurrency.
struct GatedSource {
    gate: Semaphore,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    started: AtomicUsize,
    body: Vec<u8>,
}

impl GatedSource {
    fn new(body: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            gate: Semaphore::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            started: AtomicUsize::new(0),
            body,
        })
    }
}

#[async_trait]
impl PayloadSource for GatedSource {
    async fn fetch(&self, _feed: &str, _url: &str) -> Result<FetchedPayload, FetchError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let permit = self.gate.acquire().await.expect("gate open");
        permit.forget();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(payload(self.body.clone()))
    }
}

/// Sleeps through every fetch, tracking how many overlap.
struct SlowSource {
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    body: Vec<u8>,
}

#[async_trait]
impl PayloadSource for SlowSource {
    async fn fetch(&self, _feed: &str, _url: &str) -> Result<FetchedPayload, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(payload(self.body.clone()))
    }
}

fn runner(
    feed: FeedConfig,
    source: Arc<dyn PayloadSource>,
    store: &Arc<MemoryBatchStore>,
    archive: Option<ArtifactStore>,
) -> Arc<FeedRunner> {
    let writer = BatchWriter::new(Arc::clone(store) as _);
    Arc::new(FeedRunner::new(feed, source, archive, writer))
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn repeated_historical_runs_add_nothing_new() {
    let store = Arc::new(MemoryBatchStore::new());
    let source = ScriptedSource::new(vec![Step::Body(fixture("states_daily.json"))]);
    let runner = runner(historical(), source, &store, None);

    let first = runner.tick().await;
    assert!(first.is_success(), "{first:?}");
    assert_eq!(first.received, 2);
    assert_eq!(first.written, 2);

    let second = runner.tick().await;
    assert!(second.is_success(), "{second:?}");
    assert_eq!(second.received, 2);
    assert_eq!(second.written, 0);
    assert_eq!(store.row_count("statehistorical"), 2);
    assert_eq!(runner.state(), FeedState::Idle);
}

#[tokio::test]
async fn current_feed_overwrites_its_single_row() {
    let store = Arc::new(MemoryBatchStore::new());
    let first = br#"{"positive": 100, "death": 1, "hash": "a1"}"#.to_vec();
    let second = br#"{"positive": 150, "death": 2, "hash": "b2"}"#.to_vec();
    let source = ScriptedSource::new(vec![Step::Body(first), Step::Body(second)]);
    let runner = runner(us_current(), source, &store, None);

    assert_eq!(runner.tick().await.written, 1);
    assert_eq!(runner.tick().await.written, 1);

    let rows = store.find("uscurrent", "state", "US");
    assert_eq!(rows.len(), 1);
    assert_eq!(store.row_count("uscurrent"), 1);
    assert_eq!(rows[0].get("positive").and_then(|v| v.as_int()), Some(150));
}

#[tokio::test]
async fn malformed_payload_writes_nothing_and_returns_to_idle() {
    let store = Arc::new(MemoryBatchStore::new());
    let source = ScriptedSource::new(vec![Step::Body(fixture("states_daily_missing_region.json"))]);
    let runner = runner(historical(), source, &store, None);
    let mut states = runner.subscribe();

    let result = runner.tick().await;
    assert!(!result.is_success());
    assert_eq!(result.error_kind.as_deref(), Some("malformed_payload"));
    assert_eq!(result.written, 0);
    assert_eq!(store.row_count("statehistorical"), 0);
    assert_eq!(runner.state(), FeedState::Idle);
    assert!(states.has_changed().expect("sender alive"));
    assert_eq!(*states.borrow_and_update(), FeedState::Idle);

    let last = runner.last_result().expect("failed run is retained");
    assert_eq!(last.run_id, result.run_id);
    assert_eq!(last.error_kind.as_deref(), Some("malformed_payload"));
}

#[tokio::test]
async fn last_result_tracks_the_latest_outcome() {
    let store = Arc::new(MemoryBatchStore::new());
    let source = ScriptedSource::new(vec![Step::Status(502), Step::Body(fixture("states_daily.json"))]);
    let runner = runner(historical(), source, &store, None);
    let mut results = runner.subscribe_results();
    assert!(runner.last_result().is_none());

    runner.tick().await;
    assert!(results.has_changed().expect("sender alive"));
    let failed = results.borrow_and_update().clone().expect("first outcome");
    assert_eq!(failed.error_kind.as_deref(), Some("http_status"));

    runner.tick().await;
    let ok = results.borrow_and_update().clone().expect("second outcome");
    assert!(ok.is_success());
    assert_eq!(ok.written, 2);
}

#[tokio::test]
async fn fetch_failures_are_classified_and_next_tick_recovers() {
    let store = Arc::new(MemoryBatchStore::new());
    let source = ScriptedSource::new(vec![
        Step::Timeout,
        Step::Status(503),
        Step::Body(fixture("states_daily.json")),
    ]);
    let runner = runner(historical(), source, &store, None);

    let timeout = runner.tick().await;
    assert_eq!(timeout.error_kind.as_deref(), Some("transport"));
    let status = runner.tick().await;
    assert_eq!(status.error_kind.as_deref(), Some("http_status"));
    assert!(status.error.as_deref().unwrap_or_default().contains("503"));
    assert_eq!(store.row_count("statehistorical"), 0);

    let recovered = runner.tick().await;
    assert!(recovered.is_success(), "{recovered:?}");
    assert_eq!(recovered.written, 2);
    assert_ne!(timeout.run_id, recovered.run_id);
}

#[tokio::test]
async fn store_failures_surface_as_run_errors() {
    let store = Arc::new(MemoryBatchStore::new());
    let source = ScriptedSource::new(vec![Step::Body(fixture("states_daily.json"))]);
    let runner = runner(historical(), source, &store, None);

    store.set_unavailable(true);
    let down = runner.tick().await;
    assert_eq!(down.error_kind.as_deref(), Some("store_unavailable"));

    store.set_unavailable(false);
    store.fail_statement_at(Some(1));
    let partial = runner.tick().await;
    assert_eq!(partial.error_kind.as_deref(), Some("partial_batch_failure"));
    assert_eq!(store.row_count("statehistorical"), 0);

    store.fail_statement_at(None);
    assert_eq!(runner.tick().await.written, 2);
}

#[tokio::test]
async fn raw_payload_is_archived_even_when_decode_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryBatchStore::new());
    let source = ScriptedSource::new(vec![Step::Body(b"{not json".to_vec())]);
    let runner = runner(
        historical(),
        source,
        &store,
        Some(ArtifactStore::new(dir.path())),
    );

    let result = runner.tick().await;
    assert_eq!(result.error_kind.as_deref(), Some("malformed_payload"));

    let archived: Vec<_> = std::fs::read_dir(dir.path().join("state_historical"))
        .expect("archive dir")
        .filter_map(Result::ok)
        .collect();
    assert_eq!(archived.len(), 1);
    assert_eq!(std::fs::read(archived[0].path()).expect("read"), b"{not json");
}

#[tokio::test]
async fn archive_failure_does_not_stop_ingestion() {
    let dir = tempfile::tempdir().expect("tempdir");
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"file").expect("write blocker");

    let store = Arc::new(MemoryBatchStore::new());
    let source = ScriptedSource::new(vec![Step::Body(fixture("states_daily.json"))]);
    let runner = runner(historical(), source, &store, Some(ArtifactStore::new(&blocker)));

    let result = runner.tick().await;
    assert!(result.is_success(), "{result:?}");
    assert_eq!(result.written, 2);
}

#[tokio::test]
async fn empty_payload_skips_the_write() {
    let store = Arc::new(MemoryBatchStore::new());
    let source = ScriptedSource::new(vec![Step::Body(b"[]".to_vec())]);
    let runner = runner(historical(), source, &store, None);

    let result = runner.tick().await;
    assert!(result.is_success(), "{result:?}");
    assert_eq!((result.received, result.written), (0, 0));
}

#[tokio::test]
async fn overlapping_ticks_for_one_feed_do_not_run_concurrently() {
    let store = Arc::new(MemoryBatchStore::new());
    let source = GatedSource::new(fixture("states_daily.json"));
    let runner = runner(historical(), source.clone(), &store, None);

    let first = tokio::spawn({
        let runner = Arc::clone(&runner);
        async move { runner.tick().await }
    });
    wait_for(|| source.started.load(Ordering::SeqCst) == 1).await;
    assert_eq!(runner.state(), FeedState::Fetching);

    let second = tokio::spawn({
        let runner = Arc::clone(&runner);
        async move { runner.tick().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(source.started.load(Ordering::SeqCst), 1);

    source.gate.add_permits(2);
    let first = first.await.expect("first run");
    let second = second.await.expect("second run");

    assert_eq!(source.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(first.written, 2);
    assert_eq!(second.written, 0);
    assert!(second.started_at >= first.finished_at);
}

#[tokio::test]
async fn a_stuck_feed_does_not_delay_other_feeds() {
    let store = Arc::new(MemoryBatchStore::new());
    let stuck = GatedSource::new(fixture("states_daily.json"));
    let healthy = ScriptedSource::new(vec![Step::Body(fixture("us_current.json"))]);

    let stuck_runner = runner(historical(), stuck.clone(), &store, None);
    let healthy_runner = runner(us_current(), healthy, &store, None);

    let blocked = tokio::spawn({
        let runner = Arc::clone(&stuck_runner);
        async move { runner.tick().await }
    });
    wait_for(|| stuck.started.load(Ordering::SeqCst) == 1).await;

    let result = tokio::time::timeout(Duration::from_secs(2), healthy_runner.tick())
        .await
        .expect("healthy feed finished while the other was stuck");
    assert!(result.is_success(), "{result:?}");
    assert_eq!(store.row_count("uscurrent"), 1);
    assert_eq!(stuck_runner.state(), FeedState::Fetching);

    stuck.gate.add_permits(1);
    assert!(blocked.await.expect("stuck run").is_success());
}

#[tokio::test]
async fn run_all_once_reports_each_feed_in_order() {
    let store = Arc::new(MemoryBatchStore::new());
    let source = ScriptedSource::new(vec![Step::Status(500)]);
    let runners = build_runners(
        vec![historical(), us_current()],
        source,
        None,
        Arc::clone(&store) as _,
    );
    let scheduler = Scheduler::new(runners);

    let results = scheduler.run_all_once().await;
    let names: Vec<_> = results.iter().map(|r| r.feed.as_str()).collect();
    assert_eq!(names, ["state_historical", "us_current"]);
    assert!(results
        .iter()
        .all(|r| r.error_kind.as_deref() == Some("http_status")));
    assert!(scheduler
        .runners()
        .iter()
        .all(|r| r.state() == FeedState::Idle));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interval_jobs_tick_repeatedly_without_overlap() {
    let store = Arc::new(MemoryBatchStore::new());
    let source = Arc::new(SlowSource {
        delay: Duration::from_millis(1500),
        calls: AtomicUsize::new(0),
        in_flight: AtomicUsize::new(0),
        max_in_flight: AtomicUsize::new(0),
        body: fixture("us_current.json"),
    });
    let feed = FeedConfig {
        cadence: Cadence::Every(Duration::from_secs(1)),
        ..us_current()
    };
    let scheduler = Scheduler::new(build_runners(
        vec![feed],
        source.clone(),
        None,
        Arc::clone(&store) as _,
    ));

    scheduler
        .run_until(false, tokio::time::sleep(Duration::from_millis(4500)))
        .await
        .expect("scheduler runs");

    assert!(source.calls.load(Ordering::SeqCst) >= 2);
    assert_eq!(source.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(source.in_flight.load(Ordering::SeqCst), 0);
    assert_eq!(store.row_count("uscurrent"), 1);
    let runner = &scheduler.runners()[0];
    assert_eq!(runner.state(), FeedState::Idle);
    assert!(runner.last_result().expect("ran").is_success());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn initial_run_finishes_before_shutdown_returns() {
    let store = Arc::new(MemoryBatchStore::new());
    let source = Arc::new(SlowSource {
        delay: Duration::from_millis(300),
        calls: AtomicUsize::new(0),
        in_flight: AtomicUsize::new(0),
        max_in_flight: AtomicUsize::new(0),
        body: fixture("states_daily.json"),
    });
    let scheduler = Scheduler::new(build_runners(
        vec![historical()],
        source.clone(),
        None,
        Arc::clone(&store) as _,
    ));

    scheduler
        .run_until(true, tokio::time::sleep(Duration::from_millis(50)))
        .await
        .expect("scheduler runs");

    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.row_count("statehistorical"), 2);
}
