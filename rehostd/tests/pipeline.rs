//! End-to-end pipeline tests on an in-memory store with stubbed external
//! collaborators (locator, transcoder, delivery transport).

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use rehostd::database::memory_pool;
use rehostd::delivery::{
    DeliveryCredential, DeliveryDispatcher, DeliveryTransport, DispatcherConfig, ResultRef,
    ResultRouter, SendError,
};
use rehostd::locator::{FetchError, LocatorService, MediaLocation};
use rehostd::pipeline::{
    ConcurrencyGovernor, GovernorConfig, Job, JobQueue, JobQueueConfig, JobStore, NotifierConfig,
    ProgressNotifier, ProgressReporter, PutOutcome, SqlxFingerprintStore, SqlxJobStore,
    WorkerPool, WorkerPoolConfig, fingerprint,
};
use rehostd::pipeline::fingerprint::FingerprintStore;
use rehostd::transcode::{Artifact, Transcoder};

struct StubLocator {
    fail_first: AtomicUsize,
    permanent: bool,
}

impl StubLocator {
    fn ok() -> Self {
        Self {
            fail_first: AtomicUsize::new(0),
            permanent: false,
        }
    }

    fn transient_failures(n: usize) -> Self {
        Self {
            fail_first: AtomicUsize::new(n),
            permanent: false,
        }
    }

    fn permanent_failure() -> Self {
        Self {
            fail_first: AtomicUsize::new(0),
            permanent: true,
        }
    }
}

#[async_trait]
impl LocatorService for StubLocator {
    async fn locate(&self, _source_url: &str) -> Result<MediaLocation, FetchError> {
        if self.permanent {
            return Err(FetchError::Permanent("locator rejected link".into()));
        }
        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return Err(FetchError::Transient("locator timed out".into()));
        }
        Ok(MediaLocation {
            stream_url: "https://cdn.example/stream.mp4".into(),
            size_bytes: Some(9),
            duration_secs: Some(1.0),
        })
    }
}

/// Writes a small file after a configurable delay, holding the duplicate
/// race window open. Can be told to fail the first N calls, or every call.
struct StubTranscoder {
    delay: Duration,
    fail_first: AtomicUsize,
    permanent: bool,
}

impl StubTranscoder {
    fn ok(delay: Duration) -> Self {
        Self {
            delay,
            fail_first: AtomicUsize::new(0),
            permanent: false,
        }
    }

    fn transient_failures(delay: Duration, n: usize) -> Self {
        Self {
            delay,
            fail_first: AtomicUsize::new(n),
            permanent: false,
        }
    }

    fn permanent_failure(delay: Duration) -> Self {
        Self {
            delay,
            fail_first: AtomicUsize::new(0),
            permanent: true,
        }
    }
}

#[async_trait]
impl Transcoder for StubTranscoder {
    async fn transcode(
        &self,
        _location: &MediaLocation,
        output_path: &Path,
        _reporter: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<Artifact, FetchError> {
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(FetchError::Transient("transcode cancelled".into()));
            }
            _ = tokio::time::sleep(self.delay) => {}
        }
        if self.permanent {
            return Err(FetchError::Permanent("stream unreadable".into()));
        }
        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            return Err(FetchError::Transient("stream reset".into()));
        }
        tokio::fs::write(output_path, b"mp4 bytes")
            .await
            .map_err(|e| FetchError::Permanent(format!("write failed: {e}")))?;
        Ok(Artifact {
            path: output_path.to_path_buf(),
            size_bytes: 9,
        })
    }
}

#[derive(Default)]
struct RecordingTransport {
    stores: AtomicUsize,
    relays: Mutex<Vec<(i64, String)>>,
    statuses: Mutex<Vec<(i64, String)>>,
}

#[async_trait]
impl DeliveryTransport for RecordingTransport {
    async fn store(
        &self,
        _credential: &DeliveryCredential,
        _artifact: &Artifact,
    ) -> Result<ResultRef, SendError> {
        let n = self.stores.fetch_add(1, Ordering::SeqCst);
        Ok(ResultRef::new(format!("ref-{n}")))
    }

    async fn relay(&self, requester_id: i64, result_ref: &ResultRef) -> Result<(), SendError> {
        self.relays
            .lock()
            .push((requester_id, result_ref.as_str().to_string()));
        Ok(())
    }

    async fn update_status(&self, requester_id: i64, text: &str) -> Result<(), SendError> {
        self.statuses.lock().push((requester_id, text.to_string()));
        Ok(())
    }
}

struct Harness {
    queue: Arc<JobQueue>,
    store: Arc<SqlxJobStore>,
    transport: Arc<RecordingTransport>,
    pool: Arc<WorkerPool>,
    _scratch: tempfile::TempDir,
}

fn fast_pool_config() -> WorkerPoolConfig {
    WorkerPoolConfig {
        job_timeout_secs: 30,
        poll_interval_ms: 10,
    }
}

async fn harness(
    locator: StubLocator,
    transcoder: StubTranscoder,
    queue_config: JobQueueConfig,
    pool_config: WorkerPoolConfig,
) -> Harness {
    let db = memory_pool().await.unwrap();
    let store = Arc::new(SqlxJobStore::new(db.clone()));
    let queue = Arc::new(JobQueue::new(store.clone(), queue_config));
    let fingerprints = Arc::new(SqlxFingerprintStore::new(db));

    let governor = Arc::new(ConcurrencyGovernor::new(GovernorConfig {
        max_workers: 2,
        ..Default::default()
    }));

    let transport = Arc::new(RecordingTransport::default());
    let dispatcher = Arc::new(DeliveryDispatcher::new(
        &["bot_a".to_string(), "bot_b".to_string()],
        transport.clone(),
        DispatcherConfig::default(),
    ));
    let router = Arc::new(ResultRouter::new(transport.clone(), "canonical"));
    let notifier = Arc::new(ProgressNotifier::new(NotifierConfig::default()));

    let scratch = tempfile::tempdir().unwrap();
    let pool = Arc::new(WorkerPool::new(
        queue.clone(),
        fingerprints,
        governor,
        Arc::new(locator),
        Arc::new(transcoder),
        dispatcher,
        router,
        notifier,
        pool_config,
        scratch.path().to_path_buf(),
    ));

    Harness {
        queue,
        store,
        transport,
        pool,
        _scratch: scratch,
    }
}

/// Requester ids that received a failure notice, sorted.
fn failure_notices(transport: &RecordingTransport) -> Vec<i64> {
    let mut out: Vec<i64> = transport
        .statuses
        .lock()
        .iter()
        .filter(|(_, text)| text.contains("could not be completed"))
        .map(|(requester, _)| *requester)
        .collect();
    out.sort_unstable();
    out
}

async fn wait_for<F>(mut condition: F, timeout: Duration)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn duplicate_claim_race_stores_once_and_relays_to_both() {
    let h = harness(
        StubLocator::ok(),
        StubTranscoder::ok(Duration::from_millis(200)),
        JobQueueConfig::default(),
        fast_pool_config(),
    )
    .await;

    let fp = fingerprint("https://example.com/share/abc");
    h.queue.enqueue(&Job::new(&fp, "https://example.com/share/abc", 10)).await.unwrap();
    h.queue.enqueue(&Job::new(&fp, "https://example.com/share/abc", 20)).await.unwrap();

    let cancel = CancellationToken::new();
    let mut tasks = h.pool.spawn(cancel.clone());

    let transport = h.transport.clone();
    wait_for(|| transport.relays.lock().len() >= 2, Duration::from_secs(5)).await;
    cancel.cancel();
    while tasks.join_next().await.is_some() {}

    // exactly one store call despite two requesters
    assert_eq!(h.transport.stores.load(Ordering::SeqCst), 1);

    let relays = h.transport.relays.lock();
    assert_eq!(relays.len(), 2);
    assert_eq!(relays[0].1, relays[1].1, "both requesters get the same result_ref");
    let mut requesters: Vec<i64> = relays.iter().map(|(r, _)| *r).collect();
    requesters.sort_unstable();
    assert_eq!(requesters, vec![10, 20]);

    assert_eq!(h.queue.depth().await.unwrap(), 0);
}

#[tokio::test]
async fn permanent_failure_dead_letters_and_reports() {
    let h = harness(
        StubLocator::permanent_failure(),
        StubTranscoder::ok(Duration::from_millis(5)),
        JobQueueConfig::default(),
        fast_pool_config(),
    )
    .await;

    h.queue
        .enqueue(&Job::new("fp-perm", "https://example.com/bad", 7))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let mut tasks = h.pool.spawn(cancel.clone());

    let transport = h.transport.clone();
    wait_for(
        || !failure_notices(&transport).is_empty(),
        Duration::from_secs(5),
    )
    .await;
    cancel.cancel();
    while tasks.join_next().await.is_some() {}

    assert_eq!(h.store.dead_letter_count().await.unwrap(), 1);
    assert_eq!(h.transport.stores.load(Ordering::SeqCst), 0);
    assert!(h.transport.relays.lock().is_empty());

    // progress lines share the status channel, so look for the notice
    // rather than assuming it comes first
    assert_eq!(failure_notices(&h.transport), vec![7]);
}

#[tokio::test]
async fn transient_failure_retries_and_completes() {
    let h = harness(
        StubLocator::transient_failures(1),
        StubTranscoder::ok(Duration::from_millis(5)),
        JobQueueConfig::default(),
        fast_pool_config(),
    )
    .await;

    h.queue
        .enqueue(&Job::new("fp-retry", "https://example.com/flaky", 5))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let mut tasks = h.pool.spawn(cancel.clone());

    let transport = h.transport.clone();
    wait_for(|| !transport.relays.lock().is_empty(), Duration::from_secs(5)).await;
    cancel.cancel();
    while tasks.join_next().await.is_some() {}

    assert_eq!(h.transport.stores.load(Ordering::SeqCst), 1);
    assert_eq!(h.store.dead_letter_count().await.unwrap(), 0);
    assert_eq!(h.queue.depth().await.unwrap(), 0);
}

#[tokio::test]
async fn transient_exhaustion_routes_to_dead_letter_once() {
    let config = JobQueueConfig {
        max_attempts: 2,
        ..Default::default()
    };
    let h = harness(
        StubLocator::transient_failures(10),
        StubTranscoder::ok(Duration::from_millis(5)),
        config,
        fast_pool_config(),
    )
    .await;

    h.queue
        .enqueue(&Job::new("fp-exhaust", "https://example.com/down", 9))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let mut tasks = h.pool.spawn(cancel.clone());

    let store = h.store.clone();
    wait_for_async(
        || {
            let store = store.clone();
            async move { store.dead_letter_count().await.unwrap() >= 1 }
        },
        Duration::from_secs(5),
    )
    .await;
    cancel.cancel();
    while tasks.join_next().await.is_some() {}

    assert_eq!(h.store.dead_letter_count().await.unwrap(), 1);
    assert_eq!(h.queue.depth().await.unwrap(), 0);
    assert_eq!(h.transport.stores.load(Ordering::SeqCst), 0);
}

async fn wait_for_async<F, Fut>(mut condition: F, timeout: Duration)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn wall_clock_ceiling_cancels_requeues_then_dead_letters() {
    let queue_config = JobQueueConfig {
        max_attempts: 2,
        ..Default::default()
    };
    let h = harness(
        StubLocator::ok(),
        StubTranscoder::ok(Duration::from_secs(60)),
        queue_config,
        WorkerPoolConfig {
            job_timeout_secs: 1,
            poll_interval_ms: 10,
        },
    )
    .await;

    h.queue
        .enqueue(&Job::new("fp-slow", "https://example.com/huge", 3))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let mut tasks = h.pool.spawn(cancel.clone());

    // cancelled at the 1s ceiling, requeued, dead-lettered on the second hit
    let store = h.store.clone();
    wait_for_async(
        || {
            let store = store.clone();
            async move { store.dead_letter_count().await.unwrap() >= 1 }
        },
        Duration::from_secs(10),
    )
    .await;
    cancel.cancel();
    while tasks.join_next().await.is_some() {}

    assert_eq!(h.store.dead_letter_count().await.unwrap(), 1);
    assert_eq!(h.queue.depth().await.unwrap(), 0);
    assert_eq!(h.transport.stores.load(Ordering::SeqCst), 0);
    assert!(h.transport.relays.lock().is_empty());
    assert_eq!(failure_notices(&h.transport), vec![3]);
}

#[tokio::test]
async fn waiter_behind_permanent_failure_is_notified() {
    let h = harness(
        StubLocator::ok(),
        StubTranscoder::permanent_failure(Duration::from_millis(300)),
        JobQueueConfig::default(),
        fast_pool_config(),
    )
    .await;

    let fp = fingerprint("https://example.com/share/bad");
    h.queue.enqueue(&Job::new(&fp, "https://example.com/share/bad", 10)).await.unwrap();
    h.queue.enqueue(&Job::new(&fp, "https://example.com/share/bad", 20)).await.unwrap();

    let cancel = CancellationToken::new();
    let mut tasks = h.pool.spawn(cancel.clone());

    let transport = h.transport.clone();
    wait_for(|| failure_notices(&transport).len() >= 2, Duration::from_secs(5)).await;
    cancel.cancel();
    while tasks.join_next().await.is_some() {}

    // the duplicate was acked as a waiter, so only the primary dead-letters,
    // but both requesters hear about the failure
    assert_eq!(h.store.dead_letter_count().await.unwrap(), 1);
    assert_eq!(failure_notices(&h.transport), vec![10, 20]);
    assert_eq!(h.transport.stores.load(Ordering::SeqCst), 0);
    assert!(h.transport.relays.lock().is_empty());
    assert_eq!(h.queue.depth().await.unwrap(), 0);
}

#[tokio::test]
async fn waiter_is_requeued_when_primary_fails_transiently() {
    let h = harness(
        StubLocator::ok(),
        StubTranscoder::transient_failures(Duration::from_millis(300), 1),
        JobQueueConfig::default(),
        fast_pool_config(),
    )
    .await;

    let fp = fingerprint("https://example.com/share/flaky");
    h.queue.enqueue(&Job::new(&fp, "https://example.com/share/flaky", 10)).await.unwrap();
    h.queue.enqueue(&Job::new(&fp, "https://example.com/share/flaky", 20)).await.unwrap();

    let cancel = CancellationToken::new();
    let mut tasks = h.pool.spawn(cancel.clone());

    let transport = h.transport.clone();
    wait_for(|| transport.relays.lock().len() >= 2, Duration::from_secs(5)).await;
    cancel.cancel();
    while tasks.join_next().await.is_some() {}

    // the waiter went back on the queue with the primary's retry; after the
    // retry succeeds both requesters get the same reference from one store
    assert_eq!(h.transport.stores.load(Ordering::SeqCst), 1);
    let relays = h.transport.relays.lock();
    assert_eq!(relays.len(), 2);
    assert_eq!(relays[0].1, relays[1].1);
    let mut requesters: Vec<i64> = relays.iter().map(|(r, _)| *r).collect();
    requesters.sort_unstable();
    assert_eq!(requesters, vec![10, 20]);
    drop(relays);

    assert_eq!(h.store.dead_letter_count().await.unwrap(), 0);
    assert_eq!(h.queue.depth().await.unwrap(), 0);
}

#[tokio::test]
async fn fingerprint_entry_is_written_exactly_once_under_race() {
    let db = memory_pool().await.unwrap();
    let store = Arc::new(SqlxFingerprintStore::new(db));

    let a = store.clone();
    let b = store.clone();
    let (ra, rb) = tokio::join!(
        a.put_if_absent("fp-race", "ref-a"),
        b.put_if_absent("fp-race", "ref-b"),
    );
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    let inserted = [&ra, &rb]
        .iter()
        .filter(|o| matches!(o, PutOutcome::Inserted))
        .count();
    assert_eq!(inserted, 1, "exactly one writer wins");

    let winner = store.get("fp-race").await.unwrap().unwrap();
    for outcome in [ra, rb] {
        if let PutOutcome::AlreadyPresent { result_ref } = outcome {
            assert_eq!(result_ref, winner.result_ref);
        }
    }
}
