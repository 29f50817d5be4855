//! Worker pool: claims jobs and drives them through the pipeline.
//!
//! Each worker is a loop: claim → per-fingerprint exclusivity → locate →
//! transcode → store → record fingerprint → relay. The pool spawns as many
//! workers as the governor's configured maximum; a worker whose index is at
//! or past `current_limit()` parks instead of claiming, so throttling shrinks
//! admission without preempting running jobs. A job that exceeds the
//! wall-clock ceiling is cancelled and requeued.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::fingerprint::{BeginOutcome, FingerprintStore, InflightRegistry};
use super::governor::ConcurrencyGovernor;
use super::job_queue::{Job, JobQueue, RequeueOutcome};
use super::notifier::ProgressNotifier;
use super::progress::{
    ProgressPhase, ProgressReporter, ProgressState, ProgressUpdate, progress_channel,
};
use crate::Result;
use crate::delivery::{DeliveryDispatcher, ResultRef, ResultRouter};
use crate::locator::{FetchError, LocatorService};
use crate::transcode::Transcoder;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Hard wall-clock ceiling per job, claim to terminal state.
    pub job_timeout_secs: u64,
    /// Parked-worker poll period and idle claim fallback.
    pub poll_interval_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            job_timeout_secs: 1200,
            poll_interval_ms: 500,
        }
    }
}

pub struct WorkerPool {
    queue: Arc<JobQueue>,
    fingerprints: Arc<dyn FingerprintStore>,
    inflight: Arc<InflightRegistry>,
    governor: Arc<ConcurrencyGovernor>,
    locator: Arc<dyn LocatorService>,
    transcoder: Arc<dyn Transcoder>,
    dispatcher: Arc<DeliveryDispatcher>,
    router: Arc<ResultRouter>,
    notifier: Arc<ProgressNotifier>,
    config: WorkerPoolConfig,
    download_dir: PathBuf,
    progress_tx: mpsc::Sender<ProgressUpdate>,
    progress_rx: parking_lot::Mutex<Option<mpsc::Receiver<ProgressUpdate>>>,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<JobQueue>,
        fingerprints: Arc<dyn FingerprintStore>,
        governor: Arc<ConcurrencyGovernor>,
        locator: Arc<dyn LocatorService>,
        transcoder: Arc<dyn Transcoder>,
        dispatcher: Arc<DeliveryDispatcher>,
        router: Arc<ResultRouter>,
        notifier: Arc<ProgressNotifier>,
        config: WorkerPoolConfig,
        download_dir: PathBuf,
    ) -> Self {
        let (progress_tx, progress_rx) = progress_channel();
        Self {
            queue,
            fingerprints,
            inflight: Arc::new(InflightRegistry::new()),
            governor,
            locator,
            transcoder,
            dispatcher,
            router,
            notifier,
            config,
            download_dir,
            progress_tx,
            progress_rx: parking_lot::Mutex::new(Some(progress_rx)),
        }
    }

    /// Spawn the workers and the progress pump. Tasks run until
    /// `cancel_token` fires; join the returned set to drain them.
    pub fn spawn(self: &Arc<Self>, cancel_token: CancellationToken) -> JoinSet<()> {
        let mut tasks = JoinSet::new();

        if let Some(rx) = self.progress_rx.lock().take() {
            let pool = self.clone();
            let cancel = cancel_token.clone();
            tasks.spawn(async move { pool.progress_pump(rx, cancel).await });
        }

        let worker_count = self.governor.config().max_workers;
        info!(worker_count, "Starting worker pool");
        for index in 0..worker_count {
            let pool = self.clone();
            let cancel = cancel_token.clone();
            tasks.spawn(async move { pool.worker_loop(index, cancel).await });
        }
        tasks
    }

    async fn progress_pump(
        &self,
        mut rx: mpsc::Receiver<ProgressUpdate>,
        cancel_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                update = rx.recv() => {
                    let Some(update) = update else { break };
                    if self.notifier.should_emit(&update.job_id, tokio::time::Instant::now().into_std()) {
                        let line = ProgressNotifier::format(&update.state);
                        self.router.send_progress(update.requester_id, &line).await;
                    }
                }
            }
        }
    }

    async fn worker_loop(&self, index: usize, cancel_token: CancellationToken) {
        let worker_id = format!("worker-{index}");
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(10));
        debug!(%worker_id, "Worker started");

        loop {
            if cancel_token.is_cancelled() {
                break;
            }

            // Admission control: the governor shrinks the limit under CPU
            // pressure; workers past the limit park instead of claiming.
            if index >= self.governor.current_limit() {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = tokio::time::sleep(poll) => continue,
                }
            }

            match self.queue.claim(&worker_id).await {
                Ok(Some(job)) => {
                    if let Err(e) = self.process_job(&worker_id, job, &cancel_token).await {
                        if e.is_fatal() {
                            error!(%worker_id, "Store unavailable, shutting down: {e}");
                            cancel_token.cancel();
                            break;
                        }
                        warn!(%worker_id, "Job processing error: {e}");
                    }
                }
                Ok(None) => {
                    let notified = self.queue.notifier();
                    tokio::select! {
                        _ = cancel_token.cancelled() => break,
                        _ = notified.notified() => {}
                        _ = tokio::time::sleep(poll) => {}
                    }
                }
                Err(e) => {
                    if e.is_fatal() {
                        error!(%worker_id, "Store unavailable, shutting down: {e}");
                        cancel_token.cancel();
                        break;
                    }
                    warn!(%worker_id, "Claim failed: {e}");
                    tokio::time::sleep(poll).await;
                }
            }
        }
        debug!(%worker_id, "Worker stopped");
    }

    async fn process_job(
        &self,
        worker_id: &str,
        job: Job,
        cancel_token: &CancellationToken,
    ) -> Result<()> {
        // Duplicate already completed: relay the recorded reference, no work.
        if let Some(entry) = self.fingerprints.get(&job.fingerprint).await? {
            debug!(job_id = %job.id, "Fingerprint already recorded, relaying existing result");
            let result_ref = ResultRef::new(entry.result_ref);
            if let Err(e) = self.router.relay_result(job.requester_id, &result_ref).await {
                warn!(job_id = %job.id, "Relay of existing result failed: {e}");
                self.requeue_with_waiters(&job, &[], "relay failed").await?;
                return Ok(());
            }
            self.queue.ack(&job.id).await?;
            return Ok(());
        }

        // Duplicate currently in flight: enlist as a waiter and ack.
        let guard = match self.inflight.try_begin(&job) {
            BeginOutcome::Primary(guard) => guard,
            BeginOutcome::Enlisted => {
                debug!(job_id = %job.id, fingerprint = %job.fingerprint,
                    "Fingerprint in flight, enlisted as waiter");
                self.queue.ack(&job.id).await?;
                return Ok(());
            }
        };

        info!(%worker_id, job_id = %job.id, attempt = job.attempt_count,
            source = %job.source_url, "Processing job");

        let output_path = self.download_dir.join(format!("{}.mp4", job.id));
        let job_cancel = cancel_token.child_token();
        let ceiling = Duration::from_secs(self.config.job_timeout_secs);

        let outcome =
            tokio::time::timeout(ceiling, self.run_stages(&job, &output_path, &job_cancel)).await;

        // Exclusivity is released on every exit path below; finishing the
        // guard also drains waiters enlisted while we were running.
        let waiters = guard.finish();
        self.notifier.forget(&job.id);

        match outcome {
            Ok(Ok(result_ref)) => {
                let requesters = requester_fanout(&job, &waiters);
                if let Err(e) = self.router.relay_to_all(&requesters, &result_ref).await {
                    // The artifact is durable and the fingerprint recorded;
                    // a redelivery only retries the relay.
                    warn!(job_id = %job.id, "Relay failed, requeueing: {e}");
                    self.requeue_with_waiters(&job, &waiters, "relay failed").await?;
                    return Ok(());
                }
                self.queue.ack(&job.id).await?;
                info!(job_id = %job.id, %result_ref, "Job completed");
            }
            Ok(Err(FetchError::Transient(reason))) => {
                warn!(job_id = %job.id, %reason, "Transient failure");
                self.requeue_with_waiters(&job, &waiters, &reason).await?;
            }
            Ok(Err(FetchError::Permanent(reason))) => {
                warn!(job_id = %job.id, %reason, "Permanent failure, dead-lettering");
                self.queue.dead_letter(&job, &reason).await?;
                for requester in requester_fanout(&job, &waiters) {
                    self.router.report_failure(requester, &reason).await;
                }
            }
            Err(_) => {
                job_cancel.cancel();
                remove_quietly(&output_path).await;
                warn!(job_id = %job.id, ceiling_secs = self.config.job_timeout_secs,
                    "Job exceeded wall-clock ceiling, cancelled");
                self.requeue_with_waiters(&job, &waiters, "wall-clock ceiling exceeded")
                    .await?;
            }
        }
        Ok(())
    }

    async fn run_stages(
        &self,
        job: &Job,
        output_path: &std::path::Path,
        cancel: &CancellationToken,
    ) -> std::result::Result<ResultRef, FetchError> {
        let reporter = ProgressReporter::new(&job.id, job.requester_id, self.progress_tx.clone());
        reporter.report(ProgressState::new(ProgressPhase::Fetching));

        let location = self.locator.locate(&job.source_url).await?;

        let artifact = match self
            .transcoder
            .transcode(&location, output_path, &reporter, cancel)
            .await
        {
            Ok(artifact) => artifact,
            Err(e) => {
                remove_quietly(output_path).await;
                return Err(e);
            }
        };

        reporter.report(ProgressState {
            phase: ProgressPhase::Delivering,
            bytes_done: artifact.size_bytes,
            bytes_total: Some(artifact.size_bytes),
            rate: 0.0,
        });

        let stored = self.dispatcher.store(&artifact).await;
        remove_quietly(&artifact.path).await;
        let result_ref =
            stored.map_err(|e| FetchError::Transient(format!("delivery failed: {e}")))?;

        // Conditional write: if a racing redelivery won, its reference is
        // the canonical one and ours is discarded.
        match self
            .fingerprints
            .put_if_absent(&job.fingerprint, result_ref.as_str())
            .await
        {
            Ok(crate::pipeline::fingerprint::PutOutcome::Inserted) => Ok(result_ref),
            Ok(crate::pipeline::fingerprint::PutOutcome::AlreadyPresent { result_ref }) => {
                Ok(ResultRef::new(result_ref))
            }
            Err(e) => Err(FetchError::Transient(format!("fingerprint write failed: {e}"))),
        }
    }

    /// Requeue the primary job and put enlisted waiters back on the queue so
    /// their requesters are not lost. Dead-letters at the attempt ceiling.
    async fn requeue_with_waiters(
        &self,
        job: &Job,
        waiters: &[Job],
        reason: &str,
    ) -> Result<()> {
        match self.queue.requeue(job, reason).await? {
            RequeueOutcome::Requeued { attempt } => {
                debug!(job_id = %job.id, attempt, "Requeued");
            }
            RequeueOutcome::DeadLettered => {
                warn!(job_id = %job.id, "Attempt ceiling reached, dead-lettered");
                self.router.report_failure(job.requester_id, reason).await;
            }
        }
        for waiter in waiters {
            self.queue.enqueue(waiter).await?;
        }
        Ok(())
    }
}

/// Primary requester first, then enlisted waiters, deduplicated.
fn requester_fanout(job: &Job, waiters: &[Job]) -> Vec<i64> {
    let mut requesters = vec![job.requester_id];
    for waiter in waiters {
        if !requesters.contains(&waiter.requester_id) {
            requesters.push(waiter.requester_id);
        }
    }
    requesters
}

async fn remove_quietly(path: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), "Failed to remove scratch file: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fanout_leads_with_primary_and_dedups() {
        let job = Job::new("fp", "https://example.com/a", 10);
        let waiters = vec![
            Job::new("fp", "https://example.com/a", 20),
            Job::new("fp", "https://example.com/a", 10),
            Job::new("fp", "https://example.com/a", 30),
        ];
        assert_eq!(requester_fanout(&job, &waiters), vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn remove_quietly_ignores_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        remove_quietly(&dir.path().join("missing.mp4")).await;
    }
}
