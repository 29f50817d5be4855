//! Job pipeline: durable queue, duplicate suppression, adaptive concurrency,
//! progress plumbing, and the worker pool that drives a claimed job through
//! fetch → transcode → deliver.

pub mod fingerprint;
pub mod governor;
pub mod job_queue;
pub mod notifier;
pub mod progress;
pub mod worker_pool;

pub use fingerprint::{
    BeginOutcome, FingerprintStore, InflightRegistry, PutOutcome, SqlxFingerprintStore,
    fingerprint,
};
pub use governor::{ConcurrencyGovernor, GovernorConfig, GovernorEvent, GovernorState};
pub use job_queue::{Job, JobQueue, JobQueueConfig, JobStore, RequeueOutcome, SqlxJobStore};
pub use notifier::{NotifierConfig, ProgressNotifier};
pub use progress::{ProgressPhase, ProgressReporter, ProgressState, ProgressUpdate};
pub use worker_pool::{WorkerPool, WorkerPoolConfig};
