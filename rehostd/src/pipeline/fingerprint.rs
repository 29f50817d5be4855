//! Duplicate suppression: request fingerprints, the durable fingerprint
//! store, and the per-fingerprint exclusivity registry.
//!
//! The store is write-once per key via a conditional insert, so even a racing
//! second writer cannot produce two entries; within the process the
//! [`InflightRegistry`] is what guarantees at most one worker produces side
//! effects for a fingerprint, with duplicate jobs enlisted as waiters and
//! relayed the winner's result.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::job_queue::Job;
use crate::database::DbPool;
use crate::database::retry::with_store_retry;
use crate::Result;

/// Deterministic fingerprint of a request locator: SHA-256 over the trimmed
/// URL, hex encoded.
pub fn fingerprint(source_url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_url.trim().as_bytes());
    hex::encode(hasher.finalize())
}

/// A completed-result reference for a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintEntry {
    pub fingerprint: String,
    pub result_ref: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a conditional fingerprint write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// This writer created the entry.
    Inserted,
    /// Another writer got there first; their reference is returned.
    AlreadyPresent { result_ref: String },
}

/// Durable fingerprint → result_ref lookup.
#[async_trait]
pub trait FingerprintStore: Send + Sync {
    async fn get(&self, fingerprint: &str) -> Result<Option<FingerprintEntry>>;
    /// Create-if-absent. Never overwrites an existing entry.
    async fn put_if_absent(&self, fingerprint: &str, result_ref: &str) -> Result<PutOutcome>;
}

/// SQLx implementation of [`FingerprintStore`].
pub struct SqlxFingerprintStore {
    pool: DbPool,
}

impl SqlxFingerprintStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FingerprintStore for SqlxFingerprintStore {
    async fn get(&self, fingerprint: &str) -> Result<Option<FingerprintEntry>> {
        let row: Option<(String, String)> = with_store_retry("fingerprint get", || async {
            Ok(sqlx::query_as(
                "SELECT result_ref, created_at FROM fingerprint_entry WHERE fingerprint = ?",
            )
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .await?)
        })
        .await?;

        Ok(row.map(|(result_ref, created_at)| FingerprintEntry {
            fingerprint: fingerprint.to_string(),
            result_ref,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        }))
    }

    async fn put_if_absent(&self, fingerprint: &str, result_ref: &str) -> Result<PutOutcome> {
        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let inserted = with_store_retry("fingerprint put", || async {
            let result = sqlx::query(
                r#"
                INSERT INTO fingerprint_entry (fingerprint, result_ref, created_at)
                VALUES (?, ?, ?)
                ON CONFLICT (fingerprint) DO NOTHING
                "#,
            )
            .bind(fingerprint)
            .bind(result_ref)
            .bind(&created_at)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await?;

        if inserted {
            debug!(fingerprint, result_ref, "Fingerprint entry created");
            return Ok(PutOutcome::Inserted);
        }

        // Lost a race: surface the winning reference.
        let existing = self.get(fingerprint).await?.map(|e| e.result_ref).ok_or_else(|| {
            crate::Error::not_found("FingerprintEntry", fingerprint)
        })?;
        Ok(PutOutcome::AlreadyPresent { result_ref: existing })
    }
}

/// Outcome of attempting to start work on a fingerprint.
pub enum BeginOutcome {
    /// This worker owns the fingerprint; side effects are allowed.
    Primary(InflightGuard),
    /// Another worker is already processing it; the job was enlisted as a
    /// waiter and will be relayed the primary's result.
    Enlisted,
}

/// In-process per-fingerprint exclusivity with duplicate waiters.
///
/// Single-process deployments rely on this registry for exactly-once side
/// effects; across processes the store's conditional write is the backstop.
#[derive(Default)]
pub struct InflightRegistry {
    inflight: DashMap<String, Vec<Job>>,
}

impl InflightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically either acquire the fingerprint or enlist `job` behind the
    /// current owner.
    pub fn try_begin(self: &Arc<Self>, job: &Job) -> BeginOutcome {
        match self.inflight.entry(job.fingerprint.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(Vec::new());
                BeginOutcome::Primary(InflightGuard {
                    registry: self.clone(),
                    fingerprint: job.fingerprint.clone(),
                    released: false,
                })
            }
            Entry::Occupied(mut entry) => {
                entry.get_mut().push(job.clone());
                BeginOutcome::Enlisted
            }
        }
    }

    pub fn is_inflight(&self, fingerprint: &str) -> bool {
        self.inflight.contains_key(fingerprint)
    }

    fn release(&self, fingerprint: &str) -> Vec<Job> {
        self.inflight
            .remove(fingerprint)
            .map(|(_, waiters)| waiters)
            .unwrap_or_default()
    }
}

/// RAII ownership of a fingerprint. Released on every exit path; call
/// [`InflightGuard::finish`] to also collect the enlisted duplicate jobs so
/// their requesters can be notified of the outcome.
pub struct InflightGuard {
    registry: Arc<InflightRegistry>,
    fingerprint: String,
    released: bool,
}

impl InflightGuard {
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Release the lock and take the waiters enlisted while it was held.
    pub fn finish(mut self) -> Vec<Job> {
        self.released = true;
        self.registry.release(&self.fingerprint)
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        if !self.released {
            self.registry.release(&self.fingerprint);
        }
    }
}
