//! Retry helpers for store operations.
//!
//! Transient store errors (busy database, lost connection) are retried with
//! exponential backoff and jitter. Once the ceiling is exhausted the error
//! becomes [`Error::StoreUnavailable`], which is fatal to the process:
//! silently dropping jobs is worse than a visible outage.

use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;

use rand::random;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::{Error, Result};

const STORE_MAX_RETRIES: u32 = 12;
const STORE_BASE_DELAY_MS: u64 = 10;
const STORE_MAX_DELAY_MS: u64 = 2000;

fn is_transient_store_error(err: &Error) -> bool {
    let Error::DatabaseSqlx(sqlx_err) = err else {
        return false;
    };

    match sqlx_err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(Cow::into_owned);
            if matches!(code.as_deref(), Some("5") | Some("6")) {
                return true;
            }
            let msg = db_err.message().to_ascii_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        other => {
            let msg = other.to_string().to_ascii_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
    }
}

/// Run a store operation, retrying transient failures with backoff.
///
/// Fails closed: after `STORE_MAX_RETRIES` the caller gets
/// [`Error::StoreUnavailable`].
pub async fn with_store_retry<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !is_transient_store_error(&err) => return Err(err),
            Err(err) => {
                if attempt >= STORE_MAX_RETRIES {
                    warn!("Store unavailable during {op_name}: {err}");
                    return Err(Error::StoreUnavailable {
                        attempts: attempt,
                        message: err.to_string(),
                    });
                }

                let exp_ms = STORE_BASE_DELAY_MS.saturating_mul(1u64 << attempt.min(20));
                let capped_ms = exp_ms.min(STORE_MAX_DELAY_MS);
                let jitter_ms = random::<u64>() % (capped_ms / 4 + 1);
                let delay = Duration::from_millis((capped_ms + jitter_ms).min(STORE_MAX_DELAY_MS));

                debug!(
                    "Transient store error during {}, retrying in {:?} (attempt {}/{})",
                    op_name,
                    delay,
                    attempt + 1,
                    STORE_MAX_RETRIES
                );

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
