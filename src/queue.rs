//! Atomic claim-and-mark protocol over the Postgres queue table
//!
//! The claim is a single statement with `FOR UPDATE SKIP LOCKED`, so K
//! concurrent workers never receive overlapping row sets and never block
//! each other on contended rows. The earlier two-transaction
//! select-then-update shape admitted exactly that race.
//!
//! Expected table shape (names indicative, managed outside this crate):
//!
//! ```sql
//! CREATE TABLE creative_queue (
//!     id               BIGSERIAL PRIMARY KEY,
//!     creative_id      TEXT NOT NULL,
//!     advertiser_id    TEXT NOT NULL,
//!     status           TEXT NOT NULL DEFAULT 'pending',
//!     video_ids        JSONB,
//!     appstore_id      TEXT,
//!     funded_by        TEXT,
//!     real_creative_id TEXT,
//!     scraped_at       TIMESTAMPTZ,
//!     error_message    TEXT,
//!     updated_at       TIMESTAMPTZ NOT NULL DEFAULT now()
//! );
//! CREATE INDEX creative_queue_status_idx ON creative_queue (status, id);
//! ```

use anyhow::{Context, Result};
use log::{info, warn};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

use crate::classify::{
    ErrorCategory, PENDING_RETRY_SUFFIX, PERMANENT_PREFIX, classify,
};
use crate::session::ItemOutcome;

/// One claimed row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueueEntry {
    pub id: i64,
    pub creative_id: String,
    pub advertiser_id: String,
}

/// Terminal state a result write produced, for counter accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDisposition {
    Completed,
    Retry,
    BadAd,
    Failed,
}

const CLAIM_SQL: &str = r"
WITH selected AS (
    SELECT id FROM creative_queue
    WHERE status = 'pending'
    ORDER BY id
    LIMIT $1
    FOR UPDATE SKIP LOCKED
)
UPDATE creative_queue SET status = 'processing', updated_at = now()
FROM selected WHERE creative_queue.id = selected.id
RETURNING creative_queue.id, creative_queue.creative_id, creative_queue.advertiser_id
";

/// Handle to the queue table.
#[derive(Clone)]
pub struct QueueStore {
    pool: PgPool,
}

impl QueueStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .context("connecting to queue database")?;
        Ok(Self { pool })
    }

    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool, for test harnesses and ad-hoc queries.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Atomically claim up to `n` pending rows, marking them
    /// `processing`. Rows locked by other claimers are skipped, never
    /// waited on.
    pub async fn claim_batch(&self, n: i64) -> Result<Vec<QueueEntry>> {
        sqlx::query_as::<_, QueueEntry>(CLAIM_SQL)
            .bind(n)
            .fetch_all(&self.pool)
            .await
            .context("claiming batch")
    }

    /// Write one item result in its own short transaction. Idempotent:
    /// re-writing the same outcome reproduces the same row state.
    pub async fn write_result(&self, id: i64, outcome: &ItemOutcome) -> Result<WriteDisposition> {
        let (disposition, message) = disposition_for(outcome);
        match disposition {
            WriteDisposition::Completed => {
                sqlx::query(
                    "UPDATE creative_queue
                     SET status = 'completed', video_ids = $2, appstore_id = $3,
                         funded_by = $4, real_creative_id = $5,
                         scraped_at = now(), error_message = NULL, updated_at = now()
                     WHERE id = $1",
                )
                .bind(id)
                .bind(serde_json::json!(outcome.videos))
                .bind(&outcome.app_store_id)
                .bind(&outcome.funded_by)
                .bind(&outcome.real_creative_id)
                .execute(&self.pool)
                .await
                .with_context(|| format!("writing completed result for row {id}"))?;
            }
            WriteDisposition::Retry => {
                self.set_status(id, "pending", message.as_deref()).await?;
            }
            WriteDisposition::BadAd => {
                self.set_status(id, "bad_ad", message.as_deref()).await?;
            }
            WriteDisposition::Failed => {
                self.set_status(id, "failed", message.as_deref()).await?;
            }
        }
        Ok(disposition)
    }

    /// Return a row to `pending` with an explicit message (used for
    /// missing-result bookkeeping).
    pub async fn mark_pending(&self, id: i64, message: &str) -> Result<()> {
        self.set_status(id, "pending", Some(message)).await
    }

    /// Sweeper: rows stuck in `processing` longer than `older_than` go
    /// back to `pending`. Safety net for worker crashes; a clean run
    /// leaves nothing for it to find.
    pub async fn release_stuck(&self, older_than: Duration) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE creative_queue
             SET status = 'pending',
                 error_message = 'released by sweeper after stuck processing',
                 updated_at = now()
             WHERE status = 'processing'
               AND updated_at < now() - make_interval(secs => $1)",
        )
        .bind(older_than.as_secs_f64())
        .execute(&self.pool)
        .await
        .context("releasing stuck rows")?;
        let released = result.rows_affected();
        if released > 0 {
            warn!("sweeper released {released} stuck rows back to pending");
        }
        Ok(released)
    }

    /// Row counts per status, for the shutdown summary.
    pub async fn status_counts(&self) -> Result<Vec<(String, i64)>> {
        sqlx::query_as::<_, (String, i64)>(
            "SELECT status, count(*) FROM creative_queue GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await
        .context("counting queue statuses")
    }

    async fn set_status(&self, id: i64, status: &str, message: Option<&str>) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE creative_queue
             SET status = $2, error_message = $3, updated_at = now()
             WHERE id = $1",
        )
        .bind(id)
        .bind(status)
        .bind(message)
        .execute(&self.pool)
        .await
        .with_context(|| format!("setting row {id} to {status}"))?;
        if updated.rows_affected() == 0 {
            info!("row {id} vanished before status write ({status})");
        }
        Ok(())
    }
}

/// Map a result record to its terminal state and annotated message.
/// Pure so the mapping is testable without a database.
#[must_use]
pub fn disposition_for(outcome: &ItemOutcome) -> (WriteDisposition, Option<String>) {
    if outcome.success {
        return (WriteDisposition::Completed, None);
    }
    let message = outcome.error.clone().unwrap_or_else(|| "unknown error".to_string());
    match classify(&message).category {
        ErrorCategory::Retry => (
            WriteDisposition::Retry,
            Some(format!("{message}{PENDING_RETRY_SUFFIX}")),
        ),
        ErrorCategory::BadAd => (WriteDisposition::BadAd, Some(message)),
        ErrorCategory::Failed => (
            WriteDisposition::Failed,
            Some(format!("{PERMANENT_PREFIX}{message}")),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::BAD_AD_MESSAGE;

    #[test]
    fn success_completes_without_message() {
        let outcome = ItemOutcome {
            success: true,
            videos: vec!["rkXH2aDmhDQ".to_string()],
            app_store_id: None,
            funded_by: None,
            real_creative_id: Some("111122223333".to_string()),
            method: None,
            error: None,
        };
        assert_eq!(disposition_for(&outcome), (WriteDisposition::Completed, None));
    }

    #[test]
    fn transient_error_goes_back_to_pending_annotated() {
        let outcome = ItemOutcome::failure("Expected 3 script bodies but none received");
        let (disposition, message) = disposition_for(&outcome);
        assert_eq!(disposition, WriteDisposition::Retry);
        let message = message.expect("retry carries a message");
        assert!(message.ends_with(" - pending retry"), "got: {message}");
    }

    #[test]
    fn bad_ad_keeps_message_unannotated() {
        let outcome = ItemOutcome::failure(BAD_AD_MESSAGE);
        let (disposition, message) = disposition_for(&outcome);
        assert_eq!(disposition, WriteDisposition::BadAd);
        assert_eq!(message.as_deref(), Some(BAD_AD_MESSAGE));
    }

    #[test]
    fn permanent_error_gets_prefix() {
        let outcome = ItemOutcome::failure("unexpected JSON schema at field 5");
        let (disposition, message) = disposition_for(&outcome);
        assert_eq!(disposition, WriteDisposition::Failed);
        assert_eq!(
            message.as_deref(),
            Some("PERMANENT ERROR: unexpected JSON schema at field 5")
        );
    }
}
