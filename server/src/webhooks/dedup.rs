//! Webhook Event Deduplication
//!
//! Remembers platform delivery identifiers so redeliveries are acknowledged
//! without re-running side effects. A record is first *claimed* by a single
//! conditional insert, then finalized once the event is stored. A claim that
//! is never finalized (crash mid-ingestion) can be re-taken after
//! [`CLAIM_TTL`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fred::prelude::*;
use fred::types::{Expiration, SetOptions};
use sqlx::PgPool;
use thiserror::Error;
use tracing::{error, info};

/// How long an unfinalized claim blocks other deliveries of the same id.
pub const CLAIM_TTL: Duration = Duration::from_secs(60);

/// Interval between retention sweeps.
const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

/// Redis key prefix for processed-event records.
const REDIS_KEY_PREFIX: &str = "webhook:processed:";

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Deduplication backend errors.
#[derive(Debug, Error)]
pub enum DedupError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Redis error: {0}")]
    Redis(#[from] fred::error::Error),
}

/// Tracks processed webhook delivery identifiers.
#[async_trait]
pub trait EventDeduplicator: Send + Sync {
    /// Atomically claim `delivery_id`. Returns `false` if it was already
    /// processed or is being processed by a concurrent delivery.
    async fn should_process(&self, delivery_id: &str) -> Result<bool, DedupError>;

    /// Finalize a claim after the event's side effects are committed.
    async fn mark_processed(&self, delivery_id: &str) -> Result<(), DedupError>;

    /// Drop an unfinalized claim so a redelivery is processed again.
    async fn release(&self, delivery_id: &str) -> Result<(), DedupError>;

    /// Remove records older than the retention window. Returns rows removed.
    async fn prune(&self, retention_days: u32) -> Result<u64, DedupError>;
}

// ============================================================================
// PostgreSQL
// ============================================================================

/// Deduplicator backed by the `processed_events` table.
#[derive(Clone)]
pub struct PgEventDeduplicator {
    pool: PgPool,
}

impl PgEventDeduplicator {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventDeduplicator for PgEventDeduplicator {
    async fn should_process(&self, delivery_id: &str) -> Result<bool, DedupError> {
        // Uniqueness on delivery_id makes check-and-claim a single statement.
        let row: Option<(String,)> = sqlx::query_as(
            r"
            INSERT INTO processed_events (delivery_id)
            VALUES ($1)
            ON CONFLICT (delivery_id) DO UPDATE SET claimed_at = NOW()
                WHERE processed_events.processed_at IS NULL
                  AND processed_events.claimed_at < NOW() - make_interval(secs => $2)
            RETURNING delivery_id
            ",
        )
        .bind(delivery_id)
        .bind(CLAIM_TTL.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn mark_processed(&self, delivery_id: &str) -> Result<(), DedupError> {
        sqlx::query("UPDATE processed_events SET processed_at = NOW() WHERE delivery_id = $1")
            .bind(delivery_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release(&self, delivery_id: &str) -> Result<(), DedupError> {
        sqlx::query("DELETE FROM processed_events WHERE delivery_id = $1 AND processed_at IS NULL")
            .bind(delivery_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn prune(&self, retention_days: u32) -> Result<u64, DedupError> {
        let result = sqlx::query(
            "DELETE FROM processed_events WHERE claimed_at < NOW() - make_interval(days => $1)",
        )
        .bind(retention_days as i32)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

// ============================================================================
// Redis
// ============================================================================

/// Deduplicator backed by Redis keys with expiry; retention is the key TTL.
#[derive(Clone)]
pub struct RedisEventDeduplicator {
    redis: Client,
    retention: Duration,
}

impl RedisEventDeduplicator {
    #[must_use]
    pub fn new(redis: Client, retention_days: u32) -> Self {
        Self {
            redis,
            retention: Duration::from_secs(u64::from(retention_days) * SECS_PER_DAY),
        }
    }

    fn key(delivery_id: &str) -> String {
        format!("{REDIS_KEY_PREFIX}{delivery_id}")
    }
}

#[async_trait]
impl EventDeduplicator for RedisEventDeduplicator {
    async fn should_process(&self, delivery_id: &str) -> Result<bool, DedupError> {
        let set: Option<String> = self
            .redis
            .set(
                Self::key(delivery_id),
                "claimed",
                Some(Expiration::EX(CLAIM_TTL.as_secs() as i64)),
                Some(SetOptions::NX),
                false,
            )
            .await?;
        Ok(set.is_some())
    }

    async fn mark_processed(&self, delivery_id: &str) -> Result<(), DedupError> {
        self.redis
            .set::<(), _, _>(
                Self::key(delivery_id),
                "done",
                Some(Expiration::EX(self.retention.as_secs() as i64)),
                None,
                false,
            )
            .await?;
        Ok(())
    }

    async fn release(&self, delivery_id: &str) -> Result<(), DedupError> {
        self.redis.del::<i64, _>(Self::key(delivery_id)).await?;
        Ok(())
    }

    async fn prune(&self, _retention_days: u32) -> Result<u64, DedupError> {
        Ok(0)
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct MemoryRecord {
    processed: bool,
    claimed_at: Instant,
}

/// Deduplicator held in process memory (tests, local runs).
#[derive(Debug)]
pub struct MemoryEventDeduplicator {
    records: DashMap<String, MemoryRecord>,
    claim_ttl: Duration,
}

impl Default for MemoryEventDeduplicator {
    fn default() -> Self {
        Self::with_claim_ttl(CLAIM_TTL)
    }
}

impl MemoryEventDeduplicator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_claim_ttl(claim_ttl: Duration) -> Self {
        Self {
            records: DashMap::new(),
            claim_ttl,
        }
    }

    /// Number of delivery identifiers currently remembered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl EventDeduplicator for MemoryEventDeduplicator {
    async fn should_process(&self, delivery_id: &str) -> Result<bool, DedupError> {
        let claimed = match self.records.entry(delivery_id.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(MemoryRecord {
                    processed: false,
                    claimed_at: Instant::now(),
                });
                true
            }
            Entry::Occupied(mut slot) => {
                let record = slot.get_mut();
                if !record.processed && record.claimed_at.elapsed() >= self.claim_ttl {
                    record.claimed_at = Instant::now();
                    true
                } else {
                    false
                }
            }
        };
        Ok(claimed)
    }

    async fn mark_processed(&self, delivery_id: &str) -> Result<(), DedupError> {
        if let Some(mut record) = self.records.get_mut(delivery_id) {
            record.processed = true;
        }
        Ok(())
    }

    async fn release(&self, delivery_id: &str) -> Result<(), DedupError> {
        self.records.remove_if(delivery_id, |_, record| !record.processed);
        Ok(())
    }

    async fn prune(&self, retention_days: u32) -> Result<u64, DedupError> {
        let retention = Duration::from_secs(u64::from(retention_days) * SECS_PER_DAY);
        let before = self.records.len();
        self.records
            .retain(|_, record| record.claimed_at.elapsed() < retention);
        Ok((before - self.records.len()) as u64)
    }
}

/// Spawn the hourly retention sweep for processed-event records.
pub fn spawn_retention_task(dedup: Arc<dyn EventDeduplicator>, retention_days: u32) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PRUNE_INTERVAL);
        loop {
            interval.tick().await;
            match dedup.prune(retention_days).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "Pruned processed webhook events"),
                Err(e) => error!(error = %e, "Failed to prune processed webhook events"),
            }
        }
    });
}


#[cfg(test)]
mod postgres_tests {
    use sqlx::PgPool;

    use super::*;

    async fn backdate(pool: &PgPool, delivery_id: &str, column: &str, secs: f64) {
        sqlx::query(&format!(
            "UPDATE processed_events SET {column} = NOW() - make_interval(secs => $2) WHERE delivery_id = $1"
        ))
        .bind(delivery_id)
        .bind(secs)
        .execute(pool)
        .await
        .expect("Failed to backdate record");
    }

    #[sqlx::test]
    #[ignore = "Requires PostgreSQL"]
    async fn test_concurrent_claims_admit_one(pool: PgPool) {
        let dedup = PgEventDeduplicator::new(pool);

        let claims = futures::future::join_all((0..8).map(|_| {
            let dedup = dedup.clone();
            async move { dedup.should_process("m_concurrent").await.unwrap() }
        }))
        .await;

        assert_eq!(claims.iter().filter(|claimed| **claimed).count(), 1);
    }

    #[sqlx::test]
    #[ignore = "Requires PostgreSQL"]
    async fn test_processed_record_is_never_reclaimed(pool: PgPool) {
        let dedup = PgEventDeduplicator::new(pool.clone());
        assert!(dedup.should_process("m1").await.unwrap());
        dedup.mark_processed("m1").await.unwrap();

        backdate(&pool, "m1", "claimed_at", 3_600.0).await;
        assert!(!dedup.should_process("m1").await.unwrap());

        // Release only drops unfinalized claims.
        dedup.release("m1").await.unwrap();
        assert!(!dedup.should_process("m1").await.unwrap());
    }

    #[sqlx::test]
    #[ignore = "Requires PostgreSQL"]
    async fn test_stale_claim_can_be_retaken(pool: PgPool) {
        let dedup = PgEventDeduplicator::new(pool.clone());
        assert!(dedup.should_process("m1").await.unwrap());
        assert!(!dedup.should_process("m1").await.unwrap());

        backdate(&pool, "m1", "claimed_at", CLAIM_TTL.as_secs_f64() + 5.0).await;
        assert!(dedup.should_process("m1").await.unwrap());
        assert!(!dedup.should_process("m1").await.unwrap());
    }

    #[sqlx::test]
    #[ignore = "Requires PostgreSQL"]
    async fn test_released_claim_is_processed_again(pool: PgPool) {
        let dedup = PgEventDeduplicator::new(pool);
        assert!(dedup.should_process("m1").await.unwrap());
        dedup.release("m1").await.unwrap();
        assert!(dedup.should_process("m1").await.unwrap());
    }

    #[sqlx::test]
    #[ignore = "Requires PostgreSQL"]
    async fn test_prune_keeps_recent_records(pool: PgPool) {
        let dedup = PgEventDeduplicator::new(pool.clone());
        for id in ["old", "recent"] {
            assert!(dedup.should_process(id).await.unwrap());
            dedup.mark_processed(id).await.unwrap();
        }
        backdate(&pool, "old", "claimed_at", 10.0 * SECS_PER_DAY as f64).await;

        assert_eq!(dedup.prune(7).await.unwrap(), 1);
        assert!(!dedup.should_process("recent").await.unwrap());

        let (remaining,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM processed_events")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(remaining, 1);
    }
}
