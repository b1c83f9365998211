//! Queue transport.
//!
//! Stages talk to named queues through the [`Queue`] trait. Delivery is
//! at-least-once: a received message stays leased (invisible) until the
//! consumer deletes it with the pop receipt it was handed, and becomes
//! receivable again if the lease expires first.
//!
//! - [`SqliteQueue`] is the durable transport. Every queue is a set of rows
//!   in `queue_messages`; receive is a single conditional UPDATE so two
//!   workers can never lease the same message.
//! - [`MemoryQueue`] keeps messages in process and records every send with
//!   its delay. It ignores visibility delays and is meant for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// A leased message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub id: String,
    pub pop_receipt: String,
    pub body: String,
    /// Number of times this message has been received, including this one.
    pub dequeue_count: u32,
}

#[async_trait]
pub trait Queue: Send + Sync {
    /// Enqueue `body`, receivable after `delay_secs`.
    async fn send(&self, queue: &str, body: &str, delay_secs: u64) -> Result<()>;

    /// Lease the next visible message for `lease_secs`.
    async fn receive(&self, queue: &str, lease_secs: u64) -> Result<Option<ReceivedMessage>>;

    /// Remove a leased message. A stale receipt is an error.
    async fn delete(&self, queue: &str, message: &ReceivedMessage) -> Result<()>;

    /// Messages currently stored in `queue`, visible or not.
    async fn depth(&self, queue: &str) -> Result<i64>;
}

/// Name of the quarantine queue for `queue`.
pub fn poison_queue_name(queue: &str) -> String {
    format!("{}-poison", queue)
}

pub struct SqliteQueue {
    pool: SqlitePool,
}

impl SqliteQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Queue names with their depth, for `docflow stats`.
    pub async fn depths(&self) -> Result<Vec<(String, i64)>> {
        let rows = sqlx::query(
            "SELECT queue, COUNT(*) AS n FROM queue_messages GROUP BY queue ORDER BY queue",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get("queue"), row.get("n")))
            .collect())
    }
}

fn secs_to_millis(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1000)).unwrap_or(i64::MAX)
}

#[async_trait]
impl Queue for SqliteQueue {
    async fn send(&self, queue: &str, body: &str, delay_secs: u64) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO queue_messages (id, queue, body, enqueued_at, visible_at, dequeue_count)
            VALUES (?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(queue)
        .bind(body)
        .bind(now)
        .bind(now.saturating_add(secs_to_millis(delay_secs)))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn receive(&self, queue: &str, lease_secs: u64) -> Result<Option<ReceivedMessage>> {
        let now = Utc::now().timestamp_millis();
        let receipt = Uuid::new_v4().to_string();
        let row = sqlx::query(
            r#"
            UPDATE queue_messages
            SET visible_at = ?, dequeue_count = dequeue_count + 1, pop_receipt = ?
            WHERE id = (
                SELECT id FROM queue_messages
                WHERE queue = ? AND visible_at <= ?
                ORDER BY visible_at, enqueued_at
                LIMIT 1
            )
            RETURNING id, body, dequeue_count
            "#,
        )
        .bind(now.saturating_add(secs_to_millis(lease_secs)))
        .bind(&receipt)
        .bind(queue)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| ReceivedMessage {
            id: row.get("id"),
            pop_receipt: receipt,
            body: row.get("body"),
            dequeue_count: u32::try_from(row.get::<i64, _>("dequeue_count")).unwrap_or(u32::MAX),
        }))
    }

    async fn delete(&self, queue: &str, message: &ReceivedMessage) -> Result<()> {
        let result =
            sqlx::query("DELETE FROM queue_messages WHERE id = ? AND queue = ? AND pop_receipt = ?")
                .bind(&message.id)
                .bind(queue)
                .bind(&message.pop_receipt)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(anyhow!(
                "message {} on {} was re-leased before delete",
                message.id,
                queue
            ));
        }
        Ok(())
    }

    async fn depth(&self, queue: &str) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_messages WHERE queue = ?")
            .bind(queue)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}

/// A send recorded by [`MemoryQueue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub body: String,
    pub delay_secs: u64,
}

#[derive(Default)]
struct MemoryState {
    ready: HashMap<String, VecDeque<(String, String, u32)>>,
    /// pop receipt -> (queue, id, body, dequeue count)
    leased: HashMap<String, (String, String, String, u32)>,
    sent: HashMap<String, Vec<SentMessage>>,
}

/// In-process queue for tests.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<MemoryState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("memory queue lock poisoned"))
    }

    /// Every message ever sent to `queue`, in order.
    pub fn sent(&self, queue: &str) -> Vec<SentMessage> {
        self.lock()
            .ok()
            .and_then(|s| s.sent.get(queue).cloned())
            .unwrap_or_default()
    }

    /// Remove and return every message waiting in `queue`.
    pub fn drain(&self, queue: &str) -> Vec<String> {
        self.lock()
            .ok()
            .and_then(|mut s| s.ready.remove(queue))
            .map(|q| q.into_iter().map(|(_, body, _)| body).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn send(&self, queue: &str, body: &str, delay_secs: u64) -> Result<()> {
        let mut state = self.lock()?;
        state
            .ready
            .entry(queue.to_string())
            .or_default()
            .push_back((Uuid::new_v4().to_string(), body.to_string(), 0));
        state
            .sent
            .entry(queue.to_string())
            .or_default()
            .push(SentMessage {
                body: body.to_string(),
                delay_secs,
            });
        Ok(())
    }

    async fn receive(&self, queue: &str, _lease_secs: u64) -> Result<Option<ReceivedMessage>> {
        let mut state = self.lock()?;
        let Some((id, body, count)) = state.ready.get_mut(queue).and_then(|q| q.pop_front()) else {
            return Ok(None);
        };
        let receipt = Uuid::new_v4().to_string();
        let count = count + 1;
        state.leased.insert(
            receipt.clone(),
            (queue.to_string(), id.clone(), body.clone(), count),
        );
        Ok(Some(ReceivedMessage {
            id,
            pop_receipt: receipt,
            body,
            dequeue_count: count,
        }))
    }

    async fn delete(&self, _queue: &str, message: &ReceivedMessage) -> Result<()> {
        let mut state = self.lock()?;
        state
            .leased
            .remove(&message.pop_receipt)
            .map(|_| ())
            .ok_or_else(|| anyhow!("unknown pop receipt for message {}", message.id))
    }

    async fn depth(&self, queue: &str) -> Result<i64> {
        let state = self.lock()?;
        Ok(state.ready.get(queue).map(|q| q.len() as i64).unwrap_or(0))
    }
}

impl MemoryQueue {
    /// Return every leased message to its queue, as if leases expired.
    pub fn expire_leases(&self, queue: &str) {
        if let Ok(mut state) = self.lock() {
            let receipts: Vec<String> = state
                .leased
                .iter()
                .filter(|(_, (q, ..))| q == queue)
                .map(|(receipt, _)| receipt.clone())
                .collect();
            for receipt in receipts {
                if let Some((_, id, body, count)) = state.leased.remove(&receipt) {
                    state
                        .ready
                        .entry(queue.to_string())
                        .or_default()
                        .push_back((id, body, count));
                }
            }
        }
    }
}
