/// Persistent retransmit queue with exponential backoff.
///
/// One row per undelivered chunk-send. A row starts at `attempt = 1`,
/// due `base_backoff` after the first failure. Each failed retry bumps
/// `attempt` and reschedules it `base * multiplier^(attempt - 1)` later;
/// once `attempt` would exceed `max_retries` the row is dropped.
use std::time::Duration;

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use arc_transport::Packet;

use crate::store::Db;
use crate::ArcProtocolError;

pub fn create_send_queue_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS send_queue (
            id TEXT PRIMARY KEY,
            pkt_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            attempt INTEGER NOT NULL,
            next_retry INTEGER NOT NULL,
            payload BLOB NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_send_queue_next_retry ON send_queue(next_retry)",
        [],
    )?;
    Ok(())
}

// ── Backoff policy ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base_backoff: Duration,
    pub multiplier: f64,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            max_retries: 6,
        }
    }
}

impl BackoffPolicy {
    /// Wait before the retry that runs as `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        self.base_backoff.mul_f64(self.multiplier.powi(exponent))
    }

    fn delay_ms(&self, attempt: u32) -> u64 {
        self.delay_for(attempt).as_millis().min(u64::MAX as u128) as u64
    }
}

// ── Items ───────────────────────────────────────────────────────────

/// What a queue row replays: the exact chunk and its destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedSend {
    pub packet: Packet,
    pub dst_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub id: String,
    pub pkt_id: String,
    pub chunk_index: u32,
    pub attempt: u32,
    /// Unix ms.
    pub next_retry: u64,
    pub payload: QueuedSend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Rescheduled { attempt: u32, next_retry: u64 },
    /// Attempts exhausted; the row was deleted.
    Exhausted,
}

// ── Row operations ──────────────────────────────────────────────────

/// Insert a new row at `attempt = 1`, due `base_backoff` from `now_ms`.
pub fn enqueue(
    conn: &Connection,
    send: &QueuedSend,
    policy: &BackoffPolicy,
    now_ms: u64,
) -> Result<String, ArcProtocolError> {
    let id = uuid::Uuid::new_v4().simple().to_string();
    let blob = rmp_serde::to_vec(send)?;
    let next_retry = now_ms.saturating_add(policy.delay_ms(1));
    conn.execute(
        "INSERT INTO send_queue (id, pkt_id, chunk_index, attempt, next_retry, payload)
         VALUES (?1, ?2, ?3, 1, ?4, ?5)",
        params![
            id,
            send.packet.pkt_id,
            send.packet.chunk_index,
            next_retry as i64,
            blob
        ],
    )?;
    Ok(id)
}

/// Rows with `next_retry <= now_ms`, earliest first.
///
/// Rows whose payload no longer decodes are deleted and skipped.
pub fn due_items(conn: &Connection, now_ms: u64) -> Result<Vec<QueueItem>, ArcProtocolError> {
    let mut stmt = conn.prepare(
        "SELECT id, pkt_id, chunk_index, attempt, next_retry, payload
         FROM send_queue WHERE next_retry <= ?1
         ORDER BY next_retry, pkt_id, chunk_index",
    )?;
    let rows = stmt
        .query_map([now_ms as i64], |row| {
            let next_retry: i64 = row.get(4)?;
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, u32>(3)?,
                next_retry.max(0) as u64,
                row.get::<_, Vec<u8>>(5)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut items = Vec::with_capacity(rows.len());
    for (id, pkt_id, chunk_index, attempt, next_retry, blob) in rows {
        match rmp_serde::from_slice::<QueuedSend>(&blob) {
            Ok(payload) => items.push(QueueItem {
                id,
                pkt_id,
                chunk_index,
                attempt,
                next_retry,
                payload,
            }),
            Err(e) => {
                tracing::error!("queue: dropping undecodable item {id} (pkt={pkt_id}): {e}");
                delete_item(conn, &id)?;
            }
        }
    }
    Ok(items)
}

/// Record a failed retry of `item`.
pub fn retry(
    conn: &Connection,
    item: &QueueItem,
    policy: &BackoffPolicy,
    now_ms: u64,
) -> Result<RetryOutcome, ArcProtocolError> {
    let attempt = item.attempt.saturating_add(1);
    if attempt > policy.max_retries {
        delete_item(conn, &item.id)?;
        return Ok(RetryOutcome::Exhausted);
    }
    let next_retry = now_ms.saturating_add(policy.delay_ms(attempt));
    conn.execute(
        "UPDATE send_queue SET attempt = ?1, next_retry = ?2 WHERE id = ?3",
        params![attempt, next_retry as i64, item.id],
    )?;
    Ok(RetryOutcome::Rescheduled {
        attempt,
        next_retry,
    })
}

pub fn delete_item(conn: &Connection, id: &str) -> Result<(), ArcProtocolError> {
    conn.execute("DELETE FROM send_queue WHERE id = ?1", [id])?;
    Ok(())
}

pub fn pending_count(conn: &Connection) -> Result<usize, ArcProtocolError> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM send_queue", [], |row| row.get(0))?;
    Ok(count.max(0) as usize)
}

// ── Shared handle ───────────────────────────────────────────────────

/// Queue bound to a hub's database and backoff policy.
#[derive(Clone)]
pub struct RetransmitQueue {
    db: Db,
    policy: BackoffPolicy,
}

impl RetransmitQueue {
    pub fn new(db: Db, policy: BackoffPolicy) -> Self {
        Self { db, policy }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub async fn enqueue(&self, packet: &Packet) -> Result<String, ArcProtocolError> {
        let send = QueuedSend {
            packet: packet.clone(),
            dst_id: packet.dst_id.clone(),
        };
        let conn = self.db.lock().await;
        let id = enqueue(&conn, &send, &self.policy, arc_transport::now_ms())?;
        tracing::debug!(
            "queue: pkt={} chunk={} queued as {id}",
            packet.pkt_id,
            packet.chunk_index
        );
        Ok(id)
    }

    /// Queue several chunks in one transaction.
    pub async fn enqueue_all(&self, packets: &[Packet]) -> Result<usize, ArcProtocolError> {
        let now = arc_transport::now_ms();
        let conn = self.db.lock().await;
        let tx = conn.unchecked_transaction()?;
        for packet in packets {
            let send = QueuedSend {
                packet: packet.clone(),
                dst_id: packet.dst_id.clone(),
            };
            enqueue(&tx, &send, &self.policy, now)?;
        }
        tx.commit()?;
        Ok(packets.len())
    }

    pub async fn due(&self, now_ms: u64) -> Result<Vec<QueueItem>, ArcProtocolError> {
        let conn = self.db.lock().await;
        due_items(&conn, now_ms)
    }

    pub async fn retry(&self, item: &QueueItem, now_ms: u64) -> Result<RetryOutcome, ArcProtocolError> {
        let conn = self.db.lock().await;
        retry(&conn, item, &self.policy, now_ms)
    }

    pub async fn complete(&self, item: &QueueItem) -> Result<(), ArcProtocolError> {
        let conn = self.db.lock().await;
        delete_item(&conn, &item.id)
    }

    pub async fn len(&self) -> Result<usize, ArcProtocolError> {
        let conn = self.db.lock().await;
        pending_count(&conn)
    }

    pub async fn is_empty(&self) -> Result<bool, ArcProtocolError> {
        Ok(self.len().await? == 0)
    }
}
