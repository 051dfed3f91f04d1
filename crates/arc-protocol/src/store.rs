//! Hub persistence (SQLite).
//!
//! Tables: `metadata` (key/value), `capsules` (with provenance),
//! `messages` and `send_queue` (see [`crate::queue`]). All timestamps are
//! Unix milliseconds. Functions take a plain `&Connection`; callers hold
//! the shared [`Db`] lock for the duration of one call and never across
//! a network await.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::capsule::{Capsule, Provenance};
use crate::payload::UserMessage;

/// Shared connection handle.
pub type Db = Arc<Mutex<Connection>>;

/// Metadata key of the cached manifest.
pub const LATEST_MANIFEST_KEY: &str = "latest_manifest";

/// Open (or create) a database file and ensure the schema exists.
pub fn open_db(path: impl AsRef<Path>) -> rusqlite::Result<Db> {
    let conn = Connection::open(path)?;
    let _: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
    create_all_tables(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// In-memory database with the full schema.
pub fn open_in_memory() -> rusqlite::Result<Db> {
    let conn = Connection::open_in_memory()?;
    create_all_tables(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

// ── Schema ───────────────────────────────────────────────────────────

pub fn create_all_tables(conn: &Connection) -> rusqlite::Result<()> {
    create_metadata_table(conn)?;
    create_capsules_table(conn)?;
    create_messages_table(conn)?;
    crate::queue::create_send_queue_table(conn)?;
    Ok(())
}

pub fn create_metadata_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;
    Ok(())
}

pub fn create_capsules_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS capsules (
            capsule_id TEXT PRIMARY KEY,
            question_hash TEXT NOT NULL,
            question_text TEXT NOT NULL,
            answer_text TEXT NOT NULL,
            compressed_embedding TEXT,
            source_id TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            signature TEXT NOT NULL,
            ingest_source TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_capsules_question_hash ON capsules(question_hash)",
        [],
    )?;
    Ok(())
}

/// One row per (message, direction, target hub); an empty `hub_key`
/// stands for "no target".
pub fn create_messages_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS messages (
            message_id TEXT NOT NULL,
            direction TEXT NOT NULL,
            hub_key TEXT NOT NULL,
            sender_id TEXT NOT NULL,
            recipient_id TEXT,
            source_hub_id TEXT,
            target_hub_id TEXT,
            content TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            PRIMARY KEY (message_id, direction, hub_key)
        )",
        [],
    )?;
    Ok(())
}

// ── Metadata ─────────────────────────────────────────────────────────

pub fn upsert_metadata(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO metadata (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

pub fn fetch_metadata(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM metadata WHERE key = ?1",
        [key],
        |row| row.get(0),
    )
    .optional()
}

// ── Capsules ─────────────────────────────────────────────────────────

/// A capsule as held locally, with how it was obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCapsule {
    pub capsule: Capsule,
    pub provenance: Provenance,
}

/// Listing row for capsule inventories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsuleSummary {
    pub capsule_id: String,
    pub question_hash: String,
    pub ingest_source: Provenance,
    pub timestamp: u64,
}

const CAPSULE_COLUMNS: &str = "capsule_id, question_hash, question_text, answer_text,
    compressed_embedding, source_id, timestamp, signature, ingest_source";

fn provenance_from_sql(idx: usize, raw: String) -> rusqlite::Result<Provenance> {
    raw.parse().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("unknown provenance {raw}").into(),
        )
    })
}

fn stored_capsule_from_row(row: &Row<'_>) -> rusqlite::Result<StoredCapsule> {
    let timestamp: i64 = row.get(6)?;
    Ok(StoredCapsule {
        capsule: Capsule {
            capsule_id: row.get(0)?,
            question_hash: row.get(1)?,
            question_text: row.get(2)?,
            answer_text: row.get(3)?,
            compressed_embedding: row.get(4)?,
            source_id: row.get(5)?,
            timestamp: timestamp.max(0) as u64,
            signature: row.get(7)?,
        },
        provenance: provenance_from_sql(8, row.get(8)?)?,
    })
}

fn insert_capsule_row(
    conn: &Connection,
    verb: &str,
    capsule: &Capsule,
    provenance: Provenance,
) -> rusqlite::Result<usize> {
    conn.execute(
        &format!(
            "{verb} INTO capsules ({CAPSULE_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
        ),
        params![
            capsule.capsule_id,
            capsule.question_hash,
            capsule.question_text,
            capsule.answer_text,
            capsule.compressed_embedding,
            capsule.source_id,
            capsule.timestamp as i64,
            capsule.signature,
            provenance.as_str(),
        ],
    )
}

/// Insert or replace a capsule by id.
pub fn insert_capsule(
    conn: &Connection,
    capsule: &Capsule,
    provenance: Provenance,
) -> rusqlite::Result<()> {
    insert_capsule_row(conn, "INSERT OR REPLACE", capsule, provenance)?;
    Ok(())
}

/// Ingest a verified capsule.
///
/// A no-op returning `false` if the id is already held. Otherwise stores
/// it and, for non-fallback provenance, removes fallback capsules for the
/// same question hash, in one transaction.
pub fn ingest_capsule(
    conn: &Connection,
    capsule: &Capsule,
    provenance: Provenance,
) -> rusqlite::Result<bool> {
    let tx = conn.unchecked_transaction()?;
    let inserted = insert_capsule_row(&tx, "INSERT OR IGNORE", capsule, provenance)? > 0;
    if inserted && provenance != Provenance::Fallback {
        delete_fallback_for_hash(&tx, &capsule.question_hash)?;
    }
    tx.commit()?;
    Ok(inserted)
}

pub fn delete_fallback_for_hash(conn: &Connection, question_hash: &str) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM capsules WHERE question_hash = ?1 AND ingest_source = 'fallback'",
        [question_hash],
    )
}

pub fn fetch_capsule(conn: &Connection, capsule_id: &str) -> rusqlite::Result<Option<StoredCapsule>> {
    conn.query_row(
        &format!("SELECT {CAPSULE_COLUMNS} FROM capsules WHERE capsule_id = ?1"),
        [capsule_id],
        stored_capsule_from_row,
    )
    .optional()
}

/// Newest capsule for a question hash, any provenance.
pub fn fetch_capsule_by_hash(
    conn: &Connection,
    question_hash: &str,
) -> rusqlite::Result<Option<StoredCapsule>> {
    conn.query_row(
        &format!(
            "SELECT {CAPSULE_COLUMNS} FROM capsules WHERE question_hash = ?1
             ORDER BY timestamp DESC LIMIT 1"
        ),
        [question_hash],
        stored_capsule_from_row,
    )
    .optional()
}

/// Newest non-fallback capsule for a question hash.
pub fn fetch_trusted_by_hash(
    conn: &Connection,
    question_hash: &str,
) -> rusqlite::Result<Option<StoredCapsule>> {
    conn.query_row(
        &format!(
            "SELECT {CAPSULE_COLUMNS} FROM capsules
             WHERE question_hash = ?1 AND ingest_source != 'fallback'
             ORDER BY timestamp DESC LIMIT 1"
        ),
        [question_hash],
        stored_capsule_from_row,
    )
    .optional()
}

pub fn capsule_ids(conn: &Connection) -> rusqlite::Result<HashSet<String>> {
    let mut stmt = conn.prepare("SELECT capsule_id FROM capsules")?;
    let ids = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<HashSet<String>, _>>()?;
    Ok(ids)
}

/// Every capsule, newest first.
pub fn all_capsules(conn: &Connection) -> rusqlite::Result<Vec<Capsule>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CAPSULE_COLUMNS} FROM capsules ORDER BY timestamp DESC"
    ))?;
    let capsules = stmt
        .query_map([], stored_capsule_from_row)?
        .map(|r| r.map(|s| s.capsule))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(capsules)
}

pub fn list_capsules(conn: &Connection) -> rusqlite::Result<Vec<CapsuleSummary>> {
    let mut stmt = conn.prepare(
        "SELECT capsule_id, question_hash, ingest_source, timestamp
         FROM capsules ORDER BY timestamp DESC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            let timestamp: i64 = row.get(3)?;
            Ok(CapsuleSummary {
                capsule_id: row.get(0)?,
                question_hash: row.get(1)?,
                ingest_source: provenance_from_sql(2, row.get(2)?)?,
                timestamp: timestamp.max(0) as u64,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Messages ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub message: UserMessage,
    pub direction: Direction,
}

/// Store a message. Returns `false` if the same (id, direction, target)
/// row already exists.
pub fn insert_message(
    conn: &Connection,
    message: &UserMessage,
    direction: Direction,
) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO messages (
            message_id, direction, hub_key, sender_id, recipient_id,
            source_hub_id, target_hub_id, content, timestamp
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            message.message_id,
            direction.as_str(),
            message.target_hub_id.as_deref().unwrap_or_default(),
            message.sender_id,
            message.recipient_id,
            message.source_hub_id,
            message.target_hub_id,
            message.content,
            message.timestamp as i64,
        ],
    )?;
    Ok(changed > 0)
}

/// Messages newest first, optionally filtered by direction and by a user
/// appearing as sender or recipient.
pub fn fetch_messages(
    conn: &Connection,
    direction: Option<Direction>,
    user_id: Option<&str>,
    limit: usize,
) -> rusqlite::Result<Vec<StoredMessage>> {
    let mut stmt = conn.prepare(
        "SELECT message_id, sender_id, recipient_id, content, timestamp,
                source_hub_id, target_hub_id, direction
         FROM messages
         WHERE (?1 IS NULL OR direction = ?1)
           AND (?2 IS NULL OR sender_id = ?2 OR recipient_id = ?2)
         ORDER BY timestamp DESC
         LIMIT ?3",
    )?;
    let rows = stmt
        .query_map(
            params![direction.map(Direction::as_str), user_id, limit as i64],
            |row| {
                let timestamp: i64 = row.get(4)?;
                let direction: String = row.get(7)?;
                Ok(StoredMessage {
                    message: UserMessage {
                        message_id: row.get(0)?,
                        sender_id: row.get(1)?,
                        recipient_id: row.get(2)?,
                        content: row.get(3)?,
                        timestamp: timestamp.max(0) as u64,
                        source_hub_id: row.get(5)?,
                        target_hub_id: row.get(6)?,
                    },
                    direction: if direction == "incoming" {
                        Direction::Incoming
                    } else {
                        Direction::Outgoing
                    },
                })
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
