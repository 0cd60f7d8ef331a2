use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::debug;

use crate::broker::Event;
use crate::error::{RedpilotError, Result};

/// Append-only event log holding the replayable tail per operation.
///
/// A single writer connection behind a mutex; reads go through the same
/// connection since the tail is small and queries are rare. Blocking
/// rusqlite calls are pushed onto the blocking pool.
#[derive(Clone)]
pub struct EventLog {
    conn: Arc<Mutex<Connection>>,
    tail: usize,
}

impl EventLog {
    pub fn open(path: impl AsRef<Path>, tail: usize) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path.as_ref())
            .map_err(|e| RedpilotError::EventLog(e.to_string()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS events (
                op_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                event TEXT NOT NULL,
                PRIMARY KEY (op_id, seq)
            );",
        )
        .map_err(|e| RedpilotError::EventLog(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            tail,
        })
    }

    /// Append one event and prune anything older than the retained tail.
    pub async fn append(&self, op_id: &str, event: &Event) -> Result<()> {
        let conn = self.conn.clone();
        let op_id = op_id.to_string();
        let seq = event.seq;
        let body = serde_json::to_string(event)?;
        let tail = self.tail as i64;

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            conn.execute(
                "INSERT OR REPLACE INTO events (op_id, seq, event) VALUES (?1, ?2, ?3)",
                params![op_id, seq as i64, body],
            )
            .map_err(|e| RedpilotError::EventLog(e.to_string()))?;
            conn.execute(
                "DELETE FROM events WHERE op_id = ?1 AND seq < ?2",
                params![op_id, seq as i64 - tail + 1],
            )
            .map_err(|e| RedpilotError::EventLog(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| RedpilotError::EventLog(format!("append task failed: {}", e)))?
    }

    /// Retained events with `seq >= from_seq`, in order.
    pub async fn tail(&self, op_id: &str, from_seq: u64) -> Result<Vec<Event>> {
        let conn = self.conn.clone();
        let op_id = op_id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            let mut stmt = conn
                .prepare(
                    "SELECT event FROM events WHERE op_id = ?1 AND seq >= ?2 ORDER BY seq ASC",
                )
                .map_err(|e| RedpilotError::EventLog(e.to_string()))?;
            let rows = stmt
                .query_map(params![op_id, from_seq as i64], |row| {
                    row.get::<_, String>(0)
                })
                .map_err(|e| RedpilotError::EventLog(e.to_string()))?;

            let mut events = Vec::new();
            for row in rows {
                let body = row.map_err(|e| RedpilotError::EventLog(e.to_string()))?;
                match serde_json::from_str::<Event>(&body) {
                    Ok(event) => events.push(event),
                    Err(e) => debug!(error = %e, "skipping undecodable event row"),
                }
            }
            Ok(events)
        })
        .await
        .map_err(|e| RedpilotError::EventLog(format!("tail task failed: {}", e)))?
    }
}
