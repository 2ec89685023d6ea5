use anyhow::{anyhow, Result};
use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex};

use crate::frame::PersistedFrame;

/// Persistence capability for selected frames.
///
/// Called by the write-back service after the store lock has been released.
pub trait FrameSink: Send {
    fn persist(&mut self, frame: &PersistedFrame) -> Result<()>;
}

pub struct SqliteFrameSink {
    conn: Connection,
}

impl SqliteFrameSink {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let mut sink = Self { conn };
        sink.ensure_schema()?;
        Ok(sink)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut sink = Self { conn };
        sink.ensure_schema()?;
        Ok(sink)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS selected_frames (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              label INTEGER NOT NULL,
              captured_s INTEGER NOT NULL,
              captured_ns INTEGER NOT NULL,
              diff_magnitude INTEGER,
              size INTEGER NOT NULL,
              generation INTEGER NOT NULL,
              payload_sha256 BLOB NOT NULL,
              payload BLOB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_frames_label ON selected_frames(label);
            "#,
        )?;
        Ok(())
    }

    pub fn count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM selected_frames", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Labels in insertion order.
    pub fn labels(&self) -> Result<Vec<u32>> {
        let mut stmt = self
            .conn
            .prepare("SELECT label FROM selected_frames ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        let mut out = Vec::new();
        for row in rows {
            let label = row?;
            out.push(u32::try_from(label).map_err(|_| anyhow!("corrupt label {}", label))?);
        }
        Ok(out)
    }

    /// Stored payload digest for `label`, if present.
    pub fn payload_digest(&self, label: u32) -> Result<Option<[u8; 32]>> {
        let mut stmt = self
            .conn
            .prepare("SELECT payload_sha256 FROM selected_frames WHERE label = ?1 LIMIT 1")?;
        let mut rows = stmt.query(params![label])?;
        if let Some(row) = rows.next()? {
            let bytes: Vec<u8> = row.get(0)?;
            if bytes.len() != 32 {
                return Err(anyhow!("corrupt frame row: payload_sha256 size"));
            }
            let mut out = [0u8; 32];
            out.copy_from_slice(&bytes);
            return Ok(Some(out));
        }
        Ok(None)
    }
}

impl FrameSink for SqliteFrameSink {
    fn persist(&mut self, frame: &PersistedFrame) -> Result<()> {
        let captured_s = i64::try_from(frame.timestamp.secs)
            .map_err(|_| anyhow!("capture time exceeds i64 range"))?;
        let generation = i64::try_from(frame.generation)
            .map_err(|_| anyhow!("frame generation exceeds i64 range"))?;
        let magnitude = frame
            .usefulness
            .magnitude()
            .map(i64::try_from)
            .transpose()
            .map_err(|_| anyhow!("diff magnitude exceeds i64 range"))?;
        let digest = frame.payload_digest();
        self.conn.execute(
            "INSERT INTO selected_frames(label, captured_s, captured_ns, diff_magnitude, size, generation, payload_sha256, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                frame.label,
                captured_s,
                frame.timestamp.nanos,
                magnitude,
                frame.size() as i64,
                generation,
                digest.to_vec(),
                frame.payload,
            ],
        )?;
        log::debug!(
            "frame {} persisted ({} bytes, sha256={})",
            frame.label,
            frame.size(),
            hex::encode(digest)
        );
        Ok(())
    }
}

/// Sink that keeps frames in memory. Clones share the same buffer.
#[derive(Clone, Default)]
pub struct InMemoryFrameSink {
    frames: Arc<Mutex<Vec<PersistedFrame>>>,
}

impl InMemoryFrameSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Result<Vec<PersistedFrame>> {
        let guard = self
            .frames
            .lock()
            .map_err(|_| anyhow!("in-memory sink lock poisoned"))?;
        Ok(guard.clone())
    }

    pub fn len(&self) -> usize {
        self.frames.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FrameSink for InMemoryFrameSink {
    fn persist(&mut self, frame: &PersistedFrame) -> Result<()> {
        self.frames
            .lock()
            .map_err(|_| anyhow!("in-memory sink lock poisoned"))?
            .push(frame.clone());
        Ok(())
    }
}
