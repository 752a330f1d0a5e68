use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

use super::{cosine_similarity, rank_results, term_frequency, Chunk, Document, SearchResult, VectorStore};

const SCHEMA_VERSION: i64 = 1;

/// Relational backend on SQLite. Embeddings are stored as little-endian f32
/// BLOBs; path-prefix filtering is pushed down with `LIKE`, similarity is
/// computed over the surviving rows. Per-file replacement runs in one
/// transaction, so a concurrent search sees the old set or the new one.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    closed: AtomicBool,
}

impl SqliteStore {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta (
                 key   TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS chunks (
                 id         TEXT PRIMARY KEY,
                 file_path  TEXT NOT NULL,
                 start_line INTEGER NOT NULL,
                 end_line   INTEGER NOT NULL,
                 content    TEXT NOT NULL,
                 embedding  BLOB NOT NULL,
                 hash       TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_chunks_file_path ON chunks(file_path);
             CREATE TABLE IF NOT EXISTS documents (
                 path      TEXT PRIMARY KEY,
                 hash      TEXT NOT NULL,
                 mod_time  TEXT NOT NULL,
                 chunk_ids TEXT NOT NULL
             );",
        )?;

        let store = Self {
            conn: Mutex::new(conn),
            closed: AtomicBool::new(false),
        };
        store.check_schema_version()?;
        Ok(store)
    }

    fn check_schema_version(&self) -> Result<()> {
        let conn = self.lock()?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(raw) => {
                let found: i64 = raw
                    .parse()
                    .map_err(|_| Error::store(format!("bad schema version: {raw}")))?;
                if found != SCHEMA_VERSION {
                    return Err(Error::store(format!(
                        "schema version mismatch: index is v{found}, expected v{SCHEMA_VERSION}"
                    )));
                }
            }
            None => {
                conn.execute(
                    "INSERT INTO meta (key, value) VALUES ('schema_version', ?1)",
                    params![SCHEMA_VERSION.to_string()],
                )?;
            }
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::store("store is closed"));
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::store("store lock poisoned"))
    }

    fn chunk_rows(&self, path_prefix: Option<&str>) -> Result<Vec<Chunk>> {
        let conn = self.lock()?;
        let mut rows = Vec::new();

        let mut collect = |row: &rusqlite::Row<'_>| -> rusqlite::Result<ChunkRow> {
            Ok(ChunkRow {
                id: row.get(0)?,
                file_path: row.get(1)?,
                start_line: row.get(2)?,
                end_line: row.get(3)?,
                content: row.get(4)?,
                embedding: row.get(5)?,
                hash: row.get(6)?,
                updated_at: row.get(7)?,
            })
        };

        const COLUMNS: &str =
            "id, file_path, start_line, end_line, content, embedding, hash, updated_at";

        let raw: Vec<ChunkRow> = match path_prefix {
            Some(prefix) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {COLUMNS} FROM chunks WHERE file_path LIKE ?1 || '%'"
                ))?;
                let mapped = stmt.query_map(params![prefix], &mut collect)?;
                mapped.collect::<rusqlite::Result<_>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM chunks"))?;
                let mapped = stmt.query_map([], &mut collect)?;
                mapped.collect::<rusqlite::Result<_>>()?
            }
        };

        for row in raw {
            rows.push(row.into_chunk()?);
        }
        Ok(rows)
    }
}

struct ChunkRow {
    id: String,
    file_path: String,
    start_line: i64,
    end_line: i64,
    content: String,
    embedding: Vec<u8>,
    hash: String,
    updated_at: String,
}

impl ChunkRow {
    fn into_chunk(self) -> Result<Chunk> {
        Ok(Chunk {
            id: self.id,
            file_path: self.file_path,
            start_line: self.start_line as u32,
            end_line: self.end_line as u32,
            content: self.content,
            vector: blob_to_vec(&self.embedding)?,
            hash: self.hash,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

#[async_trait]
impl VectorStore for SqliteStore {
    async fn load(&self, cancel: &CancellationToken) -> Result<()> {
        self.ensure_open()?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        // The connection is the durable state; nothing to hydrate.
        Ok(())
    }

    async fn save_chunks(&self, chunks: &[Chunk], cancel: &CancellationToken) -> Result<()> {
        self.ensure_open()?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if chunks.is_empty() {
            return Ok(());
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO chunks
                     (id, file_path, start_line, end_line, content, embedding, hash, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for chunk in chunks {
                stmt.execute(params![
                    chunk.id,
                    chunk.file_path,
                    chunk.start_line as i64,
                    chunk.end_line as i64,
                    chunk.content,
                    vec_to_blob(&chunk.vector),
                    chunk.hash,
                    chunk.updated_at.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn delete_by_file(&self, path: &str, cancel: &CancellationToken) -> Result<()> {
        self.ensure_open()?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let conn = self.lock()?;
        conn.execute("DELETE FROM chunks WHERE file_path = ?1", params![path])?;
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        limit: usize,
        path_prefix: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>> {
        self.ensure_open()?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut results: Vec<SearchResult> = self
            .chunk_rows(path_prefix)?
            .into_iter()
            .map(|chunk| SearchResult {
                score: cosine_similarity(query, &chunk.vector),
                chunk,
            })
            .collect();

        rank_results(&mut results);
        results.truncate(limit);
        Ok(results)
    }

    async fn get_document(&self, path: &str) -> Result<Option<Document>> {
        self.ensure_open()?;
        let conn = self.lock()?;
        let row: Option<(String, String, String, String)> = conn
            .query_row(
                "SELECT path, hash, mod_time, chunk_ids FROM documents WHERE path = ?1",
                params![path],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        match row {
            Some((path, hash, mod_time, chunk_ids)) => Ok(Some(Document {
                path,
                hash,
                mod_time: parse_timestamp(&mod_time)?,
                chunk_ids: serde_json::from_str(&chunk_ids)
                    .map_err(|e| Error::store(format!("bad chunk_ids column: {e}")))?,
            })),
            None => Ok(None),
        }
    }

    async fn save_document(&self, document: &Document) -> Result<()> {
        self.ensure_open()?;
        let conn = self.lock()?;
        let chunk_ids = serde_json::to_string(&document.chunk_ids)
            .map_err(|e| Error::store(e.to_string()))?;
        conn.execute(
            "INSERT OR REPLACE INTO documents (path, hash, mod_time, chunk_ids)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                document.path,
                document.hash,
                document.mod_time.to_rfc3339(),
                chunk_ids,
            ],
        )?;
        Ok(())
    }

    async fn delete_document(&self, path: &str) -> Result<()> {
        self.ensure_open()?;
        let conn = self.lock()?;
        conn.execute("DELETE FROM documents WHERE path = ?1", params![path])?;
        Ok(())
    }

    async fn list_documents(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT path FROM documents ORDER BY path")?;
        let mapped = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(mapped.collect::<rusqlite::Result<_>>()?)
    }

    async fn keyword_scan(
        &self,
        terms: &[String],
        limit: usize,
        path_prefix: Option<&str>,
    ) -> Result<Vec<SearchResult>> {
        self.ensure_open()?;
        let mut results: Vec<SearchResult> = self
            .chunk_rows(path_prefix)?
            .into_iter()
            .filter_map(|chunk| {
                let score = term_frequency(&chunk.content, terms);
                (score > 0.0).then_some(SearchResult { chunk, score })
            })
            .collect();

        rank_results(&mut results);
        results.truncate(limit);
        Ok(results)
    }

    async fn persist(&self, cancel: &CancellationToken) -> Result<()> {
        self.ensure_open()?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let conn = self.lock()?;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

fn blob_to_vec(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(Error::store("embedding blob length not a multiple of 4"));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|raw| f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
        .collect())
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::store(format!("bad timestamp {raw:?}: {e}")))
}
