use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

use super::{cosine_similarity, rank_results, term_frequency, Chunk, Document, SearchResult, VectorStore};

const MAGIC: [u8; 4] = *b"GAI1";
const VERSION: u32 = 1;

#[derive(Default)]
struct State {
    dimensions: u32,
    documents: HashMap<String, Document>,
    chunks: HashMap<String, Chunk>,
    dirty: bool,
}

/// Single-file store: everything lives in memory behind a reader/writer
/// lock and is flushed as one versioned file. Search is a brute-force
/// cosine scan, which is the right trade below ~10^5 chunks.
pub struct BinaryStore {
    path: PathBuf,
    state: RwLock<State>,
    closed: AtomicBool,
}

impl BinaryStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: RwLock::new(State::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::store("store is closed"));
        }
        Ok(())
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| Error::store("store lock poisoned"))
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| Error::store("store lock poisoned"))
    }
}

#[async_trait]
impl VectorStore for BinaryStore {
    async fn load(&self, cancel: &CancellationToken) -> Result<()> {
        self.ensure_open()?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let fresh = if self.path.exists() {
            decode(&fs::read(&self.path)?)?
        } else {
            State::default()
        };

        let mut state = self.write_state()?;
        *state = fresh;
        debug!(
            documents = state.documents.len(),
            chunks = state.chunks.len(),
            "loaded binary index"
        );
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

        let mut state = self.write_state()?;

        // Validate the whole batch before touching the map: a bad chunk
        // must not leave a partial write behind.
        let mut dims = state.dimensions;
        for chunk in chunks {
            let got = chunk.vector.len() as u32;
            if dims == 0 {
                dims = got;
            } else if got != dims {
                return Err(Error::store(format!(
                    "vector dimension mismatch: store has {dims}, chunk {} has {got}",
                    chunk.id
                )));
            }
        }

        state.dimensions = dims;
        for chunk in chunks {
            state.chunks.insert(chunk.id.clone(), chunk.clone());
        }
        state.dirty = true;
        Ok(())
    }

    async fn delete_by_file(&self, path: &str, cancel: &CancellationToken) -> Result<()> {
        self.ensure_open()?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut state = self.write_state()?;
        let before = state.chunks.len();
        state.chunks.retain(|_, chunk| chunk.file_path != path);
        if state.chunks.len() != before {
            state.dirty = true;
        }
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

        let state = self.read_state()?;
        let mut results: Vec<SearchResult> = state
            .chunks
            .values()
            .filter(|chunk| match path_prefix {
                Some(prefix) => chunk.file_path.starts_with(prefix),
                None => true,
            })
            .map(|chunk| SearchResult {
                score: cosine_similarity(query, &chunk.vector),
                chunk: chunk.clone(),
            })
            .collect();

        rank_results(&mut results);
        results.truncate(limit);
        Ok(results)
    }

    async fn get_document(&self, path: &str) -> Result<Option<Document>> {
        self.ensure_open()?;
        Ok(self.read_state()?.documents.get(path).cloned())
    }

    async fn save_document(&self, document: &Document) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.write_state()?;
        state
            .documents
            .insert(document.path.clone(), document.clone());
        state.dirty = true;
        Ok(())
    }

    async fn delete_document(&self, path: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.write_state()?;
        if state.documents.remove(path).is_some() {
            state.dirty = true;
        }
        Ok(())
    }

    async fn list_documents(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        let state = self.read_state()?;
        let mut paths: Vec<String> = state.documents.keys().cloned().collect();
        paths.sort();
        Ok(paths)
    }

    async fn keyword_scan(
        &self,
        terms: &[String],
        limit: usize,
        path_prefix: Option<&str>,
    ) -> Result<Vec<SearchResult>> {
        self.ensure_open()?;
        let state = self.read_state()?;
        let mut results: Vec<SearchResult> = state
            .chunks
            .values()
            .filter(|chunk| match path_prefix {
                Some(prefix) => chunk.file_path.starts_with(prefix),
                None => true,
            })
            .filter_map(|chunk| {
                let score = term_frequency(&chunk.content, terms);
                (score > 0.0).then(|| SearchResult {
                    chunk: chunk.clone(),
                    score,
                })
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

        let encoded = {
            let mut state = self.write_state()?;
            if !state.dirty && self.path.exists() {
                return Ok(());
            }
            state.dirty = false;
            encode(&state)?
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Atomic replace: a reader either sees the previous index or the
        // complete new one.
        let tmp = self.path.with_extension("bin.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), bytes = encoded.len(), "persisted binary index");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

fn encode(state: &State) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&state.dimensions.to_le_bytes());

    // Sorted record order keeps the encoding deterministic, so an unchanged
    // store re-persists byte-identically.
    let mut documents: Vec<&Document> = state.documents.values().collect();
    documents.sort_by(|a, b| a.path.cmp(&b.path));
    out.extend_from_slice(&(documents.len() as u64).to_le_bytes());
    for document in documents {
        write_record(&mut out, document)?;
    }

    let mut chunks: Vec<&Chunk> = state.chunks.values().collect();
    chunks.sort_by(|a, b| {
        a.file_path
            .cmp(&b.file_path)
            .then_with(|| a.start_line.cmp(&b.start_line))
            .then_with(|| a.id.cmp(&b.id))
    });
    out.extend_from_slice(&(chunks.len() as u64).to_le_bytes());
    for chunk in chunks {
        write_record(&mut out, chunk)?;
    }

    Ok(out)
}

fn write_record<T: serde::Serialize>(out: &mut Vec<u8>, record: &T) -> Result<()> {
    let bytes = bincode::serialize(record)?;
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&bytes);
    Ok(())
}

fn decode(bytes: &[u8]) -> Result<State> {
    let mut cursor = Cursor::new(bytes);

    let magic = cursor.take(4)?;
    if magic != MAGIC {
        return Err(Error::store("unrecognized index file magic"));
    }
    let version = cursor.read_u32()?;
    if version != VERSION {
        return Err(Error::store(format!(
            "unsupported index version {version}, expected {VERSION}"
        )));
    }

    let dimensions = cursor.read_u32()?;

    let doc_count = cursor.read_u64()?;
    let mut documents = HashMap::new();
    for _ in 0..doc_count {
        let document: Document = cursor.read_record()?;
        documents.insert(document.path.clone(), document);
    }

    let chunk_count = cursor.read_u64()?;
    let mut chunks = HashMap::new();
    for _ in 0..chunk_count {
        let chunk: Chunk = cursor.read_record()?;
        chunks.insert(chunk.id.clone(), chunk);
    }

    Ok(State {
        dimensions,
        documents,
        chunks,
        dirty: false,
    })
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(Error::store("truncated index file"));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let raw = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(raw);
        Ok(u64::from_le_bytes(buf))
    }

    fn read_record<T: serde::de::DeserializeOwned>(&mut self) -> Result<T> {
        let len = self.read_u32()? as usize;
        let raw = self.take(len)?;
        Ok(bincode::deserialize(raw)?)
    }
}
