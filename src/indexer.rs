use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunker::Chunker;
use crate::embedder::Embedder;
use crate::error::{Error, Result};
use crate::scanner::{FileInfo, Scanner};
use crate::store::{Chunk, Document, VectorStore};

/// Outcome of one indexing run.
#[derive(Debug, Default, Clone)]
pub struct IndexReport {
    pub files_indexed: usize,
    /// Unchanged, binary, oversized, and per-file-failed files.
    pub files_skipped: usize,
    pub chunks_created: usize,
    /// Files deleted from the store because they left the tree.
    pub files_removed: usize,
    pub duration: Duration,
}

/// Orchestrates full and incremental indexing: scan, diff against the
/// store by content hash, re-embed what changed, drop what disappeared.
pub struct Indexer {
    scanner: Scanner,
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    namespace: Option<String>,
}

impl Indexer {
    pub fn new(
        scanner: Scanner,
        chunker: Chunker,
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
    ) -> Self {
        Self {
            scanner,
            chunker,
            embedder,
            store,
            namespace: None,
        }
    }

    /// Prefix every stored path with `namespace/`. Used by workspace stores
    /// where several projects share one collection.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    fn stored_path(&self, rel: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}/{rel}"),
            None => rel.to_string(),
        }
    }

    /// Reconcile the store with the tree. Files are processed in
    /// lexicographic path order; per-file failures are logged and skipped,
    /// deletions always run, and the store is persisted at the end.
    pub async fn index_all(&self, cancel: &CancellationToken) -> Result<IndexReport> {
        let started = Instant::now();
        let mut report = IndexReport::default();

        let outcome = self.scanner.scan()?;
        report.files_skipped += outcome.skipped.len();

        let mut existing: HashSet<String> = self
            .store
            .list_documents()
            .await?
            .into_iter()
            .filter(|path| match &self.namespace {
                Some(ns) => path.starts_with(&format!("{ns}/")),
                None => true,
            })
            .collect();

        for file in &outcome.files {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let stored = self.stored_path(&file.path);
            if let Some(doc) = self.store.get_document(&stored).await? {
                if doc.hash == file.hash {
                    existing.remove(&stored);
                    report.files_skipped += 1;
                    continue;
                }
            }

            match self.index_file(file, cancel).await {
                Ok(chunks) => {
                    report.files_indexed += 1;
                    report.chunks_created += chunks;
                    existing.remove(&stored);
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!(path = %file.path, error = %e, "failed to index file, skipping");
                    report.files_skipped += 1;
                    // Still on disk, so it must not be swept below.
                    existing.remove(&stored);
                }
            }
        }

        // Whatever is left in the store was deleted from the tree.
        let mut removed: Vec<String> = existing.into_iter().collect();
        removed.sort();
        for path in removed {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.store.delete_by_file(&path, cancel).await?;
            self.store.delete_document(&path).await?;
            debug!(path = %path, "removed deleted file from index");
            report.files_removed += 1;
        }

        self.store.persist(cancel).await?;

        report.duration = started.elapsed();
        info!(
            indexed = report.files_indexed,
            skipped = report.files_skipped,
            chunks = report.chunks_created,
            removed = report.files_removed,
            ms = report.duration.as_millis() as u64,
            "indexing complete"
        );
        Ok(report)
    }

    /// Re-index one file: chunk, embed, then atomically replace its chunks
    /// and document. Returns the number of chunks written.
    pub async fn index_file(&self, file: &FileInfo, cancel: &CancellationToken) -> Result<usize> {
        let stored = self.stored_path(&file.path);
        let raw = self.chunker.chunk(&stored, &file.content);

        let chunks: Vec<Chunk> = if raw.is_empty() {
            Vec::new()
        } else {
            let texts: Vec<String> = raw.iter().map(|c| c.content.clone()).collect();
            let vectors = self.embedder.embed_batch(&texts).await?;
            if vectors.len() != raw.len() {
                return Err(Error::embedder(
                    crate::error::EmbedderErrorKind::Protocol,
                    format!("expected {} vectors, got {}", raw.len(), vectors.len()),
                ));
            }

            let now = Utc::now();
            raw.into_iter()
                .zip(vectors)
                .map(|(chunk, vector)| Chunk {
                    id: chunk.id,
                    file_path: stored.clone(),
                    start_line: chunk.start_line as u32,
                    end_line: chunk.end_line as u32,
                    content: chunk.content,
                    vector,
                    hash: chunk.hash,
                    updated_at: now,
                })
                .collect()
        };

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.store.delete_by_file(&stored, cancel).await?;
        self.store.save_chunks(&chunks, cancel).await?;
        self.store
            .save_document(&Document {
                path: stored,
                hash: file.hash.clone(),
                mod_time: file.mtime,
                chunk_ids: chunks.iter().map(|c| c.id.clone()).collect(),
            })
            .await?;

        Ok(chunks.len())
    }
}
