mod binary;
mod remote;
mod sqlite;

pub use binary::BinaryStore;
pub use remote::RemoteStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::StoreConfig;
use crate::error::{Error, Result};

/// A contiguous slice of one source file, embedded as a single vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    /// Project-relative path, forward slashes. Workspace stores namespace it
    /// as `workspace/project/relative_path`.
    pub file_path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub content: String,
    pub vector: Vec<f32>,
    /// Hash of `content`.
    pub hash: String,
    pub updated_at: DateTime<Utc>,
}

/// Metadata record binding a file path to its current hash and chunk ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub path: String,
    pub hash: String,
    pub mod_time: DateTime<Utc>,
    pub chunk_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub chunk: Chunk,
    pub score: f32,
}

/// Persistence and similarity retrieval for chunks and documents.
///
/// All mutations funnel through this interface; implementations guarantee
/// that replacing one file's chunks is atomic with respect to concurrent
/// searches. Long operations check the cancellation token at I/O boundaries.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Hydrate from durable storage.
    async fn load(&self, cancel: &CancellationToken) -> Result<()>;

    async fn save_chunks(&self, chunks: &[Chunk], cancel: &CancellationToken) -> Result<()>;

    /// Remove every chunk whose `file_path` equals `path`.
    async fn delete_by_file(&self, path: &str, cancel: &CancellationToken) -> Result<()>;

    /// Top-`limit` results by descending cosine similarity, ties broken by
    /// `(file_path, start_line)` ascending. `path_prefix` is pushed down
    /// where the backend supports it.
    async fn search(
        &self,
        query: &[f32],
        limit: usize,
        path_prefix: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>>;

    async fn get_document(&self, path: &str) -> Result<Option<Document>>;

    async fn save_document(&self, document: &Document) -> Result<()>;

    async fn delete_document(&self, path: &str) -> Result<()>;

    /// All known document paths, sorted.
    async fn list_documents(&self) -> Result<Vec<String>>;

    /// Lexical scan over indexed content for hybrid fusion; the score is a
    /// plain term-frequency count. Backends without content access return
    /// nothing and hybrid search degrades to vector-only.
    async fn keyword_scan(
        &self,
        _terms: &[String],
        _limit: usize,
        _path_prefix: Option<&str>,
    ) -> Result<Vec<SearchResult>> {
        Ok(Vec::new())
    }

    /// Flush to durable storage.
    async fn persist(&self, cancel: &CancellationToken) -> Result<()>;

    /// Release resources; every later call fails.
    async fn close(&self) -> Result<()>;
}

/// Instantiate the backend selected by config. Relative paths resolve
/// against the project root.
pub fn create_store(root: &Path, config: &StoreConfig) -> Result<Arc<dyn VectorStore>> {
    match config.backend.as_str() {
        "binary" => Ok(Arc::new(BinaryStore::new(resolve(root, &config.binary.path)))),
        "relational" => Ok(Arc::new(SqliteStore::new(resolve(
            root,
            &config.relational.path,
        ))?)),
        "remote" => Ok(Arc::new(RemoteStore::new(root, &config.remote)?)),
        other => Err(Error::config(format!("unknown store backend: {other}"))),
    }
}

fn resolve(root: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        root.join(p)
    }
}

/// Normalized dot product. Zero vectors and length mismatches score 0,
/// never NaN.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

/// Collection and table names: every non-alphanumeric byte becomes `_`.
pub fn sanitize_collection_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Final result order: score descending, ties by `(file_path, start_line)`
/// ascending.
pub(crate) fn rank_results(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.chunk.file_path.cmp(&b.chunk.file_path))
            .then_with(|| a.chunk.start_line.cmp(&b.chunk.start_line))
    });
}

/// Term-frequency score shared by the backends that implement
/// `keyword_scan`.
pub(crate) fn term_frequency(content: &str, terms: &[String]) -> f32 {
    if terms.is_empty() {
        return 0.0;
    }
    let lower = content.to_lowercase();
    terms
        .iter()
        .map(|t| lower.matches(t.as_str()).count() as f32)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(path: &str, start: u32, score_marker: &str) -> Chunk {
        Chunk {
            id: format!("{path}:{start}"),
            file_path: path.to_string(),
            start_line: start,
            end_line: start + 9,
            content: score_marker.to_string(),
            vector: vec![1.0, 0.0],
            hash: "h".to_string(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn cosine_bounds_and_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);

        let same = cosine_similarity(&[3.0, 4.0], &[3.0, 4.0]);
        assert!((same - 1.0).abs() < 1e-6);

        let opposite = cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]);
        assert!((opposite + 1.0).abs() < 1e-6);

        let score = cosine_similarity(&[0.2, 0.9, -0.4], &[-0.7, 0.1, 0.5]);
        assert!((-1.0..=1.0).contains(&score));
        assert!(!score.is_nan());
    }

    #[test]
    fn cosine_ignores_magnitude() {
        let a = cosine_similarity(&[1.0, 2.0], &[2.0, 1.0]);
        let b = cosine_similarity(&[10.0, 20.0], &[2.0, 1.0]);
        assert!((a - b).abs() < 1e-6);
    }

    #[test]
    fn sanitize_replaces_every_non_alphanumeric() {
        assert_eq!(
            sanitize_collection_name("/home/dev/my-project v2"),
            "_home_dev_my_project_v2"
        );
        assert_eq!(sanitize_collection_name("clean123"), "clean123");
    }

    #[test]
    fn ranking_is_score_then_path_then_line() {
        let mut results = vec![
            SearchResult { chunk: chunk("b.rs", 1, ""), score: 0.5 },
            SearchResult { chunk: chunk("a.rs", 30, ""), score: 0.5 },
            SearchResult { chunk: chunk("a.rs", 10, ""), score: 0.5 },
            SearchResult { chunk: chunk("z.rs", 1, ""), score: 0.9 },
        ];
        rank_results(&mut results);

        let order: Vec<(String, u32)> = results
            .iter()
            .map(|r| (r.chunk.file_path.clone(), r.chunk.start_line))
            .collect();
        assert_eq!(
            order,
            vec![
                ("z.rs".to_string(), 1),
                ("a.rs".to_string(), 10),
                ("a.rs".to_string(), 30),
                ("b.rs".to_string(), 1),
            ]
        );
    }

    #[test]
    fn term_frequency_counts_case_insensitively() {
        let terms = vec!["user".to_string(), "login".to_string()];
        assert_eq!(term_frequency("User login; USER logout", &terms), 3.0);
        assert_eq!(term_frequency("nothing relevant", &terms), 0.0);
        assert_eq!(term_frequency("anything", &[]), 0.0);
    }
}
