use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{BoostConfig, SearchConfig};
use crate::embedder::Embedder;
use crate::error::{Error, Result};
use crate::store::{rank_results, Chunk, SearchResult, VectorStore};

/// Candidate multiplier so fusion and boosting have headroom before the
/// final truncation.
const OVER_FETCH: usize = 3;

/// Executes a query end-to-end: embed, retrieve, optionally fuse with a
/// lexical ranking, boost, and truncate.
pub struct Searcher {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn VectorStore>,
    config: SearchConfig,
    root: PathBuf,
}

impl Searcher {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn VectorStore>,
        config: SearchConfig,
        root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            embedder,
            store,
            config,
            root: root.into(),
        }
    }

    /// Ranked results for a natural-language query. `path_prefix` accepts
    /// project-relative prefixes or absolute paths inside the project;
    /// anything escaping the root fails with `FailedPath`.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        path_prefix: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>> {
        let prefix = path_prefix
            .map(|p| self.normalize_prefix(p))
            .transpose()?;
        self.search_raw(query, limit, prefix.as_deref(), cancel).await
    }

    /// Same pipeline with a prefix that is already store-relative; used by
    /// workspace queries whose namespaces never touch the filesystem.
    pub(crate) async fn search_raw(
        &self,
        query: &str,
        limit: usize,
        prefix: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let terms = query_terms(query);
        let query_vector = self.embedder.embed(query).await?;
        let fetch = limit.saturating_mul(OVER_FETCH);

        let mut candidates = self
            .store
            .search(&query_vector, fetch, prefix, cancel)
            .await?;

        if self.config.hybrid.enabled {
            let lexical = self.store.keyword_scan(&terms, fetch, prefix).await?;
            debug!(
                vector = candidates.len(),
                lexical = lexical.len(),
                "fusing rankings"
            );
            candidates = fuse(&candidates, &lexical, self.config.hybrid.k);
        }

        let now = Utc::now();
        for result in &mut candidates {
            result.score += boost(&self.config.boost, &terms, &result.chunk, now);
        }

        // Backends that cannot push the prefix down were over-fetched; this
        // is the safety net either way.
        if let Some(p) = prefix {
            candidates.retain(|r| r.chunk.file_path.starts_with(p));
        }

        rank_results(&mut candidates);
        candidates.truncate(limit);

        for result in &mut candidates {
            if let Some(n) = file_header_len(&result.chunk.content) {
                result.chunk.content.drain(..n);
            }
        }
        Ok(candidates)
    }

    /// Lexically resolve a prefix to a project-relative path. Absolute paths
    /// inside the project are converted, `./` is stripped, and `..` must not
    /// climb past the root.
    fn normalize_prefix(&self, raw: &str) -> Result<String> {
        let mut value = raw.replace('\\', "/");

        if Path::new(&value).is_absolute() {
            let path = PathBuf::from(&value);
            let rel = match path.strip_prefix(&self.root) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => {
                    let canonical = std::fs::canonicalize(&self.root)
                        .unwrap_or_else(|_| self.root.clone());
                    match path.strip_prefix(&canonical) {
                        Ok(rel) => rel.to_path_buf(),
                        Err(_) => return Err(Error::FailedPath(raw.to_string())),
                    }
                }
            };
            value = rel.to_string_lossy().replace('\\', "/");
        }

        let had_trailing_slash = value.ends_with('/');
        let mut segments: Vec<&str> = Vec::new();
        for segment in value.split('/') {
            match segment {
                "" | "." => continue,
                ".." => {
                    if segments.pop().is_none() {
                        return Err(Error::FailedPath(raw.to_string()));
                    }
                }
                s => segments.push(s),
            }
        }

        let mut normalized = segments.join("/");
        if had_trailing_slash && !normalized.is_empty() {
            normalized.push('/');
        }
        Ok(normalized)
    }
}

/// Reciprocal-rank fusion over the two rankings: each list contributes
/// `1 / (k + rank)` with 1-based ranks; chunks present in both sum.
fn fuse(vector: &[SearchResult], lexical: &[SearchResult], k: u32) -> Vec<SearchResult> {
    let mut scores: HashMap<String, f32> = HashMap::new();
    let mut by_id: HashMap<String, SearchResult> = HashMap::new();

    for list in [vector, lexical] {
        for (rank, result) in list.iter().enumerate() {
            *scores.entry(result.chunk.id.clone()).or_insert(0.0) +=
                1.0 / (k as f32 + rank as f32 + 1.0);
            by_id
                .entry(result.chunk.id.clone())
                .or_insert_with(|| result.clone());
        }
    }

    by_id
        .into_iter()
        .map(|(id, mut result)| {
            result.score = scores[&id];
            result
        })
        .collect()
}

fn boost(config: &BoostConfig, terms: &[String], chunk: &Chunk, now: DateTime<Utc>) -> f32 {
    let mut total = 0.0;

    let basename = chunk
        .file_path
        .rsplit('/')
        .next()
        .unwrap_or("")
        .to_lowercase();
    if terms.iter().any(|t| basename.contains(t.as_str())) {
        total += config.filename;
    }

    // The first non-blank line usually carries the declared symbol.
    let body = strip_file_header(&chunk.content);
    if let Some(first) = body.lines().find(|l| !l.trim().is_empty()) {
        let first = first.to_lowercase();
        if terms.iter().any(|t| first.contains(t.as_str())) {
            total += config.symbol;
        }
    }

    let depth = chunk.file_path.matches('/').count() as f32;
    total += config.path_depth / (1.0 + depth);

    let age_days = (now - chunk.updated_at).num_days().max(0) as f32;
    total += config.recency / (1.0 + age_days);

    total
}

/// Byte length of the synthetic `File: <path>` header chunk contents carry
/// for embedding context, if present.
fn file_header_len(content: &str) -> Option<usize> {
    let rest = content.strip_prefix("File: ")?;
    let idx = rest.find("\n\n")?;
    Some("File: ".len() + idx + 2)
}

fn strip_file_header(content: &str) -> &str {
    match file_header_len(content) {
        Some(n) => &content[n..],
        None => content,
    }
}

fn query_terms(query: &str) -> Vec<String> {
    let mut terms = Vec::new();
    for token in query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2)
    {
        if !terms.iter().any(|t| t == token) {
            terms.push(token.to_string());
        }
    }
    terms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::SyntheticEmbedder;
    use crate::store::{BinaryStore, VectorStore};
    use std::path::PathBuf;

    fn chunk(id: &str, path: &str, start: u32, content: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            file_path: path.to_string(),
            start_line: start,
            end_line: start + 9,
            content: content.to_string(),
            vector: Vec::new(),
            hash: format!("hash-{id}"),
            updated_at: Utc::now(),
        }
    }

    fn searcher_over(store: Arc<dyn VectorStore>, config: SearchConfig) -> Searcher {
        Searcher::new(
            Arc::new(SyntheticEmbedder::new(128)),
            store,
            config,
            PathBuf::from("/project"),
        )
    }

    async fn seeded_store(embedder: &SyntheticEmbedder) -> Arc<dyn VectorStore> {
        let store = Arc::new(BinaryStore::new(PathBuf::from(
            "/nonexistent/never-persisted.bin",
        )));
        let cancel = CancellationToken::new();

        let entries = [
            (
                "auth1",
                "src/auth.rs",
                "fn authenticate_user(name: &str) { validate login credentials }",
            ),
            (
                "io1",
                "src/io.rs",
                "fn copy_bytes(reader: &mut impl Read) { buffered file descriptor copy }",
            ),
            (
                "deep1",
                "src/nested/deep/util.rs",
                "fn helper() { miscellaneous utilities }",
            ),
        ];

        let mut chunks = Vec::new();
        for (id, path, content) in entries {
            let mut c = chunk(id, path, 1, content);
            c.vector = embedder.embed(content).await.unwrap();
            chunks.push(c);
        }
        store.save_chunks(&chunks, &cancel).await.unwrap();
        store
    }

    #[test]
    fn prefix_normalization_relative() {
        let s = searcher_over(
            Arc::new(BinaryStore::new(PathBuf::from("/tmp/x.bin"))),
            SearchConfig::default(),
        );
        assert_eq!(s.normalize_prefix("src/core").unwrap(), "src/core");
        assert_eq!(s.normalize_prefix("./src/core/").unwrap(), "src/core/");
        assert_eq!(s.normalize_prefix("src/./a/../core").unwrap(), "src/core");
        assert_eq!(s.normalize_prefix("src\\win").unwrap(), "src/win");
    }

    #[test]
    fn prefix_normalization_absolute_inside_root() {
        let s = searcher_over(
            Arc::new(BinaryStore::new(PathBuf::from("/tmp/x.bin"))),
            SearchConfig::default(),
        );
        assert_eq!(s.normalize_prefix("/project/src").unwrap(), "src");
    }

    #[test]
    fn escaping_prefixes_are_rejected() {
        let s = searcher_over(
            Arc::new(BinaryStore::new(PathBuf::from("/tmp/x.bin"))),
            SearchConfig::default(),
        );
        assert!(matches!(
            s.normalize_prefix("../../etc"),
            Err(Error::FailedPath(_))
        ));
        assert!(matches!(
            s.normalize_prefix("src/../../other"),
            Err(Error::FailedPath(_))
        ));
        assert!(matches!(
            s.normalize_prefix("/etc/passwd"),
            Err(Error::FailedPath(_))
        ));
    }

    #[test]
    fn rrf_sums_contributions_from_both_lists() {
        let both = chunk("both", "a.rs", 1, "x");
        let vector_only = chunk("vec", "b.rs", 1, "y");

        let vector = vec![
            SearchResult { chunk: both.clone(), score: 0.9 },
            SearchResult { chunk: vector_only.clone(), score: 0.8 },
        ];
        let lexical = vec![SearchResult { chunk: both.clone(), score: 5.0 }];

        let fused = fuse(&vector, &lexical, 60);
        let score_of = |id: &str| {
            fused
                .iter()
                .find(|r| r.chunk.id == id)
                .map(|r| r.score)
                .unwrap()
        };

        // rank 1 in both lists vs rank 2 in one list.
        assert!((score_of("both") - 2.0 / 61.0).abs() < 1e-6);
        assert!((score_of("vec") - 1.0 / 62.0).abs() < 1e-6);
    }

    #[test]
    fn boosts_fire_on_their_predicates() {
        let config = BoostConfig::default();
        let terms = query_terms("auth token");
        let now = Utc::now();

        let named = chunk("a", "src/auth.rs", 1, "fn unrelated() {}");
        let symbol = chunk("b", "src/lib.rs", 1, "fn auth_check() {}");
        let neither = chunk("c", "src/other.rs", 1, "fn misc() {}");

        let named_boost = boost(&config, &terms, &named, now);
        let symbol_boost = boost(&config, &terms, &symbol, now);
        let base = boost(&config, &terms, &neither, now);

        assert!((named_boost - base - config.filename).abs() < 1e-6);
        assert!((symbol_boost - base - config.symbol).abs() < 1e-6);
    }

    #[test]
    fn shallower_paths_get_larger_depth_boost() {
        let config = BoostConfig::default();
        let now = Utc::now();
        let shallow = chunk("a", "main.rs", 1, "x");
        let deep = chunk("b", "a/b/c/d/main.rs", 1, "x");
        assert!(boost(&config, &[], &shallow, now) > boost(&config, &[], &deep, now));
    }

    #[test]
    fn header_stripping() {
        assert_eq!(strip_file_header("File: a.rs\n\nfn x() {}"), "fn x() {}");
        assert_eq!(strip_file_header("fn x() {}"), "fn x() {}");
        assert_eq!(strip_file_header("File: weird no blank line"), "File: weird no blank line");
    }

    #[test]
    fn query_terms_are_lowercased_and_deduped() {
        assert_eq!(
            query_terms("User LOGIN user a validation"),
            vec!["user", "login", "validation"]
        );
    }

    #[tokio::test]
    async fn relevant_file_outranks_unrelated_one() {
        let embedder = SyntheticEmbedder::new(128);
        let store = seeded_store(&embedder).await;
        let searcher = searcher_over(store, SearchConfig::default());
        let cancel = CancellationToken::new();

        let results = searcher
            .search("user login validation", 2, None, &cancel)
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk.file_path, "src/auth.rs");
        assert!(results[0].score > results[1].score);
    }

    #[tokio::test]
    async fn results_are_filtered_by_prefix() {
        let embedder = SyntheticEmbedder::new(128);
        let store = seeded_store(&embedder).await;
        let searcher = searcher_over(store, SearchConfig::default());
        let cancel = CancellationToken::new();

        let results = searcher
            .search("anything at all", 10, Some("src/nested/"), &cancel)
            .await
            .unwrap();
        assert!(!results.is_empty());
        assert!(results
            .iter()
            .all(|r| r.chunk.file_path.starts_with("src/nested/")));
    }

    #[tokio::test]
    async fn hybrid_fusion_still_ranks_relevant_first() {
        let embedder = SyntheticEmbedder::new(128);
        let store = seeded_store(&embedder).await;
        let config = SearchConfig {
            hybrid: crate::config::HybridConfig {
                enabled: true,
                k: 60,
            },
            ..SearchConfig::default()
        };
        let searcher = searcher_over(store, config);
        let cancel = CancellationToken::new();

        let results = searcher
            .search("validate login credentials", 3, None, &cancel)
            .await
            .unwrap();
        assert_eq!(results[0].chunk.file_path, "src/auth.rs");
    }

    #[tokio::test]
    async fn scores_are_non_increasing() {
        let embedder = SyntheticEmbedder::new(128);
        let store = seeded_store(&embedder).await;
        let searcher = searcher_over(store, SearchConfig::default());
        let cancel = CancellationToken::new();

        let results = searcher
            .search("copy file bytes", 10, None, &cancel)
            .await
            .unwrap();
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }
}
