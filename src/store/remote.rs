use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::config::{RemoteStoreConfig, STATE_DIR};
use crate::error::{Error, Result};

use super::{rank_results, sanitize_collection_name, Chunk, Document, SearchResult, VectorStore};

/// Per-request timeout for store queries.
const QUERY_TIMEOUT: Duration = Duration::from_secs(10);
/// Extra candidates fetched when the prefix filter must run client-side.
const PREFIX_OVER_FETCH: usize = 3;

/// Remote vector database backend speaking a Qdrant-style REST API.
///
/// The service holds the embedded points; document metadata lives in a local
/// sidecar file under `.grepai/`, since points are the only remote state.
pub struct RemoteStore {
    client: reqwest::Client,
    base: String,
    collection: String,
    api_key: Option<String>,
    docs_path: PathBuf,
    docs: RwLock<HashMap<String, Document>>,
    collection_ready: AtomicBool,
    closed: AtomicBool,
}

impl RemoteStore {
    pub fn new(root: &Path, config: &RemoteStoreConfig) -> Result<Self> {
        let scheme = if config.tls { "https" } else { "http" };
        let base = format!("{scheme}://{}:{}", config.endpoint, config.port);

        let collection = sanitize_collection_name(
            config
                .collection
                .as_deref()
                .unwrap_or(&root.to_string_lossy()),
        );

        let client = reqwest::Client::builder()
            .timeout(QUERY_TIMEOUT)
            .build()
            .map_err(|e| Error::store(e.to_string()))?;

        Ok(Self {
            client,
            base,
            docs_path: root
                .join(STATE_DIR)
                .join(format!("{collection}.docs.bin")),
            collection,
            api_key: config.api_key.clone(),
            docs: RwLock::new(HashMap::new()),
            collection_ready: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::store("store is closed"));
        }
        Ok(())
    }

    fn read_docs(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Document>>> {
        self.docs
            .read()
            .map_err(|_| Error::store("store lock poisoned"))
    }

    fn write_docs(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Document>>> {
        self.docs
            .write()
            .map_err(|_| Error::store("store lock poisoned"))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(method, format!("{}{path}", self.base));
        if let Some(key) = &self.api_key {
            builder = builder.header("api-key", key);
        }
        builder
    }

    async fn ensure_collection(&self, dimensions: usize) -> Result<()> {
        if self.collection_ready.load(Ordering::Relaxed) {
            return Ok(());
        }

        let probe = self
            .request(
                reqwest::Method::GET,
                &format!("/collections/{}", self.collection),
            )
            .send()
            .await
            .map_err(|e| Error::store(e.to_string()))?;

        if probe.status() == reqwest::StatusCode::NOT_FOUND {
            let response = self
                .request(
                    reqwest::Method::PUT,
                    &format!("/collections/{}", self.collection),
                )
                .json(&json!({
                    "vectors": { "size": dimensions, "distance": "Cosine" }
                }))
                .send()
                .await
                .map_err(|e| Error::store(e.to_string()))?;
            check_status(response).await?;
            debug!(collection = %self.collection, dimensions, "created remote collection");
        } else {
            check_status(probe).await?;
        }

        self.collection_ready.store(true, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl VectorStore for RemoteStore {
    async fn load(&self, cancel: &CancellationToken) -> Result<()> {
        self.ensure_open()?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let fresh: HashMap<String, Document> = if self.docs_path.exists() {
            let entries: Vec<(String, Document)> =
                bincode::deserialize(&fs::read(&self.docs_path)?)?;
            entries.into_iter().collect()
        } else {
            HashMap::new()
        };
        *self.write_docs()? = fresh;
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

        self.ensure_collection(chunks[0].vector.len()).await?;

        let points: Vec<serde_json::Value> = chunks
            .iter()
            .map(|chunk| {
                json!({
                    "id": point_id(&chunk.id).to_string(),
                    "vector": chunk.vector,
                    "payload": PointPayload::from_chunk(chunk),
                })
            })
            .collect();

        let response = self
            .request(
                reqwest::Method::PUT,
                &format!("/collections/{}/points?wait=true", self.collection),
            )
            .json(&json!({ "points": points }))
            .send()
            .await
            .map_err(|e| Error::store(e.to_string()))?;
        check_status(response).await?;
        Ok(())
    }

    async fn delete_by_file(&self, path: &str, cancel: &CancellationToken) -> Result<()> {
        self.ensure_open()?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/collections/{}/points/delete?wait=true", self.collection),
            )
            .json(&json!({
                "filter": {
                    "must": [{ "key": "file_path", "match": { "value": path } }]
                }
            }))
            .send()
            .await
            .map_err(|e| Error::store(e.to_string()))?;

        // Deleting from a collection that was never created is a no-op.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(response).await?;
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

        // The prefix filter runs client-side, so over-fetch for headroom.
        let fetch = match path_prefix {
            Some(_) => limit.saturating_mul(PREFIX_OVER_FETCH),
            None => limit,
        };

        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/collections/{}/points/search", self.collection),
            )
            .json(&json!({
                "vector": query,
                "limit": fetch,
                "with_payload": true,
                "with_vector": true,
            }))
            .send()
            .await
            .map_err(|e| Error::store(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::store(format!("{status}: {body}")));
        }

        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| Error::store(e.to_string()))?;

        let mut results: Vec<SearchResult> = body
            .result
            .into_iter()
            .filter(|point| match path_prefix {
                Some(prefix) => point.payload.file_path.starts_with(prefix),
                None => true,
            })
            .map(|point| SearchResult {
                chunk: point.payload.into_chunk(point.vector.unwrap_or_default()),
                score: point.score,
            })
            .collect();

        rank_results(&mut results);
        results.truncate(limit);
        Ok(results)
    }

    async fn get_document(&self, path: &str) -> Result<Option<Document>> {
        self.ensure_open()?;
        Ok(self.read_docs()?.get(path).cloned())
    }

    async fn save_document(&self, document: &Document) -> Result<()> {
        self.ensure_open()?;
        self.write_docs()?
            .insert(document.path.clone(), document.clone());
        Ok(())
    }

    async fn delete_document(&self, path: &str) -> Result<()> {
        self.ensure_open()?;
        self.write_docs()?.remove(path);
        Ok(())
    }

    async fn list_documents(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        let mut paths: Vec<String> = self.read_docs()?.keys().cloned().collect();
        paths.sort();
        Ok(paths)
    }

    async fn persist(&self, cancel: &CancellationToken) -> Result<()> {
        self.ensure_open()?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let encoded = {
            let docs = self.read_docs()?;
            // Deterministic sidecar: serialize entries in path order.
            let mut entries: Vec<(&String, &Document)> = docs.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let ordered: Vec<(String, Document)> = entries
                .into_iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            bincode::serialize(&ordered)?
        };

        if let Some(parent) = self.docs_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.docs_path.with_extension("bin.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.docs_path)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// Deterministic point id: the service wants UUIDs, chunk ids are hex
/// digests, so the id is derived from the digest of the chunk id.
fn point_id(chunk_id: &str) -> Uuid {
    let digest = Sha256::digest(chunk_id.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

async fn check_status(response: reqwest::Response) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::store(format!("{status}: {body}")))
}

#[derive(Debug, Serialize, Deserialize)]
struct PointPayload {
    id: String,
    file_path: String,
    start_line: u32,
    end_line: u32,
    content: String,
    hash: String,
    updated_at: DateTime<Utc>,
}

impl PointPayload {
    fn from_chunk(chunk: &Chunk) -> Self {
        Self {
            id: chunk.id.clone(),
            file_path: chunk.file_path.clone(),
            start_line: chunk.start_line,
            end_line: chunk.end_line,
            content: chunk.content.clone(),
            hash: chunk.hash.clone(),
            updated_at: chunk.updated_at,
        }
    }

    fn into_chunk(self, vector: Vec<f32>) -> Chunk {
        Chunk {
            id: self.id,
            file_path: self.file_path,
            start_line: self.start_line,
            end_line: self.end_line,
            content: self.content,
            vector,
            hash: self.hash,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    result: Vec<ScoredPoint>,
}

#[derive(Debug, Deserialize)]
struct ScoredPoint {
    score: f32,
    payload: PointPayload,
    #[serde(default)]
    vector: Option<Vec<f32>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn remote_config() -> RemoteStoreConfig {
        RemoteStoreConfig::default()
    }

    #[test]
    fn collection_name_derived_from_root() {
        let store = RemoteStore::new(Path::new("/home/dev/my project"), &remote_config()).unwrap();
        assert_eq!(store.collection(), "_home_dev_my_project");
    }

    #[test]
    fn explicit_collection_name_still_sanitized() {
        let config = RemoteStoreConfig {
            collection: Some("team index-2".to_string()),
            ..remote_config()
        };
        let store = RemoteStore::new(Path::new("/tmp/x"), &config).unwrap();
        assert_eq!(store.collection(), "team_index_2");
    }

    #[test]
    fn point_ids_are_deterministic_and_distinct() {
        assert_eq!(point_id("abc"), point_id("abc"));
        assert_ne!(point_id("abc"), point_id("abd"));
    }

    #[test]
    fn search_response_shape() {
        let raw = r#"{
            "result": [
                {
                    "id": "9f2c...",
                    "score": 0.87,
                    "payload": {
                        "id": "c1",
                        "file_path": "src/a.rs",
                        "start_line": 1,
                        "end_line": 10,
                        "content": "fn a() {}",
                        "hash": "h",
                        "updated_at": "2026-01-15T10:00:00Z"
                    },
                    "vector": [0.1, 0.2]
                }
            ]
        }"#;
        let body: SearchResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(body.result.len(), 1);
        assert_eq!(body.result[0].payload.file_path, "src/a.rs");
        assert!((body.result[0].score - 0.87).abs() < 1e-6);
    }

    #[tokio::test]
    async fn document_sidecar_round_trip() {
        let dir = tempdir().unwrap();
        let cancel = CancellationToken::new();
        let config = RemoteStoreConfig {
            collection: Some("test".to_string()),
            ..remote_config()
        };

        {
            let store = RemoteStore::new(dir.path(), &config).unwrap();
            store
                .save_document(&Document {
                    path: "a.rs".to_string(),
                    hash: "h".to_string(),
                    mod_time: Utc::now(),
                    chunk_ids: vec!["c1".to_string()],
                })
                .await
                .unwrap();
            store.persist(&cancel).await.unwrap();
        }

        let store = RemoteStore::new(dir.path(), &config).unwrap();
        store.load(&cancel).await.unwrap();
        assert_eq!(store.list_documents().await.unwrap(), vec!["a.rs"]);
        let doc = store.get_document("a.rs").await.unwrap().unwrap();
        assert_eq!(doc.chunk_ids, vec!["c1"]);
    }
}
