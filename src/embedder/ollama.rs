use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::OllamaConfig;
use crate::error::{EmbedderErrorKind, Error, Result};

use super::{error_for_status, http_client, is_transient, Embedder, RETRY_ATTEMPTS, RETRY_BASE};

/// Concurrent in-flight requests while embedding a batch.
const BATCH_WORKERS: usize = 8;

#[derive(Debug, Serialize)]
struct OllamaEmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

/// Local HTTP provider speaking the Ollama embeddings API: one request per
/// text, vector length discovered on the first call.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    declared: Option<usize>,
    discovered: AtomicUsize,
}

impl OllamaEmbedder {
    pub fn new(config: &OllamaConfig) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            declared: config.dimensions,
            discovered: AtomicUsize::new(0),
        })
    }

    fn check_dimensions(&self, vector: &[f32]) -> Result<()> {
        if let Some(declared) = self.declared {
            if vector.len() != declared {
                return Err(Error::embedder(
                    EmbedderErrorKind::Dimensions,
                    format!("expected {declared} dimensions, got {}", vector.len()),
                ));
            }
        }
        let known = self.discovered.load(Ordering::Relaxed);
        if known == 0 {
            self.discovered.store(vector.len(), Ordering::Relaxed);
        } else if vector.len() != known {
            return Err(Error::embedder(
                EmbedderErrorKind::Dimensions,
                format!("expected {known} dimensions, got {}", vector.len()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let vector = fetch_embedding(&self.client, &self.url, &self.model, text).await?;
        self.check_dimensions(&vector)?;
        Ok(vector)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let semaphore = Arc::new(Semaphore::new(BATCH_WORKERS));
        let mut tasks: JoinSet<(usize, Result<Vec<f32>>)> = JoinSet::new();

        for (i, text) in texts.iter().enumerate() {
            let semaphore = semaphore.clone();
            let client = self.client.clone();
            let url = self.url.clone();
            let model = self.model.clone();
            let prompt = text.clone();

            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => {
                        return (
                            i,
                            Err(Error::embedder(
                                EmbedderErrorKind::Network,
                                "embedding worker pool closed",
                            )),
                        )
                    }
                };
                (i, fetch_embedding(&client, &url, &model, &prompt).await)
            });
        }

        // Results land by index so the output order matches the input.
        let mut out: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        while let Some(joined) = tasks.join_next().await {
            let (i, result) = joined
                .map_err(|e| Error::embedder(EmbedderErrorKind::Network, e.to_string()))?;
            out[i] = Some(result?);
        }

        let mut vectors = Vec::with_capacity(texts.len());
        for slot in out {
            let vector = slot.ok_or_else(|| {
                Error::embedder(EmbedderErrorKind::Protocol, "missing embedding in batch")
            })?;
            self.check_dimensions(&vector)?;
            vectors.push(vector);
        }
        Ok(vectors)
    }

    fn dimensions(&self) -> usize {
        self.declared
            .unwrap_or_else(|| self.discovered.load(Ordering::Relaxed))
    }
}

async fn fetch_embedding(
    client: &reqwest::Client,
    url: &str,
    model: &str,
    prompt: &str,
) -> Result<Vec<f32>> {
    let mut attempt = 0u32;
    loop {
        match fetch_once(client, url, model, prompt).await {
            Ok(vector) => return Ok(vector),
            Err(e) if attempt + 1 < RETRY_ATTEMPTS && is_transient(&e) => {
                tokio::time::sleep(RETRY_BASE * 2u32.pow(attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn fetch_once(
    client: &reqwest::Client,
    url: &str,
    model: &str,
    prompt: &str,
) -> Result<Vec<f32>> {
    let response = client
        .post(format!("{url}/api/embeddings"))
        .json(&OllamaEmbeddingRequest { model, prompt })
        .send()
        .await
        .map_err(|e| Error::embedder(EmbedderErrorKind::Network, e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(error_for_status(status, body));
    }

    let body: OllamaEmbeddingResponse = response
        .json()
        .await
        .map_err(|e| Error::embedder(EmbedderErrorKind::Protocol, e.to_string()))?;
    Ok(body.embedding)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_shape() {
        let request = OllamaEmbeddingRequest {
            model: "nomic-embed-text",
            prompt: "fn main() {}",
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "nomic-embed-text");
        assert_eq!(json["prompt"], "fn main() {}");
    }

    #[test]
    fn response_shape() {
        let body: OllamaEmbeddingResponse =
            serde_json::from_str(r#"{"embedding": [0.1, -0.5, 0.25]}"#).unwrap();
        assert_eq!(body.embedding, vec![0.1, -0.5, 0.25]);
    }

    #[test]
    fn dimensions_discovered_then_enforced() {
        let embedder = OllamaEmbedder::new(&OllamaConfig::default()).unwrap();
        assert_eq!(embedder.dimensions(), 0);

        embedder.check_dimensions(&[0.0; 4]).unwrap();
        assert_eq!(embedder.dimensions(), 4);

        let err = embedder.check_dimensions(&[0.0; 8]).unwrap_err();
        assert!(matches!(
            err,
            Error::Embedder {
                kind: EmbedderErrorKind::Dimensions,
                ..
            }
        ));
    }

    #[test]
    fn declared_dimensions_cross_checked() {
        let config = OllamaConfig {
            dimensions: Some(4),
            ..OllamaConfig::default()
        };
        let embedder = OllamaEmbedder::new(&config).unwrap();
        assert_eq!(embedder.dimensions(), 4);
        assert!(embedder.check_dimensions(&[0.0; 3]).is_err());
    }
}
