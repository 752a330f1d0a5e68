use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{EmbedderErrorKind, Error, Result};

use super::{error_for_status, http_client, is_transient, Embedder, RETRY_ATTEMPTS, RETRY_BASE};

/// Inputs per request; larger batches are split transparently.
const MAX_BATCH: usize = 64;

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

/// Cloud provider speaking the OpenAI embeddings API. LM Studio and
/// OpenRouter share this request shape and differ only in base URL and
/// credentials.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
}

impl OpenAiEmbedder {
    pub fn new(
        url: &str,
        api_key: Option<String>,
        model: &str,
        dimensions: usize,
    ) -> Result<Self> {
        Ok(Self {
            client: http_client()?,
            url: url.trim_end_matches('/').to_string(),
            api_key,
            model: model.to_string(),
            dimensions,
        })
    }

    async fn embed_request(&self, input: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut attempt = 0u32;
        let body = loop {
            match self.send_once(input).await {
                Ok(body) => break body,
                Err(e) if attempt + 1 < RETRY_ATTEMPTS && is_transient(&e) => {
                    tokio::time::sleep(RETRY_BASE * 2u32.pow(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        // The API may answer out of order; `index` restores input order.
        let mut vectors: Vec<Option<Vec<f32>>> = vec![None; input.len()];
        for item in body.data {
            if item.index >= input.len() {
                return Err(Error::embedder(
                    EmbedderErrorKind::Protocol,
                    format!("embedding index {} out of range", item.index),
                ));
            }
            if item.embedding.len() != self.dimensions {
                return Err(Error::embedder(
                    EmbedderErrorKind::Dimensions,
                    format!(
                        "expected {} dimensions, got {}",
                        self.dimensions,
                        item.embedding.len()
                    ),
                ));
            }
            vectors[item.index] = Some(item.embedding);
        }

        vectors
            .into_iter()
            .map(|slot| {
                slot.ok_or_else(|| {
                    Error::embedder(EmbedderErrorKind::Protocol, "missing embedding in response")
                })
            })
            .collect()
    }

    async fn send_once(&self, input: &[String]) -> Result<EmbeddingResponse> {
        let mut request = self
            .client
            .post(format!("{}/embeddings", self.url))
            .json(&EmbeddingRequest {
                model: &self.model,
                input,
            });

        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::embedder(EmbedderErrorKind::Network, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_for_status(status, body));
        }

        response
            .json()
            .await
            .map_err(|e| Error::embedder(EmbedderErrorKind::Protocol, e.to_string()))
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors.into_iter().next().ok_or_else(|| {
            Error::embedder(EmbedderErrorKind::Protocol, "empty embedding response")
        })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(MAX_BATCH) {
            vectors.extend(self.embed_request(batch).await?);
        }
        Ok(vectors)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_shape_is_batched() {
        let input = vec!["a".to_string(), "b".to_string()];
        let request = EmbeddingRequest {
            model: "text-embedding-3-small",
            input: &input,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "text-embedding-3-small");
        assert_eq!(json["input"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn response_order_restored_by_index() {
        let raw = r#"{"data": [
            {"index": 1, "embedding": [0.0, 1.0]},
            {"index": 0, "embedding": [1.0, 0.0]}
        ]}"#;
        let body: EmbeddingResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(body.data.len(), 2);
        assert_eq!(body.data[0].index, 1);
    }

    #[test]
    fn declared_dimensions_reported() {
        let embedder =
            OpenAiEmbedder::new("https://api.openai.com/v1", None, "text-embedding-3-small", 1536)
                .unwrap();
        assert_eq!(embedder.dimensions(), 1536);
    }
}
