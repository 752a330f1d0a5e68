use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::Result;

use super::Embedder;

/// Deterministic, network-free provider. Each token is feature-hashed into a
/// fixed bucket, so texts sharing vocabulary land near each other under
/// cosine similarity. Useful for tests and air-gapped setups.
pub struct SyntheticEmbedder {
    dimensions: usize,
}

impl SyntheticEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];

        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            vector[token_bucket(token, self.dimensions)] += 1.0;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in vector.iter_mut() {
                *x /= norm;
            }
        }
        vector
    }
}

fn token_bucket(token: &str, dimensions: usize) -> usize {
    // Stable across runs and platforms, unlike the std hasher.
    let digest = Sha256::digest(token.as_bytes());
    let mut value = [0u8; 8];
    value.copy_from_slice(&digest[..8]);
    (u64::from_le_bytes(value) % dimensions as u64) as usize
}

#[async_trait]
impl Embedder for SyntheticEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.vector_for(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}
