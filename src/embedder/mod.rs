mod ollama;
mod openai;
mod synthetic;

pub use ollama::OllamaEmbedder;
pub use openai::OpenAiEmbedder;
pub use synthetic::SyntheticEmbedder;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::EmbedderConfig;
use crate::error::{Error, Result};

/// Per-request timeout for embedding providers.
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Idle connections kept per host.
pub(crate) const POOL_MAX_IDLE: usize = 8;
/// Transient network failures are retried this many times total.
pub(crate) const RETRY_ATTEMPTS: u32 = 3;
/// Base delay for exponential backoff between retries.
pub(crate) const RETRY_BASE: Duration = Duration::from_millis(200);

/// Maps text to fixed-dimension vectors.
///
/// `embed_batch` preserves input order and hides any provider-side request
/// splitting. Every returned vector has exactly `dimensions()` entries.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Vector length this provider produces. May be 0 for providers that
    /// discover it on the first call.
    fn dimensions(&self) -> usize;

    /// Release provider resources. Further calls are not expected.
    async fn close(&self) {}
}

/// Instantiate the provider selected by config.
pub fn create_embedder(config: &EmbedderConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(&config.ollama)?)),
        "openai" => {
            let api_key = config
                .openai
                .api_key
                .clone()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok())
                .ok_or_else(|| {
                    Error::embedder(
                        crate::error::EmbedderErrorKind::Auth,
                        "no OpenAI API key configured",
                    )
                })?;
            Ok(Arc::new(OpenAiEmbedder::new(
                &config.openai.url,
                Some(api_key),
                &config.openai.model,
                config.openai.dimensions,
            )?))
        }
        "lmstudio" => Ok(Arc::new(OpenAiEmbedder::new(
            &config.lmstudio.url,
            None,
            &config.lmstudio.model,
            config.lmstudio.dimensions,
        )?)),
        "openrouter" => {
            let api_key = config
                .openrouter
                .api_key
                .clone()
                .or_else(|| std::env::var("OPENROUTER_API_KEY").ok())
                .ok_or_else(|| {
                    Error::embedder(
                        crate::error::EmbedderErrorKind::Auth,
                        "no OpenRouter API key configured",
                    )
                })?;
            Ok(Arc::new(OpenAiEmbedder::new(
                &config.openrouter.url,
                Some(api_key),
                &config.openrouter.model,
                config.openrouter.dimensions,
            )?))
        }
        "synthetic" => Ok(Arc::new(SyntheticEmbedder::new(
            config.synthetic.dimensions,
        ))),
        other => Err(Error::config(format!("unknown embedder provider: {other}"))),
    }
}

/// Rough token count used for usage statistics only, never for ranking.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

pub(crate) fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE)
        .build()
        .map_err(|e| {
            Error::embedder(crate::error::EmbedderErrorKind::Network, e.to_string())
        })
}

/// Map a non-success provider response to an error kind, surfacing the
/// provider's own message. 5xx and 408/429 are retryable network failures.
pub(crate) fn error_for_status(status: reqwest::StatusCode, body: String) -> Error {
    use crate::error::EmbedderErrorKind::{Auth, Network, Protocol};

    let kind = if status == reqwest::StatusCode::UNAUTHORIZED
        || status == reqwest::StatusCode::FORBIDDEN
    {
        Auth
    } else if status.is_server_error()
        || status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
    {
        Network
    } else {
        Protocol
    };
    Error::embedder(kind, format!("{status}: {body}"))
}

pub(crate) fn is_transient(error: &Error) -> bool {
    matches!(
        error,
        Error::Embedder {
            kind: crate::error::EmbedderErrorKind::Network,
            ..
        }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EmbedderErrorKind;

    #[test]
    fn estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens(&"x".repeat(2048)), 512);
    }

    #[test]
    fn factory_rejects_unknown_provider() {
        let mut config = EmbedderConfig::default();
        config.provider = "sagemaker".to_string();
        assert!(create_embedder(&config).is_err());
    }

    #[test]
    fn factory_builds_synthetic() {
        let mut config = EmbedderConfig::default();
        config.provider = "synthetic".to_string();
        let embedder = create_embedder(&config).unwrap();
        assert_eq!(embedder.dimensions(), 256);
    }

    #[test]
    fn openai_without_key_is_auth_error() {
        std::env::remove_var("OPENAI_API_KEY");
        let mut config = EmbedderConfig::default();
        config.provider = "openai".to_string();
        match create_embedder(&config).err() {
            Some(Error::Embedder { kind, .. }) => assert_eq!(kind, EmbedderErrorKind::Auth),
            other => panic!("expected auth error, got {other:?}"),
        }
    }

    #[test]
    fn transient_classification() {
        assert!(is_transient(&Error::embedder(
            EmbedderErrorKind::Network,
            "timeout"
        )));
        assert!(!is_transient(&Error::embedder(
            EmbedderErrorKind::Auth,
            "denied"
        )));
        assert!(!is_transient(&Error::store("x")));
    }
}
