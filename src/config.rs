use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Name of the per-project state directory.
pub const STATE_DIR: &str = ".grepai";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub embedder: EmbedderConfig,
    pub store: StoreConfig,
    pub search: SearchConfig,
    pub indexer: IndexerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderConfig {
    pub provider: String,
    pub ollama: OllamaConfig,
    pub openai: OpenAiConfig,
    pub lmstudio: LmStudioConfig,
    pub openrouter: OpenRouterConfig,
    pub synthetic: SyntheticConfig,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            ollama: OllamaConfig::default(),
            openai: OpenAiConfig::default(),
            lmstudio: LmStudioConfig::default(),
            openrouter: OpenRouterConfig::default(),
            synthetic: SyntheticConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    pub url: String,
    pub model: String,
    /// Optional cross-check; the provider reports its own dimensions on the
    /// first embedding call.
    pub dimensions: Option<usize>,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:11434".to_string(),
            model: "nomic-embed-text".to_string(),
            dimensions: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub dimensions: usize,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "text-embedding-3-small".to_string(),
            dimensions: 1536,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LmStudioConfig {
    pub url: String,
    pub model: String,
    pub dimensions: usize,
}

impl Default for LmStudioConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:1234/v1".to_string(),
            model: "text-embedding-nomic-embed-text-v1.5".to_string(),
            dimensions: 768,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenRouterConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub dimensions: usize,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            url: "https://openrouter.ai/api/v1".to_string(),
            api_key: None,
            model: "openai/text-embedding-3-small".to_string(),
            dimensions: 1536,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub dimensions: usize,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self { dimensions: 256 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: String,
    pub binary: BinaryStoreConfig,
    pub relational: RelationalStoreConfig,
    pub remote: RemoteStoreConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: "binary".to_string(),
            binary: BinaryStoreConfig::default(),
            relational: RelationalStoreConfig::default(),
            remote: RemoteStoreConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BinaryStoreConfig {
    /// Index file path, resolved against the project root when relative.
    pub path: String,
}

impl Default for BinaryStoreConfig {
    fn default() -> Self {
        Self {
            path: format!("{}/index.bin", STATE_DIR),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationalStoreConfig {
    /// SQLite database path, resolved against the project root when relative.
    pub path: String,
}

impl Default for RelationalStoreConfig {
    fn default() -> Self {
        Self {
            path: format!("{}/index.db", STATE_DIR),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteStoreConfig {
    pub endpoint: String,
    pub port: u16,
    pub tls: bool,
    /// Defaults to a name derived from the project root.
    pub collection: Option<String>,
    pub api_key: Option<String>,
}

impl Default for RemoteStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: "localhost".to_string(),
            port: 6333,
            tls: false,
            collection: None,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub hybrid: HybridConfig,
    pub boost: BoostConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridConfig {
    pub enabled: bool,
    /// Reciprocal-rank fusion constant.
    pub k: u32,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            k: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BoostConfig {
    pub filename: f32,
    pub symbol: f32,
    pub path_depth: f32,
    pub recency: f32,
}

impl Default for BoostConfig {
    fn default() -> Self {
        Self {
            filename: 0.15,
            symbol: 0.10,
            path_depth: 0.05,
            recency: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Chunk budget in estimated tokens (~4 characters each).
    pub chunk_size: usize,
    /// Context lines carried from the previous chunk into the next one.
    pub overlap_lines: usize,
    pub max_file_bytes: u64,
    /// Include globs; empty means everything the ignore rules let through.
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            overlap_lines: 1,
            max_file_bytes: 1024 * 1024,
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

impl Config {
    pub fn state_dir(root: &Path) -> PathBuf {
        root.join(STATE_DIR)
    }

    pub fn config_path(root: &Path) -> PathBuf {
        Self::state_dir(root).join("config.yaml")
    }

    /// Load `<root>/.grepai/config.yaml`, falling back to defaults when the
    /// file does not exist. `${VAR}` references in the document are replaced
    /// with the value of the environment variable before parsing; unset
    /// variables are left verbatim.
    pub fn load(root: &Path) -> Result<Self> {
        let path = Self::config_path(root);
        if !path.exists() {
            return Ok(Config::default());
        }

        let raw = fs::read_to_string(&path)?;
        let interpolated = interpolate_env(&raw);
        let config: Config = serde_yaml::from_str(&interpolated)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let dir = Self::state_dir(root);
        fs::create_dir_all(&dir)?;
        let content = serde_yaml::to_string(self)?;
        fs::write(Self::config_path(root), content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        const PROVIDERS: [&str; 5] = ["ollama", "openai", "lmstudio", "openrouter", "synthetic"];
        const BACKENDS: [&str; 3] = ["binary", "relational", "remote"];

        if !PROVIDERS.contains(&self.embedder.provider.as_str()) {
            return Err(Error::config(format!(
                "unknown embedder provider: {}",
                self.embedder.provider
            )));
        }
        if !BACKENDS.contains(&self.store.backend.as_str()) {
            return Err(Error::config(format!(
                "unknown store backend: {}",
                self.store.backend
            )));
        }
        if self.indexer.chunk_size == 0 {
            return Err(Error::config("indexer.chunk_size must be positive"));
        }
        Ok(())
    }
}

fn interpolate_env(raw: &str) -> String {
    let pattern = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static regex");
    pattern
        .replace_all(raw, |caps: &regex::Captures| {
            match std::env::var(&caps[1]) {
                Ok(value) => value,
                Err(_) => caps[0].to_string(),
            }
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.embedder.provider, "ollama");
        assert_eq!(config.store.backend, "binary");
        assert_eq!(config.indexer.chunk_size, 512);
        assert_eq!(config.indexer.overlap_lines, 1);
        assert_eq!(config.search.hybrid.k, 60);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let yaml = "embedder:\n  provider: synthetic\nindexer:\n  chunk_size: 128\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.embedder.provider, "synthetic");
        assert_eq!(config.indexer.chunk_size, 128);
        // Untouched sections keep their defaults.
        assert_eq!(config.store.backend, "binary");
        assert_eq!(config.indexer.max_file_bytes, 1024 * 1024);
    }

    #[test]
    fn env_interpolation_replaces_known_vars() {
        std::env::set_var("GREPAI_TEST_MODEL", "all-minilm");
        let raw = "embedder:\n  ollama:\n    model: ${GREPAI_TEST_MODEL}\n";
        let interpolated = interpolate_env(raw);
        assert!(interpolated.contains("model: all-minilm"));
        std::env::remove_var("GREPAI_TEST_MODEL");
    }

    #[test]
    fn env_interpolation_keeps_unset_vars() {
        let raw = "api_key: ${GREPAI_DEFINITELY_UNSET_VAR}\n";
        assert_eq!(interpolate_env(raw), raw);
    }

    #[test]
    fn unknown_provider_rejected() {
        let yaml = "embedder:\n  provider: bedrock\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn unknown_backend_rejected() {
        let yaml = "store:\n  backend: cassandra\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
