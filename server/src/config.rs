//! Runtime configuration.
//!
//! Defaults, overridden by an optional `atoll.toml`, overridden by
//! environment variables. The rest of the server only ever sees the parsed
//! [`Config`] value — nothing else reads the environment.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // --- embedding ---
    /// Max parallel in-flight encoder requests.
    pub embedding_concurrency: usize,
    /// Items per encoder request.
    pub embedding_batch_size: usize,
    pub enable_hybrid_search: bool,
    pub enable_reranking: bool,
    /// Fused candidates handed to the reranker before the final cut.
    pub rerank_initial_k: usize,
    pub hybrid_dense_weight: f64,
    pub hybrid_sparse_weight: f64,

    // --- crawling ---
    /// URLs per BFS batch within a depth level.
    pub crawl_batch_size: usize,
    /// In-flight page fetches.
    pub crawl_max_concurrent: usize,
    /// Throttle new dispatches while process RSS exceeds this share of
    /// system memory.
    pub memory_threshold_percent: f64,
    /// Probe sitemap/llms.txt locations before recursive crawls.
    pub crawl_auto_discovery: bool,

    // --- scoping & chunking ---
    pub auto_scope_enabled: bool,
    pub enable_symbol_extraction: bool,
    /// Files larger than this are skipped with a warning.
    pub max_file_bytes: u64,

    // --- external services ---
    pub text_encoder_url: String,
    /// Dimensionality of the text encoder family (checked against responses).
    pub text_encoder_dim: usize,
    pub code_encoder_url: String,
    pub code_encoder_dim: usize,
    pub sparse_encoder_url: String,
    pub reranker_url: String,
    pub page_fetcher_url: String,
    /// Qdrant-compatible endpoint; unset means the in-memory store.
    pub vector_store_url: Option<String>,

    // --- storage ---
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            embedding_concurrency: 16,
            embedding_batch_size: 32,
            enable_hybrid_search: false,
            enable_reranking: false,
            rerank_initial_k: 150,
            hybrid_dense_weight: 0.6,
            hybrid_sparse_weight: 0.4,
            crawl_batch_size: 50,
            crawl_max_concurrent: 10,
            memory_threshold_percent: 80.0,
            crawl_auto_discovery: true,
            auto_scope_enabled: true,
            enable_symbol_extraction: true,
            max_file_bytes: 1024 * 1024,
            text_encoder_url: "http://127.0.0.1:8801".to_string(),
            text_encoder_dim: 768,
            code_encoder_url: "http://127.0.0.1:8802".to_string(),
            code_encoder_dim: 768,
            sparse_encoder_url: "http://127.0.0.1:8803".to_string(),
            reranker_url: "http://127.0.0.1:8804".to_string(),
            page_fetcher_url: "http://127.0.0.1:8805".to_string(),
            vector_store_url: None,
            data_dir: default_data_dir(),
        }
    }
}

/// `~/.atoll`, or `./.atoll` when no home directory exists (containers).
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir().map(|h| h.join(".atoll")).unwrap_or_else(|| PathBuf::from(".atoll"))
}

impl Config {
    /// Load defaults → optional `atoll.toml` → environment overrides.
    pub fn load(config_file: Option<&Path>) -> Self {
        let mut config = match config_file {
            Some(path) => Self::from_toml(path),
            None => Config::default(),
        };
        config.apply_env();
        config
    }

    fn from_toml(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => match toml::from_str(&raw) {
                Ok(config) => config,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "invalid config file, using defaults");
                    Config::default()
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read config file, using defaults");
                Config::default()
            }
        }
    }

    /// Environment variables override everything. Unparseable values warn
    /// and keep the previous setting.
    pub fn apply_env(&mut self) {
        env_parse("EMBEDDING_CONCURRENCY", &mut self.embedding_concurrency);
        env_parse("EMBEDDING_BATCH_SIZE_PER_REQUEST", &mut self.embedding_batch_size);
        env_bool("ENABLE_HYBRID_SEARCH", &mut self.enable_hybrid_search);
        env_bool("ENABLE_RERANKING", &mut self.enable_reranking);
        env_parse("RERANK_INITIAL_K", &mut self.rerank_initial_k);
        env_parse("HYBRID_DENSE_WEIGHT", &mut self.hybrid_dense_weight);
        env_parse("HYBRID_SPARSE_WEIGHT", &mut self.hybrid_sparse_weight);
        env_parse("CRAWL_BATCH_SIZE", &mut self.crawl_batch_size);
        env_parse("CRAWL_MAX_CONCURRENT", &mut self.crawl_max_concurrent);
        env_parse("MEMORY_THRESHOLD_PERCENT", &mut self.memory_threshold_percent);
        env_bool("CRAWL_AUTO_DISCOVERY", &mut self.crawl_auto_discovery);
        env_bool("AUTO_SCOPE_ENABLED", &mut self.auto_scope_enabled);
        env_bool("ENABLE_SYMBOL_EXTRACTION", &mut self.enable_symbol_extraction);
        env_parse("MAX_FILE_BYTES", &mut self.max_file_bytes);

        env_string("TEXT_ENCODER_URL", &mut self.text_encoder_url);
        env_parse("TEXT_ENCODER_DIM", &mut self.text_encoder_dim);
        env_string("CODE_ENCODER_URL", &mut self.code_encoder_url);
        env_parse("CODE_ENCODER_DIM", &mut self.code_encoder_dim);
        env_string("SPARSE_ENCODER_URL", &mut self.sparse_encoder_url);
        env_string("RERANKER_URL", &mut self.reranker_url);
        env_string("PAGE_FETCHER_URL", &mut self.page_fetcher_url);
        if let Ok(v) = std::env::var("VECTOR_STORE_URL") {
            if !v.is_empty() {
                self.vector_store_url = Some(v);
            }
        }
        if let Ok(v) = std::env::var("ATOLL_DATA_DIR") {
            if !v.is_empty() {
                self.data_dir = PathBuf::from(v);
            }
        }
    }

    /// Path of the sqlite metadata database.
    pub fn meta_db_path(&self) -> PathBuf {
        self.data_dir.join("meta.db")
    }

    /// Where remote repositories are checked out before ingestion.
    pub fn repos_dir(&self) -> PathBuf {
        self.data_dir.join("repos")
    }
}

fn env_parse<T: FromStr>(key: &str, slot: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(_) => warn!(key, value = raw.as_str(), "unparseable env value ignored"),
        }
    }
}

fn env_bool(key: &str, slot: &mut bool) {
    if let Ok(raw) = std::env::var(key) {
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => *slot = true,
            "0" | "false" | "no" | "off" => *slot = false,
            _ => warn!(key, value = raw.as_str(), "unparseable env value ignored"),
        }
    }
}

fn env_string(key: &str, slot: &mut String) {
    if let Ok(v) = std::env::var(key) {
        if !v.is_empty() {
            *slot = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = Config::default();
        assert_eq!(c.embedding_concurrency, 16);
        assert_eq!(c.embedding_batch_size, 32);
        assert!(!c.enable_hybrid_search);
        assert!(!c.enable_reranking);
        assert_eq!(c.rerank_initial_k, 150);
        assert_eq!(c.crawl_batch_size, 50);
        assert_eq!(c.crawl_max_concurrent, 10);
        assert!((c.memory_threshold_percent - 80.0).abs() < f64::EPSILON);
        assert!(c.auto_scope_enabled);
        assert!(c.enable_symbol_extraction);
    }

    #[test]
    fn toml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("atoll.toml");
        std::fs::write(&path, "embedding_concurrency = 4\nenable_hybrid_search = true\n")
            .unwrap();
        let c = Config::from_toml(&path);
        assert_eq!(c.embedding_concurrency, 4);
        assert!(c.enable_hybrid_search);
        // untouched fields keep defaults
        assert_eq!(c.embedding_batch_size, 32);
    }

    #[test]
    fn invalid_toml_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("atoll.toml");
        std::fs::write(&path, "embedding_concurrency = [nope").unwrap();
        let c = Config::from_toml(&path);
        assert_eq!(c.embedding_concurrency, 16);
    }
}
