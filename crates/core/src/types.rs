use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Tenancy: projects, datasets, collections
// ---------------------------------------------------------------------------

/// Visibility scope of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetScope {
    /// Readable from any project when the caller opts in.
    Global,
    /// Owned by and visible to a single project (the default).
    Project,
    /// Bound to a local working copy; never shared.
    Local,
}

impl DatasetScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetScope::Global => "global",
            DatasetScope::Project => "project",
            DatasetScope::Local => "local",
        }
    }
}

/// A tenant. Created lazily on first reference, never merged or auto-deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    /// Unique, case-insensitive.
    pub name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// A named partition inside a project. Unique by `(project_id, name)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub scope: DatasetScope,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Binding of a dataset to a physical vector collection. A dataset may map
/// to multiple collections; the collection name is the canonical handle the
/// vector store knows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetCollection {
    pub dataset_id: String,
    pub collection_name: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Chunks and symbols
// ---------------------------------------------------------------------------

/// The kind of a code symbol attached to a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolKind {
    Function,
    Class,
    Method,
    Interface,
    Variable,
    Constant,
    Module,
    Other,
}

impl SymbolKind {
    pub fn label(&self) -> &'static str {
        match self {
            SymbolKind::Function => "function",
            SymbolKind::Class => "class",
            SymbolKind::Method => "method",
            SymbolKind::Interface => "interface",
            SymbolKind::Variable => "variable",
            SymbolKind::Constant => "constant",
            SymbolKind::Module => "module",
            SymbolKind::Other => "other",
        }
    }

    /// Kinds that mark a chunk as code for encoder routing.
    pub fn is_code(&self) -> bool {
        matches!(
            self,
            SymbolKind::Function | SymbolKind::Class | SymbolKind::Method | SymbolKind::Interface
        )
    }
}

/// Declaration metadata extracted from the syntax tree for a code chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Enclosing declaration (e.g. a method's class), if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docstring: Option<String>,
}

/// Sparse vector as `{indices, values}` pairs, aligned by position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseVector {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

impl SparseVector {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// A retrieval unit: a span of content plus provenance and symbol metadata.
/// Identity is content-derived (see [`crate::hash::chunk_id`]), so
/// re-indexing identical content is idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub project_id: String,
    pub dataset_id: String,
    pub collection_name: String,
    pub content: String,
    /// 1-based, inclusive. For prose, char offsets converted to line
    /// equivalents (line 1 == byte offset 0).
    pub start_line: usize,
    pub end_line: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    pub relative_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    /// SHA-256 of the full source file this chunk was cut from.
    pub file_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sparse_vector: Option<SparseVector>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<Symbol>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Incremental-sync state for one source file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub project_id: String,
    pub dataset_id: String,
    pub relative_path: String,
    pub file_hash: String,
    pub chunk_ids: Vec<String>,
    pub indexed_at: DateTime<Utc>,
}

/// Per-URL crawl provenance, keyed by normalized URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebPageProvenance {
    pub url: String,
    pub domain: String,
    pub first_indexed_at: DateTime<Utc>,
    pub last_indexed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified_at: Option<DateTime<Utc>>,
    pub content_hash: String,
    pub version: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    IngestLocal,
    IngestRemoteRepo,
    Crawl,
    Reindex,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::IngestLocal => "ingest_local",
            JobKind::IngestRemoteRepo => "ingest_remote_repo",
            JobKind::Crawl => "crawl",
            JobKind::Reindex => "reindex",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Skipped => "skipped",
            JobState::Cancelled => "cancelled",
        }
    }

    /// Terminal states are immutable: a job transitions into one exactly once.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Skipped | JobState::Cancelled
        )
    }
}

/// Phase-local progress. The global fraction in [0, 1] never decreases
/// within one job (the mapper clamps regressions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub phase: String,
    pub fraction: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Default for Progress {
    fn default() -> Self {
        Progress { phase: "queued".to_string(), fraction: 0.0, detail: None }
    }
}

/// A durable unit of work. `dedup_key` admits at most one non-terminal job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub project_id: String,
    pub dataset_id: String,
    pub state: JobState,
    pub dedup_key: String,
    pub payload: serde_json::Value,
    pub progress: Progress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Summary attached to a finished ingestion or crawl job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSummary {
    pub files: usize,
    pub chunks: usize,
    #[serde(default)]
    pub pages: usize,
    #[serde(default)]
    pub removed: usize,
    #[serde(default)]
    pub soft_errors: Vec<String>,
}

// ---------------------------------------------------------------------------
// Crawl sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlMode {
    /// Fetch only the seed URL.
    Single,
    /// Enumerate robots.txt / sitemaps and fetch every listed URL up to the cap.
    Sitemap,
    /// Breadth-first, depth-limited, same-domain by default.
    Recursive,
}

impl CrawlMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlMode::Single => "single",
            CrawlMode::Sitemap => "sitemap",
            CrawlMode::Recursive => "recursive",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlStats {
    pub pages_fetched: usize,
    pub pages_skipped: usize,
    pub errors: usize,
    pub depth_reached: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlSession {
    pub id: String,
    pub project_id: String,
    pub dataset_id: String,
    pub seed_url: String,
    pub mode: CrawlMode,
    pub max_pages: usize,
    pub max_depth: usize,
    pub status: JobState,
    pub stats: CrawlStats,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Query wire types (shared by the HTTP API and the CLI)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datasets: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(default)]
    pub include_global: bool,
}

/// One ranked hit: the chunk plus its fused (or reranked) score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredChunk {
    #[serde(flatten)]
    pub chunk: Chunk,
    pub score: f64,
}

/// Which optional features actually ran for a query.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FeaturesUsed {
    pub hybrid: bool,
    pub rerank: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryMeta {
    pub features_used: FeaturesUsed,
    /// True when any collection failed or any optional feature degraded.
    pub partial: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degradation: Vec<String>,
    pub latency_ms: u64,
    pub collections_searched: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub results: Vec<ScoredChunk>,
    pub meta: QueryMeta,
}

/// Per-project storage totals served by `projects.stats`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectStats {
    pub project_id: String,
    pub datasets: usize,
    pub collections: usize,
    pub files: usize,
    pub chunks: usize,
    pub pages: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_terminality() {
        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Running.is_terminal());
        for s in [JobState::Succeeded, JobState::Failed, JobState::Skipped, JobState::Cancelled] {
            assert!(s.is_terminal());
        }
    }

    #[test]
    fn symbol_kind_code_routing() {
        assert!(SymbolKind::Function.is_code());
        assert!(SymbolKind::Interface.is_code());
        assert!(!SymbolKind::Variable.is_code());
        assert!(!SymbolKind::Module.is_code());
    }

    #[test]
    fn enums_serialize_snake_case() {
        assert_eq!(serde_json::to_string(&JobKind::IngestRemoteRepo).unwrap(), "\"ingest_remote_repo\"");
        assert_eq!(serde_json::to_string(&DatasetScope::Global).unwrap(), "\"global\"");
        assert_eq!(serde_json::to_string(&CrawlMode::Recursive).unwrap(), "\"recursive\"");
    }
}
