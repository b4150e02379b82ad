//! Shared test fixtures: an [`AppContext`] wired with the in-memory stores
//! and deterministic fake services, so the full pipeline runs with no
//! network and no model weights.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use atoll_core::types::{Job, JobKind, JobSummary, SparseVector};
use atoll_server::config::Config;
use atoll_server::crawl::{FetchedPage, PageFetcher};
use atoll_server::embed::{DenseEncoder, EmbedderRouter, Reranker, SparseEncoder};
use atoll_server::error::{Error, Result};
use atoll_server::jobs::ProgressReporter;
use atoll_server::meta::MetaStore;
use atoll_server::state::AppContext;
use atoll_server::vector::MemoryStore;

pub const DIM: usize = 16;

// ---------------------------------------------------------------------------
// Fake encoders
// ---------------------------------------------------------------------------

fn bucket(word: &str) -> usize {
    let mut h: u64 = 1469598103934665603;
    for b in word.bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(1099511628211);
    }
    (h % DIM as u64) as usize
}

/// Bag-of-words embedding: each lowercase word hashes into one of `DIM`
/// buckets. Cosine similarity then tracks term overlap, which is enough to
/// make relevance assertions deterministic.
pub fn embed_text(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIM];
    for word in text.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
        if word.len() > 1 {
            v[bucket(word)] += 1.0;
        }
    }
    v
}

pub struct FakeDense {
    pub fail: AtomicBool,
}

impl FakeDense {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeDense { fail: AtomicBool::new(false) })
    }
}

#[async_trait]
impl DenseEncoder for FakeDense {
    fn dim(&self) -> usize {
        DIM
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::EncoderFatal("encoder offline".into()));
        }
        Ok(texts.iter().map(|t| embed_text(t)).collect())
    }
}

pub struct FakeSparse;

#[async_trait]
impl SparseEncoder for FakeSparse {
    async fn encode(&self, texts: &[String]) -> Result<Vec<SparseVector>> {
        Ok(texts
            .iter()
            .map(|t| {
                let mut indices: Vec<u32> = t
                    .to_lowercase()
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|w| w.len() > 1)
                    .map(|w| bucket(w) as u32)
                    .collect();
                indices.sort_unstable();
                indices.dedup();
                let values = vec![1.0f32; indices.len()];
                SparseVector { indices, values }
            })
            .collect())
    }
}

/// Scores each document by shared words with the query; flip `fail` to
/// simulate an outage (502 / timeout).
pub struct FakeReranker {
    pub fail: AtomicBool,
}

impl FakeReranker {
    pub fn new() -> Arc<Self> {
        Arc::new(FakeReranker { fail: AtomicBool::new(false) })
    }
}

#[async_trait]
impl Reranker for FakeReranker {
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f64>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::EncoderFatal("reranker returned 502".into()));
        }
        let query_words: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        Ok(documents
            .iter()
            .map(|d| {
                let lower = d.to_lowercase();
                query_words.iter().filter(|w| lower.contains(*w)).count() as f64
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Fake page fetcher
// ---------------------------------------------------------------------------

/// Serves a canned site: URL → (html, outbound links).
pub struct FakeFetcher {
    pub pages: HashMap<String, (String, Vec<String>)>,
}

impl FakeFetcher {
    pub fn site(pages: &[(&str, &str, &[&str])]) -> Arc<Self> {
        let map = pages
            .iter()
            .map(|(url, html, links)| {
                (
                    url.to_string(),
                    (html.to_string(), links.iter().map(|l| l.to_string()).collect()),
                )
            })
            .collect();
        Arc::new(FakeFetcher { pages: map })
    }
}

#[async_trait]
impl PageFetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        match self.pages.get(url) {
            Some((html, links)) => Ok(FetchedPage {
                url: url.to_string(),
                status_code: 200,
                content: String::new(),
                html: Some(html.clone()),
                content_hash: None,
                links: links.clone(),
            }),
            None => Err(Error::SourceUnreadable(format!("404 for {url}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Context assembly
// ---------------------------------------------------------------------------

pub struct Fixture {
    pub ctx: Arc<AppContext>,
    pub dense: Arc<FakeDense>,
    pub reranker: Arc<FakeReranker>,
}

pub fn base_config() -> Config {
    let mut config = Config::default();
    config.crawl_auto_discovery = false;
    config.embedding_batch_size = 8;
    config.embedding_concurrency = 2;
    config
}

pub fn build_fixture(config: Config, fetcher: Arc<dyn PageFetcher>) -> Fixture {
    let dense = FakeDense::new();
    let reranker = FakeReranker::new();
    let sparse: Option<Arc<dyn SparseEncoder>> =
        if config.enable_hybrid_search { Some(Arc::new(FakeSparse)) } else { None };

    let router = Arc::new(EmbedderRouter::new(
        dense.clone(),
        dense.clone(),
        sparse,
        config.embedding_batch_size,
        config.embedding_concurrency,
    ));
    let rerank_port: Option<Arc<dyn Reranker>> = if config.enable_reranking {
        Some(reranker.clone())
    } else {
        None
    };

    let meta = MetaStore::open_in_memory().expect("in-memory store");
    let ctx = AppContext::new(
        config,
        meta,
        Arc::new(MemoryStore::new()),
        router,
        rerank_port,
        fetcher,
    );
    Fixture { ctx, dense, reranker }
}

pub fn fixture() -> Fixture {
    build_fixture(base_config(), FakeFetcher::site(&[]))
}

// ---------------------------------------------------------------------------
// Job driving
// ---------------------------------------------------------------------------

/// Enqueue + claim + run a job handler inline (no dispatcher task), the way
/// the dispatcher would.
pub async fn run_job(
    fixture: &Fixture,
    kind: JobKind,
    project: &str,
    dataset_id: &str,
    dedup: &str,
    payload: serde_json::Value,
) -> Result<(Job, JobSummary)> {
    let ctx = &fixture.ctx;
    let (_, created) = ctx.jobs.enqueue(kind, project, dataset_id, dedup, payload)?;
    assert!(created, "dedup collision in test setup");
    let job = ctx
        .meta
        .claim_next_job(kind)?
        .expect("job just enqueued must be claimable");

    let mut reporter = ProgressReporter::new(&job, ctx.meta.clone(), ctx.bus.clone());
    let cancel = CancellationToken::new();
    let result = match kind {
        JobKind::IngestLocal => {
            atoll_server::ingest::run_local_job(ctx, &job, &mut reporter, &cancel).await
        }
        JobKind::Reindex => {
            atoll_server::ingest::run_reindex_job(ctx, &job, &mut reporter, &cancel).await
        }
        JobKind::IngestRemoteRepo => {
            atoll_server::ingest::run_remote_repo_job(ctx, &job, &mut reporter, &cancel).await
        }
        JobKind::Crawl => {
            atoll_server::crawl::run_crawl_job(ctx, &job, &mut reporter, &cancel).await
        }
    };
    let summary = result?;
    ctx.meta.finish_job(
        &job.id,
        atoll_core::types::JobState::Succeeded,
        None,
        Some(&serde_json::to_value(&summary)?),
    )?;
    Ok((job, summary))
}
