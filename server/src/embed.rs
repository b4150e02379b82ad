//! Embedder router — routes each chunk to one of two dense encoder
//! families, computes optional sparse vectors, and talks to the external
//! encoder services.
//!
//! The router is not an encoder: it owns two [`DenseEncoder`] handles plus a
//! routing function. Batches fan out with bounded concurrency; individual
//! encoder failures drop their chunks (the coordinator applies the failure
//! budget), and a sparse-encoder outage degrades to dense-only.

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use atoll_core::types::{SparseVector, SymbolKind};

use crate::error::{Error, Result};

/// Per-request encoder timeout; calls retry 3× with jittered backoff.
pub const ENCODER_TIMEOUT: Duration = Duration::from_secs(30);
const ENCODER_RETRIES: u32 = 3;
const BACKOFF_BASE_MS: u64 = 250;
const BACKOFF_CAP_MS: u64 = 4_000;

/// Rerankers get one shot with a short deadline — queries are waiting.
pub const RERANK_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// Which dense encoder a chunk (or collection) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncoderFamily {
    Text,
    Code,
}

impl EncoderFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncoderFamily::Text => "text",
            EncoderFamily::Code => "code",
        }
    }

    pub fn from_str(raw: &str) -> EncoderFamily {
        if raw == "code" {
            EncoderFamily::Code
        } else {
            EncoderFamily::Text
        }
    }
}

#[async_trait]
pub trait DenseEncoder: Send + Sync {
    fn dim(&self) -> usize;
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

#[async_trait]
pub trait SparseEncoder: Send + Sync {
    async fn encode(&self, texts: &[String]) -> Result<Vec<SparseVector>>;
}

#[async_trait]
pub trait Reranker: Send + Sync {
    /// Scores aligned to `documents` order.
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f64>>;
}

/// Route by content class: recognized code extension or a code-ish symbol
/// kind goes to the code encoder, everything else to text.
pub fn family_for(path: &str, symbol_kind: Option<SymbolKind>) -> EncoderFamily {
    let ext = path.rsplit_once('.').map(|(_, e)| e).unwrap_or("");
    if crate::chunk::is_code_extension(ext) {
        return EncoderFamily::Code;
    }
    match symbol_kind {
        Some(kind) if kind.is_code() => EncoderFamily::Code,
        _ => EncoderFamily::Text,
    }
}

/// Scale to unit L2 norm in place; zero vectors stay zero.
pub fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

// ---------------------------------------------------------------------------
// Retry with jittered exponential backoff
// ---------------------------------------------------------------------------

fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE_MS.saturating_mul(1 << (attempt - 1).min(6));
    let capped = exp.min(BACKOFF_CAP_MS);
    // Cheap jitter from the clock; good enough to de-synchronize retries.
    let jitter = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64 % 100)
        .unwrap_or(0);
    Duration::from_millis(capped + jitter)
}

async fn with_retries<T, F, Fut>(what: &str, attempts: u32, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last = None;
    for attempt in 1..=attempts {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt < attempts {
                    let delay = backoff_delay(attempt);
                    debug!(what, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying");
                    tokio::time::sleep(delay).await;
                }
                last = Some(e);
            }
        }
    }
    Err(last.unwrap_or_else(|| Error::EncoderFatal(format!("{what}: no attempts made"))))
}

// ---------------------------------------------------------------------------
// HTTP encoder clients
// ---------------------------------------------------------------------------

pub struct HttpDenseEncoder {
    client: reqwest::Client,
    base_url: String,
    dim: usize,
}

#[derive(Deserialize)]
struct EmbedResponse {
    vectors: Vec<Vec<f32>>,
    dim: usize,
}

impl HttpDenseEncoder {
    pub fn new(base_url: &str, dim: usize) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(ENCODER_TIMEOUT).build()?;
        Ok(HttpDenseEncoder {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            dim,
        })
    }
}

#[async_trait]
impl DenseEncoder for HttpDenseEncoder {
    fn dim(&self) -> usize {
        self.dim
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embed", self.base_url);
        let body = serde_json::json!({ "texts": texts });
        let resp: EmbedResponse = with_retries("dense encode", ENCODER_RETRIES, || async {
            let resp = self.client.post(&url).json(&body).send().await?;
            if !resp.status().is_success() {
                return Err(Error::EncoderFatal(format!(
                    "encoder {} returned {}",
                    self.base_url,
                    resp.status()
                )));
            }
            Ok(resp.json::<EmbedResponse>().await?)
        })
        .await?;

        if resp.dim != self.dim {
            return Err(Error::EncoderFatal(format!(
                "encoder {} reports dim {}, expected {}",
                self.base_url, resp.dim, self.dim
            )));
        }
        if resp.vectors.len() != texts.len() {
            return Err(Error::EncoderFatal(format!(
                "encoder {} returned {} vectors for {} texts",
                self.base_url,
                resp.vectors.len(),
                texts.len()
            )));
        }
        Ok(resp.vectors)
    }
}

pub struct HttpSparseEncoder {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct SparseResponse {
    sparse: Vec<SparseVector>,
}

impl HttpSparseEncoder {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(ENCODER_TIMEOUT).build()?;
        Ok(HttpSparseEncoder { client, base_url: base_url.trim_end_matches('/').to_string() })
    }
}

#[async_trait]
impl SparseEncoder for HttpSparseEncoder {
    async fn encode(&self, texts: &[String]) -> Result<Vec<SparseVector>> {
        let url = format!("{}/sparse/batch", self.base_url);
        let body = serde_json::json!({ "texts": texts });
        let resp: SparseResponse = with_retries("sparse encode", ENCODER_RETRIES, || async {
            let resp = self.client.post(&url).json(&body).send().await?;
            if !resp.status().is_success() {
                return Err(Error::EncoderFatal(format!(
                    "sparse encoder returned {}",
                    resp.status()
                )));
            }
            Ok(resp.json::<SparseResponse>().await?)
        })
        .await?;

        if resp.sparse.len() != texts.len() {
            return Err(Error::EncoderFatal(format!(
                "sparse encoder returned {} vectors for {} texts",
                resp.sparse.len(),
                texts.len()
            )));
        }
        Ok(resp.sparse)
    }
}

pub struct HttpReranker {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct RerankResponse {
    scores: Vec<f64>,
}

impl HttpReranker {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(RERANK_TIMEOUT).build()?;
        Ok(HttpReranker { client, base_url: base_url.trim_end_matches('/').to_string() })
    }
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f64>> {
        // No retry: the query path would rather degrade than wait.
        let url = format!("{}/rerank", self.base_url);
        let body = serde_json::json!({ "query": query, "documents": documents });
        let resp = self.client.post(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(Error::EncoderFatal(format!("reranker returned {}", resp.status())));
        }
        let parsed: RerankResponse = resp.json().await?;
        if parsed.scores.len() != documents.len() {
            return Err(Error::EncoderFatal(format!(
                "reranker returned {} scores for {} documents",
                parsed.scores.len(),
                documents.len()
            )));
        }
        Ok(parsed.scores)
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// One chunk's text plus its routing class, as the coordinator hands it in.
#[derive(Debug, Clone)]
pub struct EmbedRequest {
    pub content: String,
    pub family: EncoderFamily,
}

/// Vectors for one input, positionally aligned with the request slice.
/// `None` where the encoder ultimately failed (those chunks are dropped
/// from the upsert and counted by the caller).
#[derive(Debug)]
pub struct EmbedOutcome {
    pub dense: Vec<Option<Vec<f32>>>,
    pub sparse: Vec<Option<SparseVector>>,
    pub failed: usize,
    /// Sparse encoder went down mid-job; dense results are still good.
    pub sparse_degraded: bool,
}

pub struct EmbedderRouter {
    text: Arc<dyn DenseEncoder>,
    code: Arc<dyn DenseEncoder>,
    sparse: Option<Arc<dyn SparseEncoder>>,
    batch_size: usize,
    concurrency: usize,
}

impl EmbedderRouter {
    pub fn new(
        text: Arc<dyn DenseEncoder>,
        code: Arc<dyn DenseEncoder>,
        sparse: Option<Arc<dyn SparseEncoder>>,
        batch_size: usize,
        concurrency: usize,
    ) -> Self {
        EmbedderRouter {
            text,
            code,
            sparse,
            batch_size: batch_size.max(1),
            concurrency: concurrency.max(1),
        }
    }

    pub fn encoder(&self, family: EncoderFamily) -> &Arc<dyn DenseEncoder> {
        match family {
            EncoderFamily::Text => &self.text,
            EncoderFamily::Code => &self.code,
        }
    }

    pub fn dim(&self, family: EncoderFamily) -> usize {
        self.encoder(family).dim()
    }

    pub fn sparse_enabled(&self) -> bool {
        self.sparse.is_some()
    }

    /// Embed a whole batch of chunks: dense per routing family, sparse when
    /// the hybrid flag wired a sparse encoder in. Cancellation is honored
    /// between request waves.
    pub async fn embed_all(
        &self,
        requests: &[EmbedRequest],
        cancel: &CancellationToken,
    ) -> Result<EmbedOutcome> {
        let mut outcome = EmbedOutcome {
            dense: vec![None; requests.len()],
            sparse: vec![None; requests.len()],
            failed: 0,
            sparse_degraded: false,
        };
        if requests.is_empty() {
            return Ok(outcome);
        }

        // (encoder, indices of one request batch)
        let mut batches: Vec<(EncoderFamily, Vec<usize>)> = Vec::new();
        for family in [EncoderFamily::Text, EncoderFamily::Code] {
            let indices: Vec<usize> = requests
                .iter()
                .enumerate()
                .filter(|(_, r)| r.family == family)
                .map(|(i, _)| i)
                .collect();
            for batch in indices.chunks(self.batch_size) {
                batches.push((family, batch.to_vec()));
            }
        }

        // Bounded fan-out: at most `concurrency` requests in flight.
        let mut in_flight = FuturesUnordered::new();
        let mut queued = batches.into_iter();
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            while in_flight.len() < self.concurrency {
                match queued.next() {
                    Some((family, indices)) => {
                        let encoder = Arc::clone(self.encoder(family));
                        let texts: Vec<String> =
                            indices.iter().map(|&i| requests[i].content.clone()).collect();
                        in_flight.push(async move {
                            let result = encoder.embed(&texts).await;
                            (indices, result)
                        });
                    }
                    None => break,
                }
            }
            match in_flight.next().await {
                Some((indices, Ok(mut vectors))) => {
                    for (slot, vector) in indices.iter().zip(vectors.iter_mut()) {
                        normalize(vector);
                        outcome.dense[*slot] = Some(std::mem::take(vector));
                    }
                }
                Some((indices, Err(e))) => {
                    warn!(error = %e, dropped = indices.len(), "embedding batch failed");
                    outcome.failed += indices.len();
                }
                None => break,
            }
        }

        // Sparse pass over everything that embedded densely.
        if let Some(sparse) = &self.sparse {
            let alive: Vec<usize> =
                (0..requests.len()).filter(|&i| outcome.dense[i].is_some()).collect();
            for batch in alive.chunks(self.batch_size) {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let texts: Vec<String> =
                    batch.iter().map(|&i| requests[i].content.clone()).collect();
                match sparse.encode(&texts).await {
                    Ok(vectors) => {
                        for (slot, vector) in batch.iter().zip(vectors) {
                            outcome.sparse[*slot] = Some(vector);
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "sparse encoder unavailable, continuing dense-only");
                        outcome.sparse_degraded = true;
                        break;
                    }
                }
            }
        }

        Ok(outcome)
    }

    /// Embed a query string for one encoder family.
    pub async fn embed_query(&self, query: &str, family: EncoderFamily) -> Result<Vec<f32>> {
        let mut vectors = self.encoder(family).embed(&[query.to_string()]).await?;
        let mut vector = vectors
            .pop()
            .ok_or_else(|| Error::EncoderFatal("encoder returned no query vector".into()))?;
        normalize(&mut vector);
        Ok(vector)
    }

    /// Sparse query vector; `None` (with a log line) when the encoder is
    /// down — hybrid queries fall back to dense-only.
    pub async fn sparse_query(&self, query: &str) -> Option<SparseVector> {
        let sparse = self.sparse.as_ref()?;
        match sparse.encode(&[query.to_string()]).await {
            Ok(mut vectors) => vectors.pop(),
            Err(e) => {
                warn!(error = %e, "sparse query encoding failed, dense-only");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeDense {
        dim: usize,
        calls: AtomicUsize,
        batch_sizes: Mutex<Vec<usize>>,
        fail: bool,
    }

    impl FakeDense {
        fn new(dim: usize, fail: bool) -> Arc<Self> {
            Arc::new(FakeDense {
                dim,
                calls: AtomicUsize::new(0),
                batch_sizes: Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    #[async_trait]
    impl DenseEncoder for FakeDense {
        fn dim(&self) -> usize {
            self.dim
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batch_sizes.lock().unwrap().push(texts.len());
            if self.fail {
                return Err(Error::EncoderFatal("down".into()));
            }
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    struct FakeSparse {
        fail: bool,
    }

    #[async_trait]
    impl SparseEncoder for FakeSparse {
        async fn encode(&self, texts: &[String]) -> Result<Vec<SparseVector>> {
            if self.fail {
                return Err(Error::EncoderFatal("down".into()));
            }
            Ok(texts
                .iter()
                .map(|_| SparseVector { indices: vec![1], values: vec![1.0] })
                .collect())
        }
    }

    fn requests(n: usize, family: EncoderFamily) -> Vec<EmbedRequest> {
        (0..n)
            .map(|i| EmbedRequest { content: format!("text {i}"), family })
            .collect()
    }

    #[test]
    fn routing_by_extension_and_symbol() {
        assert_eq!(family_for("src/main.rs", None), EncoderFamily::Code);
        assert_eq!(family_for("docs/guide.md", None), EncoderFamily::Text);
        assert_eq!(
            family_for("notes.txt", Some(SymbolKind::Function)),
            EncoderFamily::Code,
            "symbol kind promotes to code"
        );
        assert_eq!(family_for("notes.txt", Some(SymbolKind::Variable)), EncoderFamily::Text);
    }

    #[test]
    fn normalization_produces_unit_vectors() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[tokio::test]
    async fn batches_respect_size_and_results_align() {
        let text = FakeDense::new(2, false);
        let code = FakeDense::new(2, false);
        let router = EmbedderRouter::new(
            text.clone(),
            code.clone(),
            None,
            4,
            2,
        );

        let reqs = requests(10, EncoderFamily::Text);
        let outcome = router.embed_all(&reqs, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.failed, 0);
        assert!(outcome.dense.iter().all(|d| d.is_some()));
        let sizes = text.batch_sizes.lock().unwrap().clone();
        assert!(sizes.iter().all(|&s| s <= 4));
        assert_eq!(sizes.iter().sum::<usize>(), 10);
        assert_eq!(code.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_family_drops_only_its_chunks() {
        let text = FakeDense::new(2, false);
        let code = FakeDense::new(2, true);
        let router = EmbedderRouter::new(
            text,
            code,
            None,
            8,
            2,
        );

        let mut reqs = requests(3, EncoderFamily::Text);
        reqs.extend(requests(2, EncoderFamily::Code));
        let outcome = router.embed_all(&reqs, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.failed, 2);
        assert!(outcome.dense[0].is_some());
        assert!(outcome.dense[3].is_none());
        assert!(outcome.dense[4].is_none());
    }

    #[tokio::test]
    async fn sparse_outage_degrades_not_fails() {
        let text = FakeDense::new(2, false);
        let code = FakeDense::new(2, false);
        let router = EmbedderRouter::new(
            text,
            code,
            Some(Arc::new(FakeSparse { fail: true })),
            8,
            2,
        );

        let reqs = requests(3, EncoderFamily::Text);
        let outcome = router.embed_all(&reqs, &CancellationToken::new()).await.unwrap();
        assert!(outcome.sparse_degraded);
        assert_eq!(outcome.failed, 0);
        assert!(outcome.sparse.iter().all(|s| s.is_none()));
    }

    #[tokio::test]
    async fn sparse_vectors_attach_when_available() {
        let text = FakeDense::new(2, false);
        let code = FakeDense::new(2, false);
        let router = EmbedderRouter::new(
            text,
            code,
            Some(Arc::new(FakeSparse { fail: false })),
            8,
            2,
        );

        let reqs = requests(3, EncoderFamily::Text);
        let outcome = router.embed_all(&reqs, &CancellationToken::new()).await.unwrap();
        assert!(!outcome.sparse_degraded);
        assert!(outcome.sparse.iter().all(|s| s.is_some()));
    }

    #[tokio::test]
    async fn cancellation_aborts_embedding() {
        let text = FakeDense::new(2, false);
        let code = FakeDense::new(2, false);
        let router = EmbedderRouter::new(
            text,
            code,
            None,
            1,
            1,
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = router.embed_all(&requests(4, EncoderFamily::Text), &cancel).await;
        assert!(matches!(err, Err(Error::Cancelled)));
    }
}
