//! Retrieval engine — project-scoped hybrid search with cross-collection
//! fusion and optional reranking.
//!
//! Scope resolution comes first and is absolute: only collections bound to
//! the caller's project (plus global datasets on explicit opt-in) are ever
//! queried. Each collection is searched with the query embedding matching
//! its pinned encoder family; per-collection ranked lists fuse via RRF.
//! Optional features degrade instead of failing — the response metadata
//! records what actually ran.

use chrono::Utc;
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use atoll_core::fusion::{rrf_fuse, RankedList, RRF_K};
use atoll_core::types::{Chunk, QueryMeta, QueryRequest, QueryResponse, ScoredChunk};

use crate::bus::EventKind;
use crate::embed::EncoderFamily;
use crate::error::{Error, Result};
use crate::meta::CollectionBinding;
use crate::state::AppContext;
use crate::vector::{Filter, SearchHit};

/// Results returned when the caller does not say otherwise.
pub const DEFAULT_TOP_K: usize = 10;

/// A collection scheduled for fan-out, with the scope filter it gets.
struct Target {
    binding: CollectionBinding,
    /// Global datasets are filtered by dataset only — their rows belong to
    /// another project on purpose.
    global: bool,
}

pub async fn run_query(ctx: &Arc<AppContext>, req: QueryRequest) -> Result<QueryResponse> {
    if req.query.trim().is_empty() {
        return Err(Error::InvalidInput("query must not be empty".into()));
    }
    let started = Instant::now();
    let top_k = req.top_k.unwrap_or(DEFAULT_TOP_K).max(1);

    let mut meta = QueryMeta::default();

    // --- scope resolution --------------------------------------------------
    let mut targets: Vec<Target> = ctx
        .meta
        .collections_for_project(&req.project, req.datasets.as_deref())?
        .into_iter()
        .map(|binding| Target { binding, global: false })
        .collect();

    if req.include_global {
        let owned: HashSet<String> =
            targets.iter().map(|t| t.binding.collection_name.clone()).collect();
        for binding in ctx.meta.global_collections()? {
            if !owned.contains(&binding.collection_name) {
                targets.push(Target { binding, global: true });
            }
        }
    }

    if targets.is_empty() {
        // A project (or dataset) with nothing bound returns empty, never an
        // error.
        meta.latency_ms = started.elapsed().as_millis() as u64;
        return Ok(QueryResponse { results: Vec::new(), meta });
    }

    // --- query embedding, one per encoder family ---------------------------
    let families: Vec<EncoderFamily> = {
        let unique: HashSet<EncoderFamily> = targets
            .iter()
            .map(|t| EncoderFamily::from_str(&t.binding.family))
            .collect();
        unique.into_iter().collect()
    };

    let embeds = join_all(families.iter().map(|family| {
        let router = Arc::clone(&ctx.router);
        let query = req.query.clone();
        let family = *family;
        async move { (family, router.embed_query(&query, family).await) }
    }))
    .await;

    let mut query_vectors: HashMap<EncoderFamily, Vec<f32>> = HashMap::new();
    for (family, result) in embeds {
        match result {
            Ok(vector) => {
                query_vectors.insert(family, vector);
            }
            Err(e) => {
                warn!(family = family.as_str(), error = %e, "query embedding failed");
                meta.partial = true;
                meta.degradation.push(format!("encoder.unavailable:{}", family.as_str()));
            }
        }
    }

    let hybrid_wanted =
        ctx.config.enable_hybrid_search && targets.iter().any(|t| t.binding.sparse);
    let sparse_query = if hybrid_wanted {
        let sq = ctx.router.sparse_query(&req.query).await;
        if sq.is_none() {
            meta.partial = true;
            meta.degradation.push("sparse.timeout".to_string());
        }
        sq
    } else {
        None
    };
    meta.features_used.hybrid = sparse_query.is_some();

    // --- per-collection fan-out --------------------------------------------
    let rerank_active = ctx.config.enable_reranking && ctx.reranker.is_some();
    let fetch_k = if rerank_active { ctx.config.rerank_initial_k.max(top_k) } else { top_k };

    let searches = join_all(targets.iter().map(|target| {
        let vectors = Arc::clone(&ctx.vectors);
        let family = EncoderFamily::from_str(&target.binding.family);
        let dense = query_vectors.get(&family).cloned();
        let sparse = sparse_query.clone().filter(|_| target.binding.sparse);
        let filter = Filter {
            project_id: if target.global { None } else { Some(req.project.clone()) },
            dataset_id: Some(target.binding.dataset_id.clone()),
            path_prefix: req.path_prefix.clone(),
            repo: req.repo.clone(),
            lang: req.lang.clone(),
        };
        let name = target.binding.collection_name.clone();
        let dense_weight = ctx.config.hybrid_dense_weight;
        let sparse_weight = ctx.config.hybrid_sparse_weight;
        async move {
            let Some(dense) = dense else {
                return (name, None); // family encoder already reported down
            };
            let result = match &sparse {
                Some(sq) => {
                    vectors
                        .hybrid_search(&name, &dense, sq, &filter, fetch_k, dense_weight, sparse_weight)
                        .await
                }
                None => vectors.search(&name, &dense, &filter, fetch_k).await,
            };
            (name, Some(result))
        }
    }))
    .await;

    let mut lists: Vec<RankedList<String>> = Vec::new();
    let mut hits_by_id: HashMap<String, (SearchHit, String)> = HashMap::new();
    for (name, outcome) in searches {
        match outcome {
            None => {}
            Some(Ok(hits)) => {
                meta.collections_searched += 1;
                let ids: Vec<String> = hits.iter().map(|h| h.id.clone()).collect();
                for hit in hits {
                    hits_by_id.entry(hit.id.clone()).or_insert((hit, name.clone()));
                }
                lists.push(RankedList::new(name, ids));
            }
            Some(Err(e)) => {
                warn!(collection = name.as_str(), error = %e, "collection query failed");
                meta.partial = true;
                meta.degradation.push(format!("collection.unavailable:{name}"));
            }
        }
    }

    // --- fusion ------------------------------------------------------------
    let fused = rrf_fuse(lists, RRF_K);
    let mut ranked: Vec<(String, f64)> =
        fused.into_iter().map(|f| (f.item, f.score)).collect();

    // --- optional rerank -----------------------------------------------------
    if let (true, Some(reranker)) = (rerank_active && !ranked.is_empty(), &ctx.reranker) {
        let candidates: Vec<(String, f64)> =
            ranked.iter().take(ctx.config.rerank_initial_k).cloned().collect();
        let documents: Vec<String> = candidates
            .iter()
            .map(|(id, _)| hits_by_id.get(id).map(|(h, _)| h.payload.content.clone()))
            .map(Option::unwrap_or_default)
            .collect();

        match reranker.rerank(&req.query, &documents).await {
            Ok(scores) => {
                let mut rescored: Vec<(String, f64)> = candidates
                    .into_iter()
                    .zip(scores)
                    .map(|((id, _), score)| (id, score))
                    .collect();
                rescored.sort_by(|a, b| {
                    b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0))
                });
                ranked = rescored;
                meta.features_used.rerank = true;
            }
            Err(e) => {
                warn!(error = %e, "reranker unavailable, returning fused order");
                meta.partial = true;
                meta.degradation.push("rerank.timeout".to_string());
            }
        }
    }

    // --- threshold, cut, hydrate -------------------------------------------
    if let Some(threshold) = req.threshold {
        ranked.retain(|(_, score)| *score >= threshold);
    }
    ranked.truncate(top_k);

    let mut results = Vec::with_capacity(ranked.len());
    for (id, score) in ranked {
        let Some((hit, collection)) = hits_by_id.get(&id) else {
            continue;
        };
        let chunk = match ctx.meta.get_chunk(collection, &id) {
            Ok(Some(row)) => row,
            _ => chunk_from_hit(hit, collection),
        };
        results.push(ScoredChunk { chunk, score });
    }

    meta.latency_ms = started.elapsed().as_millis() as u64;
    debug!(
        project = %req.project,
        collections = meta.collections_searched,
        results = results.len(),
        latency_ms = meta.latency_ms,
        "query complete"
    );
    ctx.bus.publish(
        Some(&req.project),
        EventKind::RetrievalTiming {
            latency_ms: meta.latency_ms,
            collections: meta.collections_searched,
            results: results.len(),
        },
    );

    Ok(QueryResponse { results, meta })
}

/// Fallback hydration straight from the vector payload, for rows the
/// metadata mirror hasn't caught up on (inside the reconciliation window).
fn chunk_from_hit(hit: &SearchHit, collection: &str) -> Chunk {
    Chunk {
        id: hit.id.clone(),
        project_id: hit.payload.project_id.clone(),
        dataset_id: hit.payload.dataset_id.clone(),
        collection_name: collection.to_string(),
        content: hit.payload.content.clone(),
        start_line: hit.payload.start_line,
        end_line: hit.payload.end_line,
        lang: hit.payload.lang.clone(),
        relative_path: hit.payload.relative_path.clone(),
        repo: hit.payload.repo.clone(),
        file_hash: hit.payload.file_hash.clone(),
        sparse_vector: None,
        symbol: hit.payload.symbol.clone(),
        metadata: BTreeMap::new(),
        created_at: Utc::now(),
    }
}
