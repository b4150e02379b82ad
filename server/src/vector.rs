//! Vector store — per-collection dense+sparse indexes behind a capability
//! trait.
//!
//! Two implementations: an in-memory store (default, and the test double)
//! doing brute-force cosine over unit vectors, and a Qdrant-compatible REST
//! client. Payloads are a fixed row type — retrieval never introspects
//! dynamic columns.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

use atoll_core::fusion::{rrf_fuse, RankedList, RRF_K};
use atoll_core::hash::base32_decode;
use atoll_core::types::{SparseVector, Symbol};

use crate::error::{Error, Result};

/// Vector-store calls time out after this long (retried 3×).
const STORE_TIMEOUT: Duration = Duration::from_secs(10);
const STORE_RETRIES: u32 = 3;

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// Payload carried with every point. Mirrors the chunk row so query results
/// are self-contained (content rides along for reranking and citations).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    pub project_id: String,
    pub dataset_id: String,
    pub relative_path: String,
    pub start_line: usize,
    pub end_line: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lang: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<Symbol>,
    pub content: String,
    pub file_hash: String,
}

#[derive(Debug, Clone)]
pub struct Point {
    pub id: String,
    pub dense: Vec<f32>,
    pub sparse: Option<SparseVector>,
    pub payload: Payload,
}

/// Exact-match payload filter; all set fields must hold (conjunction).
#[derive(Debug, Clone, Default)]
pub struct Filter {
    pub project_id: Option<String>,
    pub dataset_id: Option<String>,
    pub path_prefix: Option<String>,
    pub repo: Option<String>,
    pub lang: Option<String>,
}

impl Filter {
    pub fn matches(&self, payload: &Payload) -> bool {
        if let Some(p) = &self.project_id {
            if &payload.project_id != p {
                return false;
            }
        }
        if let Some(d) = &self.dataset_id {
            if &payload.dataset_id != d {
                return false;
            }
        }
        if let Some(prefix) = &self.path_prefix {
            if !payload.relative_path.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(r) = &self.repo {
            if payload.repo.as_deref() != Some(r.as_str()) {
                return false;
            }
        }
        if let Some(l) = &self.lang {
            if payload.lang.as_deref() != Some(l.as_str()) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub score: f64,
    pub payload: Payload,
}

// ---------------------------------------------------------------------------
// Capability trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create a collection with a named dense field of `dense_dim` and an
    /// optional sparse field. Idempotent.
    async fn create_collection(&self, name: &str, dense_dim: usize, sparse: bool) -> Result<()>;

    async fn delete_collection(&self, name: &str) -> Result<()>;

    async fn list_collections(&self) -> Result<Vec<String>>;

    async fn upsert(&self, name: &str, points: Vec<Point>) -> Result<()>;

    async fn delete_points(&self, name: &str, ids: &[String]) -> Result<()>;

    async fn search(
        &self,
        name: &str,
        dense: &[f32],
        filter: &Filter,
        top_k: usize,
    ) -> Result<Vec<SearchHit>>;

    /// Dense+sparse query fused with RRF. Stores without a native hybrid
    /// query run both lists and fuse client-side with the given weights.
    async fn hybrid_search(
        &self,
        name: &str,
        dense: &[f32],
        sparse: &SparseVector,
        filter: &Filter,
        top_k: usize,
        dense_weight: f64,
        sparse_weight: f64,
    ) -> Result<Vec<SearchHit>>;

    /// Every point id in a collection, for the reconciliation sweep.
    async fn point_ids(&self, name: &str) -> Result<Vec<String>>;

    async fn count(&self, name: &str) -> Result<usize>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

struct MemoryCollection {
    dense_dim: usize,
    sparse_enabled: bool,
    points: HashMap<String, Point>,
}

/// Brute-force store. Vectors are unit-norm on arrival, so cosine is a dot
/// product; collections at this scale fit comfortably in a scan.
#[derive(Default)]
pub struct MemoryStore {
    collections: DashMap<String, MemoryCollection>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ranked<F>(&self, name: &str, filter: &Filter, score: F) -> Result<Vec<SearchHit>>
    where
        F: Fn(&Point) -> f64,
    {
        let collection = self
            .collections
            .get(name)
            .ok_or_else(|| Error::StoreFatal(format!("unknown collection {name}")))?;
        let mut hits: Vec<SearchHit> = collection
            .points
            .values()
            .filter(|p| filter.matches(&p.payload))
            .map(|p| SearchHit { id: p.id.clone(), score: score(p), payload: p.payload.clone() })
            .collect();
        hits.sort_by(|a, b| {
            b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal).then(a.id.cmp(&b.id))
        });
        Ok(hits)
    }
}

fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (*x as f64) * (*y as f64)).sum()
}

fn sparse_dot(query: &SparseVector, point: &SparseVector) -> f64 {
    // Both index lists are sorted ascending; merge-walk them.
    let mut total = 0.0f64;
    let (mut i, mut j) = (0usize, 0usize);
    while i < query.indices.len() && j < point.indices.len() {
        match query.indices[i].cmp(&point.indices[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                total += (query.values[i] as f64) * (point.values[j] as f64);
                i += 1;
                j += 1;
            }
        }
    }
    total
}

#[async_trait]
impl VectorStore for MemoryStore {
    async fn create_collection(&self, name: &str, dense_dim: usize, sparse: bool) -> Result<()> {
        match self.collections.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                if existing.get().dense_dim != dense_dim {
                    return Err(Error::StoreFatal(format!(
                        "collection {name} exists with dim {}, requested {dense_dim}",
                        existing.get().dense_dim
                    )));
                }
                Ok(())
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(MemoryCollection {
                    dense_dim,
                    sparse_enabled: sparse,
                    points: HashMap::new(),
                });
                Ok(())
            }
        }
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        self.collections.remove(name);
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> =
            self.collections.iter().map(|e| e.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    async fn upsert(&self, name: &str, points: Vec<Point>) -> Result<()> {
        let mut collection = self
            .collections
            .get_mut(name)
            .ok_or_else(|| Error::StoreFatal(format!("unknown collection {name}")))?;
        for point in points {
            if point.dense.len() != collection.dense_dim {
                return Err(Error::StoreFatal(format!(
                    "point {} has dim {}, collection {name} expects {}",
                    point.id,
                    point.dense.len(),
                    collection.dense_dim
                )));
            }
            collection.points.insert(point.id.clone(), point);
        }
        Ok(())
    }

    async fn delete_points(&self, name: &str, ids: &[String]) -> Result<()> {
        if let Some(mut collection) = self.collections.get_mut(name) {
            for id in ids {
                collection.points.remove(id);
            }
        }
        Ok(())
    }

    async fn search(
        &self,
        name: &str,
        dense: &[f32],
        filter: &Filter,
        top_k: usize,
    ) -> Result<Vec<SearchHit>> {
        let mut hits = self.ranked(name, filter, |p| dot(&p.dense, dense))?;
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn hybrid_search(
        &self,
        name: &str,
        dense: &[f32],
        sparse: &SparseVector,
        filter: &Filter,
        top_k: usize,
        dense_weight: f64,
        sparse_weight: f64,
    ) -> Result<Vec<SearchHit>> {
        let sparse_enabled =
            self.collections.get(name).map(|c| c.sparse_enabled).unwrap_or(false);
        if !sparse_enabled || sparse.is_empty() {
            return self.search(name, dense, filter, top_k).await;
        }

        let dense_hits = self.ranked(name, filter, |p| dot(&p.dense, dense))?;
        let mut sparse_hits = self.ranked(name, filter, |p| {
            p.sparse.as_ref().map(|sv| sparse_dot(sparse, sv)).unwrap_or(0.0)
        })?;
        sparse_hits.retain(|h| h.score > 0.0);

        let by_id: HashMap<String, Payload> = dense_hits
            .iter()
            .chain(sparse_hits.iter())
            .map(|h| (h.id.clone(), h.payload.clone()))
            .collect();

        let fused = rrf_fuse(
            vec![
                RankedList::weighted(
                    "dense",
                    dense_weight,
                    dense_hits.into_iter().map(|h| h.id).collect(),
                ),
                RankedList::weighted(
                    "sparse",
                    sparse_weight,
                    sparse_hits.into_iter().map(|h| h.id).collect(),
                ),
            ],
            RRF_K,
        );

        Ok(fused
            .into_iter()
            .take(top_k)
            .filter_map(|f| {
                by_id.get(&f.item).map(|payload| SearchHit {
                    id: f.item.clone(),
                    score: f.score,
                    payload: payload.clone(),
                })
            })
            .collect())
    }

    async fn point_ids(&self, name: &str) -> Result<Vec<String>> {
        let collection = self
            .collections
            .get(name)
            .ok_or_else(|| Error::StoreFatal(format!("unknown collection {name}")))?;
        let mut ids: Vec<String> = collection.points.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn count(&self, name: &str) -> Result<usize> {
        Ok(self.collections.get(name).map(|c| c.points.len()).unwrap_or(0))
    }
}

// ---------------------------------------------------------------------------
// Qdrant-compatible REST implementation
// ---------------------------------------------------------------------------

/// REST client for a Qdrant-compatible vector store. Point ids on the wire
/// are UUIDs derived from the 128-bit chunk id; the chunk id string rides in
/// the payload and is restored on the way out.
pub struct HttpStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStore {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(STORE_TIMEOUT).build()?;
        Ok(HttpStore { client, base_url: base_url.trim_end_matches('/').to_string() })
    }

    /// Retrying send: 5xx and transport errors back off 250 ms × attempt.
    async fn send(&self, build: impl Fn() -> reqwest::RequestBuilder) -> Result<serde_json::Value> {
        let mut last_err: Option<Error> = None;
        for attempt in 1..=STORE_RETRIES {
            match build().send().await {
                Ok(resp) if resp.status().is_success() => {
                    return Ok(resp.json().await.unwrap_or(serde_json::Value::Null));
                }
                Ok(resp) if resp.status().is_server_error() => {
                    last_err = Some(Error::StoreTransient(format!(
                        "vector store returned {}",
                        resp.status()
                    )));
                }
                Ok(resp) => {
                    let detail = resp.text().await.unwrap_or_default();
                    return Err(Error::StoreFatal(detail));
                }
                Err(e) => last_err = Some(Error::StoreTransient(e.to_string())),
            }
            tokio::time::sleep(Duration::from_millis(250 * attempt as u64)).await;
        }
        Err(last_err.unwrap_or_else(|| Error::StoreTransient("vector store unreachable".into())))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

/// Render a chunk id (128-bit Base32) as the hyphenated UUID the wire wants.
fn point_uuid(chunk_id: &str) -> String {
    let bytes = base32_decode(chunk_id).unwrap_or_default();
    if bytes.len() != 16 {
        // Foreign id — hash it down to 16 bytes so the call still succeeds.
        let digest = atoll_core::hash::sha256(chunk_id.as_bytes());
        return format_uuid(&digest[..16]);
    }
    format_uuid(&bytes)
}

fn format_uuid(bytes: &[u8]) -> String {
    let encoded = hex::encode(bytes);
    format!(
        "{}-{}-{}-{}-{}",
        &encoded[0..8],
        &encoded[8..12],
        &encoded[12..16],
        &encoded[16..20],
        &encoded[20..32]
    )
}

fn qdrant_filter(filter: &Filter) -> serde_json::Value {
    let mut must = Vec::new();
    for (key, value) in [
        ("project_id", &filter.project_id),
        ("dataset_id", &filter.dataset_id),
        ("repo", &filter.repo),
        ("lang", &filter.lang),
    ] {
        if let Some(v) = value {
            must.push(json!({ "key": key, "match": { "value": v } }));
        }
    }
    json!({ "must": must })
}

fn hit_from_scored_point(point: &serde_json::Value) -> Option<SearchHit> {
    let payload: Payload = serde_json::from_value(point.get("payload")?.clone()).ok()?;
    let id = point.get("payload")?.get("chunk_id")?.as_str()?.to_string();
    let score = point.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0);
    Some(SearchHit { id, score, payload })
}

#[async_trait]
impl VectorStore for HttpStore {
    async fn create_collection(&self, name: &str, dense_dim: usize, sparse: bool) -> Result<()> {
        let mut body = json!({
            "vectors": { "dense": { "size": dense_dim, "distance": "Cosine" } }
        });
        if sparse {
            body["sparse_vectors"] = json!({ "sparse": {} });
        }
        let url = self.url(&format!("/collections/{name}"));
        let resp = self.client.put(&url).json(&body).send().await?;
        if resp.status().is_success() || resp.status().as_u16() == 409 {
            return Ok(());
        }
        // Re-creation with identical config reports a conflict body on some
        // versions; treat an existing collection as success.
        let exists = self.client.get(&url).send().await?.status().is_success();
        if exists {
            Ok(())
        } else {
            Err(Error::StoreFatal(format!("could not create collection {name}")))
        }
    }

    async fn delete_collection(&self, name: &str) -> Result<()> {
        self.send(|| self.client.delete(self.url(&format!("/collections/{name}")))).await?;
        Ok(())
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let body = self.send(|| self.client.get(self.url("/collections"))).await?;
        let names = body["result"]["collections"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|c| c["name"].as_str().map(str::to_string))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        Ok(names)
    }

    async fn upsert(&self, name: &str, points: Vec<Point>) -> Result<()> {
        let wire_points: Vec<serde_json::Value> = points
            .iter()
            .map(|p| {
                let mut payload = serde_json::to_value(&p.payload).unwrap_or(json!({}));
                payload["chunk_id"] = json!(p.id);
                let mut vector = json!({ "dense": p.dense });
                if let Some(sv) = &p.sparse {
                    vector["sparse"] = json!({ "indices": sv.indices, "values": sv.values });
                }
                json!({ "id": point_uuid(&p.id), "vector": vector, "payload": payload })
            })
            .collect();
        let body = json!({ "points": wire_points });
        self.send(|| {
            self.client
                .put(self.url(&format!("/collections/{name}/points?wait=true")))
                .json(&body)
        })
        .await?;
        Ok(())
    }

    async fn delete_points(&self, name: &str, ids: &[String]) -> Result<()> {
        let uuids: Vec<String> = ids.iter().map(|id| point_uuid(id)).collect();
        let body = json!({ "points": uuids });
        self.send(|| {
            self.client
                .post(self.url(&format!("/collections/{name}/points/delete?wait=true")))
                .json(&body)
        })
        .await?;
        Ok(())
    }

    async fn search(
        &self,
        name: &str,
        dense: &[f32],
        filter: &Filter,
        top_k: usize,
    ) -> Result<Vec<SearchHit>> {
        // Prefix filtering happens client-side; over-fetch to compensate.
        let fetch = if filter.path_prefix.is_some() { top_k * 4 } else { top_k };
        let body = json!({
            "vector": { "name": "dense", "vector": dense },
            "filter": qdrant_filter(filter),
            "limit": fetch,
            "with_payload": true,
        });
        let resp = self
            .send(|| {
                self.client
                    .post(self.url(&format!("/collections/{name}/points/search")))
                    .json(&body)
            })
            .await?;
        let mut hits: Vec<SearchHit> = resp["result"]
            .as_array()
            .map(|arr| arr.iter().filter_map(hit_from_scored_point).collect())
            .unwrap_or_default();
        hits.retain(|h| filter.matches(&h.payload));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn hybrid_search(
        &self,
        name: &str,
        dense: &[f32],
        sparse: &SparseVector,
        filter: &Filter,
        top_k: usize,
        _dense_weight: f64,
        _sparse_weight: f64,
    ) -> Result<Vec<SearchHit>> {
        if sparse.is_empty() {
            return self.search(name, dense, filter, top_k).await;
        }
        let fetch = if filter.path_prefix.is_some() { top_k * 4 } else { top_k };
        // Native RRF fusion via the query API.
        let body = json!({
            "prefetch": [
                { "query": dense, "using": "dense", "limit": fetch * 2 },
                {
                    "query": { "indices": sparse.indices, "values": sparse.values },
                    "using": "sparse",
                    "limit": fetch * 2
                }
            ],
            "query": { "fusion": "rrf" },
            "filter": qdrant_filter(filter),
            "limit": fetch,
            "with_payload": true,
        });
        let resp = self
            .send(|| {
                self.client
                    .post(self.url(&format!("/collections/{name}/points/query")))
                    .json(&body)
            })
            .await?;
        let mut hits: Vec<SearchHit> = resp["result"]["points"]
            .as_array()
            .or_else(|| resp["result"].as_array())
            .map(|arr| arr.iter().filter_map(hit_from_scored_point).collect())
            .unwrap_or_default();
        hits.retain(|h| filter.matches(&h.payload));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn point_ids(&self, name: &str) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut offset: Option<serde_json::Value> = None;
        loop {
            let mut body = json!({ "limit": 1000, "with_payload": { "include": ["chunk_id"] } });
            if let Some(o) = &offset {
                body["offset"] = o.clone();
            }
            let resp = self
                .send(|| {
                    self.client
                        .post(self.url(&format!("/collections/{name}/points/scroll")))
                        .json(&body)
                })
                .await?;
            if let Some(points) = resp["result"]["points"].as_array() {
                for p in points {
                    if let Some(id) = p["payload"]["chunk_id"].as_str() {
                        ids.push(id.to_string());
                    }
                }
            }
            match resp["result"]["next_page_offset"].clone() {
                serde_json::Value::Null => break,
                next => offset = Some(next),
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn count(&self, name: &str) -> Result<usize> {
        let resp = self
            .send(|| {
                self.client
                    .post(self.url(&format!("/collections/{name}/points/count")))
                    .json(&json!({ "exact": true }))
            })
            .await?;
        Ok(resp["result"]["count"].as_u64().unwrap_or(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(project: &str, path: &str) -> Payload {
        Payload {
            project_id: project.to_string(),
            dataset_id: "d1".to_string(),
            relative_path: path.to_string(),
            start_line: 1,
            end_line: 10,
            repo: None,
            lang: Some("rust".to_string()),
            symbol: None,
            content: format!("content of {path}"),
            file_hash: "fh".to_string(),
        }
    }

    fn point(id: &str, project: &str, dense: Vec<f32>, sparse: Option<SparseVector>) -> Point {
        Point { id: id.to_string(), dense, sparse, payload: payload(project, "src/lib.rs") }
    }

    #[tokio::test]
    async fn create_is_idempotent_but_dim_changes_fail() {
        let store = MemoryStore::new();
        store.create_collection("c", 3, false).await.unwrap();
        store.create_collection("c", 3, false).await.unwrap();
        assert!(store.create_collection("c", 4, false).await.is_err());
    }

    #[tokio::test]
    async fn list_and_delete_collections() {
        let store = MemoryStore::new();
        store.create_collection("b", 2, false).await.unwrap();
        store.create_collection("a", 2, false).await.unwrap();
        assert_eq!(store.list_collections().await.unwrap(), vec!["a", "b"]);

        store.delete_collection("a").await.unwrap();
        assert_eq!(store.list_collections().await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn search_ranks_by_cosine_and_respects_filters() {
        let store = MemoryStore::new();
        store.create_collection("c", 2, false).await.unwrap();
        store
            .upsert(
                "c",
                vec![
                    point("a", "p1", vec![1.0, 0.0], None),
                    point("b", "p1", vec![0.6, 0.8], None),
                    point("x", "p2", vec![1.0, 0.0], None),
                ],
            )
            .await
            .unwrap();

        let filter = Filter { project_id: Some("p1".into()), ..Default::default() };
        let hits = store.search("c", &[1.0, 0.0], &filter, 10).await.unwrap();
        assert_eq!(hits.len(), 2, "p2 point must not leak");
        assert_eq!(hits[0].id, "a");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn upsert_is_idempotent_by_point_id() {
        let store = MemoryStore::new();
        store.create_collection("c", 2, false).await.unwrap();
        let p = point("a", "p1", vec![1.0, 0.0], None);
        store.upsert("c", vec![p.clone()]).await.unwrap();
        store.upsert("c", vec![p]).await.unwrap();
        assert_eq!(store.count("c").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_fatal() {
        let store = MemoryStore::new();
        store.create_collection("c", 2, false).await.unwrap();
        let err = store.upsert("c", vec![point("a", "p1", vec![1.0, 0.0, 0.0], None)]).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn hybrid_promotes_sparse_matches() {
        let store = MemoryStore::new();
        store.create_collection("c", 2, true).await.unwrap();
        store
            .upsert(
                "c",
                vec![
                    // dense-favored point, no sparse overlap
                    point("dense_hit", "p1", vec![1.0, 0.0], Some(SparseVector {
                        indices: vec![9],
                        values: vec![1.0],
                    })),
                    // weaker dense but exact sparse term match
                    point("sparse_hit", "p1", vec![0.0, 1.0], Some(SparseVector {
                        indices: vec![3],
                        values: vec![2.0],
                    })),
                ],
            )
            .await
            .unwrap();

        let query_sparse = SparseVector { indices: vec![3], values: vec![1.0] };
        let hits = store
            .hybrid_search("c", &[1.0, 0.0], &query_sparse, &Filter::default(), 10, 0.6, 0.4)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        // dense list: [dense_hit, sparse_hit]; sparse list: [sparse_hit].
        // dense_hit: 0.6/61; sparse_hit: 0.6/62 + 0.4/61 — sparse_hit wins.
        assert_eq!(hits[0].id, "sparse_hit");
    }

    #[tokio::test]
    async fn hybrid_falls_back_to_dense_when_sparse_disabled() {
        let store = MemoryStore::new();
        store.create_collection("c", 2, false).await.unwrap();
        store.upsert("c", vec![point("a", "p1", vec![1.0, 0.0], None)]).await.unwrap();
        let hits = store
            .hybrid_search(
                "c",
                &[1.0, 0.0],
                &SparseVector { indices: vec![1], values: vec![1.0] },
                &Filter::default(),
                5,
                0.6,
                0.4,
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn delete_points_and_reconciliation_ids() {
        let store = MemoryStore::new();
        store.create_collection("c", 2, false).await.unwrap();
        store
            .upsert(
                "c",
                vec![point("a", "p1", vec![1.0, 0.0], None), point("b", "p1", vec![0.0, 1.0], None)],
            )
            .await
            .unwrap();
        store.delete_points("c", &["a".to_string()]).await.unwrap();
        assert_eq!(store.point_ids("c").await.unwrap(), vec!["b".to_string()]);
    }

    #[test]
    fn point_uuid_is_stable_and_hyphenated() {
        let id = atoll_core::hash::chunk_id("c", "p", 1, 2, "body");
        let a = point_uuid(&id);
        let b = point_uuid(&id);
        assert_eq!(a, b);
        assert_eq!(a.len(), 36);
        assert_eq!(a.matches('-').count(), 4);
    }
}
