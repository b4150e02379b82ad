//! Ingestion coordinator — source → chunks → vectors → both stores.
//!
//! Local trees and remote checkouts run the same pipeline: discover files,
//! diff content hashes against the dataset's snapshots, chunk what changed,
//! embed through the router, then commit deletes-before-upserts so the two
//! stores never hold a file's old and new chunks at once. Per-file problems
//! are soft errors; the job only fails when the tally crosses the budget.

use chrono::Utc;
use ignore::WalkBuilder;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use atoll_core::hash::{chunk_id, file_hash};
use atoll_core::scope::collection_name;
use atoll_core::types::{Chunk, Dataset, FileSnapshot, Job, JobSummary};

use crate::chunk::{chunk_file, RawChunk};
use crate::embed::{family_for, EmbedRequest, EncoderFamily};
use crate::error::{Error, FailureTally, Result};
use crate::jobs::ProgressReporter;
use crate::meta::CollectionBinding;
use crate::state::AppContext;
use crate::vector::{Payload, Point};

/// Cancellation checkpoint spacing during chunking and storing.
const CANCEL_CHECK_EVERY: usize = 25;

/// Directory names never descended into.
pub const SKIP_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "__pycache__",
    ".venv",
    "venv",
    "target",
    "dist",
    "build",
    ".next",
    ".cache",
    "vendor",
];

/// Extensions that are binary no matter what the content sniff says.
const BINARY_EXTS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "ico", "pdf", "zip", "gz", "tar", "7z", "jar", "class",
    "exe", "dll", "so", "dylib", "a", "o", "woff", "woff2", "ttf", "eot", "otf", "mp3", "mp4",
    "avi", "mov", "webm", "wasm", "db", "sqlite",
];

// ---------------------------------------------------------------------------
// Job payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalIngestPayload {
    pub path: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRepoPayload {
    pub repo: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub sha: Option<String>,
    #[serde(default)]
    pub force: bool,
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct DiscoveredFile {
    rel_path: String,
    abs_path: PathBuf,
    hash: String,
}

/// Sniff for NUL bytes in the first 8 KiB — same cheap heuristic the rest
/// of the toolchain uses for text detection.
fn is_text_file(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(8192)];
    !head.contains(&0)
}

/// Walk the tree, skipping ignored directories, binaries, and oversized
/// files. Hashes are computed here so the diff needs no second read.
fn discover_files(root: &Path, max_bytes: u64, tally: &mut FailureTally) -> Vec<DiscoveredFile> {
    let skip: HashSet<&str> = SKIP_DIRS.iter().copied().collect();
    let mut out = Vec::new();

    let walker = WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .filter_entry(move |entry| {
            if entry.file_type().is_some_and(|ft| ft.is_dir()) {
                let name = entry.file_name().to_string_lossy();
                return !skip.contains(name.as_ref());
            }
            true
        })
        .build();

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let abs_path = entry.path().to_path_buf();
        let rel_path = match abs_path.strip_prefix(root) {
            Ok(r) => r.to_string_lossy().replace('\\', "/"),
            Err(_) => continue,
        };

        let ext = rel_path.rsplit_once('.').map(|(_, e)| e.to_lowercase()).unwrap_or_default();
        if BINARY_EXTS.contains(&ext.as_str()) {
            continue;
        }

        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if size > max_bytes {
            tally.soft("chunk.skip", &rel_path, &format!("{size} bytes exceeds cap"));
            continue;
        }

        match std::fs::read(&abs_path) {
            Ok(bytes) => {
                if !is_text_file(&bytes) {
                    tally.soft("chunk.skip", &rel_path, "binary content");
                    continue;
                }
                tally.ok();
                out.push(DiscoveredFile { rel_path, abs_path, hash: file_hash(&bytes) });
            }
            Err(e) => {
                tally.soft("source.unreadable", &rel_path, &e.to_string());
            }
        }
    }

    out.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    out
}

// ---------------------------------------------------------------------------
// Snapshot diff
// ---------------------------------------------------------------------------

struct SyncPlan {
    /// Added ∪ Changed — everything that needs chunking.
    work: Vec<DiscoveredFile>,
    /// Old snapshots whose chunks must be deleted (changed + removed).
    stale: Vec<FileSnapshot>,
    removed: usize,
    unchanged: usize,
}

fn compute_plan(files: Vec<DiscoveredFile>, snapshots: Vec<FileSnapshot>, force: bool) -> SyncPlan {
    let by_path: HashMap<&str, &FileSnapshot> =
        snapshots.iter().map(|s| (s.relative_path.as_str(), s)).collect();
    let current: HashSet<String> = files.iter().map(|f| f.rel_path.clone()).collect();

    let mut work = Vec::new();
    let mut stale = Vec::new();
    let mut unchanged = 0usize;

    for file in files {
        match by_path.get(file.rel_path.as_str()) {
            Some(snap) if !force && snap.file_hash == file.hash => unchanged += 1,
            Some(snap) => {
                stale.push((*snap).clone());
                work.push(file);
            }
            None => work.push(file),
        }
    }

    let mut removed = 0usize;
    for snap in &snapshots {
        if !current.contains(snap.relative_path.as_str()) {
            stale.push(snap.clone());
            removed += 1;
        }
    }

    SyncPlan { work, stale, removed, unchanged }
}

// ---------------------------------------------------------------------------
// Collection resolution
// ---------------------------------------------------------------------------

/// Find or create the collection holding `family` chunks of this dataset.
/// The first family a dataset sees takes the canonical
/// `project_{slug}_dataset_{slug}` name; a second family binds a
/// family-suffixed sibling (datasets may map to several collections, each
/// pinned to one encoder family).
async fn resolve_collection(
    ctx: &Arc<AppContext>,
    dataset: &Dataset,
    family: EncoderFamily,
) -> Result<CollectionBinding> {
    let bindings = ctx.meta.collections_for_project(&dataset.project_id, None)?;
    let mine: Vec<&CollectionBinding> =
        bindings.iter().filter(|b| b.dataset_id == dataset.id).collect();

    if let Some(found) = mine.iter().find(|b| b.family == family.as_str()) {
        ctx.vectors
            .create_collection(&found.collection_name, found.dense_dim, found.sparse)
            .await?;
        return Ok((*found).clone());
    }

    let base = collection_name(&dataset.project_id, &dataset.name);
    let name = if mine.iter().any(|b| b.collection_name == base) {
        format!("{base}_{}", family.as_str())
    } else {
        base
    };
    let dim = ctx.router.dim(family);
    let sparse = ctx.config.enable_hybrid_search && ctx.router.sparse_enabled();

    ctx.vectors.create_collection(&name, dim, sparse).await?;
    ctx.meta.bind_collection(&dataset.id, &name, family.as_str(), dim, sparse)?;
    Ok(CollectionBinding {
        collection_name: name,
        dataset_id: dataset.id.clone(),
        dataset_name: dataset.name.clone(),
        family: family.as_str().to_string(),
        dense_dim: dim,
        sparse,
    })
}

/// Crawl pages always land in the dataset's text-family collection.
pub async fn page_collection(
    ctx: &Arc<AppContext>,
    dataset: &Dataset,
) -> Result<CollectionBinding> {
    resolve_collection(ctx, dataset, EncoderFamily::Text).await
}

// ---------------------------------------------------------------------------
// Job handlers
// ---------------------------------------------------------------------------

pub async fn run_local_job(
    ctx: &Arc<AppContext>,
    job: &Job,
    reporter: &mut ProgressReporter,
    cancel: &CancellationToken,
) -> Result<JobSummary> {
    let payload: LocalIngestPayload = serde_json::from_value(job.payload.clone())
        .map_err(|e| Error::InvalidInput(format!("bad ingest payload: {e}")))?;
    ingest_tree(ctx, job, Path::new(&payload.path), None, payload.force, reporter, cancel).await
}

/// Reindex is a forced local ingest over the recorded source path.
pub async fn run_reindex_job(
    ctx: &Arc<AppContext>,
    job: &Job,
    reporter: &mut ProgressReporter,
    cancel: &CancellationToken,
) -> Result<JobSummary> {
    let payload: LocalIngestPayload = serde_json::from_value(job.payload.clone())
        .map_err(|e| Error::InvalidInput(format!("bad reindex payload: {e}")))?;
    ingest_tree(ctx, job, Path::new(&payload.path), None, true, reporter, cancel).await
}

pub async fn run_remote_repo_job(
    ctx: &Arc<AppContext>,
    job: &Job,
    reporter: &mut ProgressReporter,
    cancel: &CancellationToken,
) -> Result<JobSummary> {
    let payload: RemoteRepoPayload = serde_json::from_value(job.payload.clone())
        .map_err(|e| Error::InvalidInput(format!("bad repo payload: {e}")))?;

    reporter.report("initializing", 0.0, Some("syncing repository"));
    let repos_dir = ctx.config.repos_dir();
    let remote = payload.repo.clone();
    let branch = payload.branch.clone();
    let sha = payload.sha.clone();
    let checkout = tokio::task::spawn_blocking(move || {
        crate::git::sync_repo(&repos_dir, &remote, branch.as_deref(), sha.as_deref())
    })
    .await
    .map_err(|e| Error::SourceUnreadable(format!("repo sync task failed: {e}")))??;

    ingest_tree(ctx, job, &checkout, Some(payload.repo), payload.force, reporter, cancel).await
}

/// The shared pipeline for local paths and repo checkouts.
async fn ingest_tree(
    ctx: &Arc<AppContext>,
    job: &Job,
    root: &Path,
    repo: Option<String>,
    force: bool,
    reporter: &mut ProgressReporter,
    cancel: &CancellationToken,
) -> Result<JobSummary> {
    // --- initializing ---------------------------------------------------
    reporter.report("initializing", 0.0, None);
    if !root.exists() {
        return Err(Error::SourceUnreadable(format!("{} does not exist", root.display())));
    }
    ctx.meta.get_or_create_project(&job.project_id, &job.project_id, None)?;
    let dataset = ctx.meta.get_dataset(&job.dataset_id)?;
    reporter.report("initializing", 1.0, None);

    // --- discovery -------------------------------------------------------
    reporter.report("discovery", 0.0, None);
    let mut tally = FailureTally::default();
    let root_owned = root.to_path_buf();
    let max_bytes = ctx.config.max_file_bytes;
    let (files, mut tally) = tokio::task::spawn_blocking(move || {
        let files = discover_files(&root_owned, max_bytes, &mut tally);
        (files, tally)
    })
    .await
    .map_err(|e| Error::SourceUnreadable(format!("discovery task failed: {e}")))?;

    let snapshots = ctx.meta.list_file_snapshots(&dataset.id)?;
    let plan = compute_plan(files, snapshots, force);
    info!(
        job = %job.id,
        work = plan.work.len(),
        unchanged = plan.unchanged,
        removed = plan.removed,
        "discovery complete"
    );
    reporter.report(
        "discovery",
        1.0,
        Some(&format!("{} to index, {} unchanged", plan.work.len(), plan.unchanged)),
    );
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    // --- chunking --------------------------------------------------------
    let want_symbols = ctx.config.enable_symbol_extraction;
    let total_work = plan.work.len().max(1);
    let mut per_file_chunks: Vec<(DiscoveredFile, Vec<RawChunk>)> = Vec::new();

    for (batch_idx, batch) in plan.work.chunks(CANCEL_CHECK_EVERY).enumerate() {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let batch: Vec<DiscoveredFile> = batch.to_vec();
        let chunked: Vec<(DiscoveredFile, std::io::Result<Vec<RawChunk>>)> =
            tokio::task::spawn_blocking(move || {
                batch
                    .into_par_iter()
                    .map(|file| {
                        let result = std::fs::read_to_string(&file.abs_path)
                            .map(|content| chunk_file(&content, &file.rel_path, want_symbols));
                        (file, result)
                    })
                    .collect()
            })
            .await
            .map_err(|e| Error::SourceUnreadable(format!("chunking task failed: {e}")))?;

        for (file, result) in chunked {
            match result {
                Ok(chunks) => per_file_chunks.push((file, chunks)),
                Err(e) => tally.soft("source.unreadable", &file.rel_path, &e.to_string()),
            }
        }
        let done = ((batch_idx + 1) * CANCEL_CHECK_EVERY).min(total_work);
        reporter.report("chunking", done as f64 / total_work as f64, None);
    }

    if tally.over_budget() {
        return Err(Error::SourceUnreadable(format!(
            "file error ratio {:.0}% exceeds budget",
            tally.ratio() * 100.0
        )));
    }

    // --- embedding -------------------------------------------------------
    reporter.report("embedding", 0.0, None);
    let mut requests = Vec::new();
    let mut request_origin = Vec::new(); // (file index, chunk index)
    for (file_idx, (file, chunks)) in per_file_chunks.iter().enumerate() {
        for (chunk_idx, raw) in chunks.iter().enumerate() {
            let family = family_for(&file.rel_path, raw.symbol.as_ref().map(|s| s.kind));
            requests.push(EmbedRequest { content: raw.content.clone(), family });
            request_origin.push((file_idx, chunk_idx));
        }
    }

    let outcome = ctx.router.embed_all(&requests, cancel).await?;
    if !requests.is_empty() {
        let failure_ratio = outcome.failed as f64 / requests.len() as f64;
        if failure_ratio > crate::error::FAILURE_RATIO_CAP {
            return Err(Error::EncoderFatal(format!(
                "embedding failure ratio {:.0}% exceeds budget",
                failure_ratio * 100.0
            )));
        }
        for _ in 0..outcome.failed {
            tally.soft("encoder.fatal", "embedding", "chunk dropped after retries");
        }
    }
    reporter.report("embedding", 1.0, None);

    // --- storing ---------------------------------------------------------
    reporter.report("storing", 0.0, None);

    // Delete stale chunks from both stores before writing replacements.
    let stale_ids: Vec<String> =
        plan.stale.iter().flat_map(|s| s.chunk_ids.iter().cloned()).collect();
    let deleted = ctx.meta.delete_chunks_by_ids(&dataset.id, &stale_ids)?;
    let mut by_collection: HashMap<String, Vec<String>> = HashMap::new();
    for (collection, id) in deleted {
        by_collection.entry(collection).or_default().push(id);
    }
    for (collection, ids) in by_collection {
        ctx.vectors.delete_points(&collection, &ids).await?;
    }
    for snap in &plan.stale {
        ctx.meta.delete_file_snapshot(&dataset.id, &snap.relative_path)?;
    }

    // Resolve collections for whichever families actually showed up, in a
    // fixed order so the canonical collection name lands deterministically.
    let present: HashSet<EncoderFamily> = requests.iter().map(|r| r.family).collect();
    let mut collections: HashMap<EncoderFamily, CollectionBinding> = HashMap::new();
    for family in [EncoderFamily::Code, EncoderFamily::Text] {
        if present.contains(&family) {
            collections.insert(family, resolve_collection(ctx, &dataset, family).await?);
        }
    }

    // Group embedded chunks back by file, build rows and points.
    let now = Utc::now();
    let mut new_chunks: Vec<Chunk> = Vec::new();
    let mut points_per_collection: HashMap<String, Vec<Point>> = HashMap::new();
    let mut chunk_ids_per_file: HashMap<usize, Vec<String>> = HashMap::new();

    for (req_idx, (file_idx, _)) in request_origin.iter().enumerate() {
        let Some(dense) = outcome.dense[req_idx].clone() else {
            continue; // dropped by the failure budget above
        };
        let (file, chunks) = &per_file_chunks[*file_idx];
        let raw = &chunks[request_origin[req_idx].1];
        let binding = &collections[&requests[req_idx].family];

        let id = chunk_id(
            &binding.collection_name,
            &file.rel_path,
            raw.start_line,
            raw.end_line,
            &raw.content,
        );
        let sparse = outcome.sparse[req_idx].clone();

        new_chunks.push(Chunk {
            id: id.clone(),
            project_id: job.project_id.clone(),
            dataset_id: dataset.id.clone(),
            collection_name: binding.collection_name.clone(),
            content: raw.content.clone(),
            start_line: raw.start_line,
            end_line: raw.end_line,
            lang: raw.lang.clone(),
            relative_path: file.rel_path.clone(),
            repo: repo.clone(),
            file_hash: file.hash.clone(),
            sparse_vector: sparse.clone(),
            symbol: raw.symbol.clone(),
            metadata: BTreeMap::new(),
            created_at: now,
        });
        points_per_collection.entry(binding.collection_name.clone()).or_default().push(Point {
            id: id.clone(),
            dense,
            sparse,
            payload: Payload {
                project_id: job.project_id.clone(),
                dataset_id: dataset.id.clone(),
                relative_path: file.rel_path.clone(),
                start_line: raw.start_line,
                end_line: raw.end_line,
                repo: repo.clone(),
                lang: raw.lang.clone(),
                symbol: raw.symbol.clone(),
                content: raw.content.clone(),
                file_hash: file.hash.clone(),
            },
        });
        chunk_ids_per_file.entry(*file_idx).or_default().push(id);
    }

    // Vector store first, metadata mirror second, snapshots last — a crash
    // leaves at worst vectors without rows, which the sweep clears.
    for (collection, points) in points_per_collection {
        ctx.vectors.upsert(&collection, points).await?;
    }
    ctx.meta.upsert_chunks(&new_chunks)?;

    for (i, (file, _)) in per_file_chunks.iter().enumerate() {
        if i % CANCEL_CHECK_EVERY == 0 && cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        ctx.meta.upsert_file_snapshot(&FileSnapshot {
            project_id: job.project_id.clone(),
            dataset_id: dataset.id.clone(),
            relative_path: file.rel_path.clone(),
            file_hash: file.hash.clone(),
            chunk_ids: chunk_ids_per_file.remove(&i).unwrap_or_default(),
            indexed_at: now,
        })?;
        reporter.report("storing", (i + 1) as f64 / per_file_chunks.len().max(1) as f64, None);
    }

    debug!(job = %job.id, chunks = new_chunks.len(), "stored");
    Ok(JobSummary {
        files: per_file_chunks.len(),
        chunks: new_chunks.len(),
        pages: 0,
        removed: plan.removed,
        soft_errors: tally.samples().to_vec(),
    })
}

// ---------------------------------------------------------------------------
// Reconciliation sweep
// ---------------------------------------------------------------------------

/// Recompute the symmetric difference of chunk ids vs point ids per
/// collection and delete orphans on whichever side has them. Run hourly;
/// divergence inside the window is expected and quietly repaired.
pub async fn reconcile(ctx: &Arc<AppContext>) -> Result<usize> {
    let mut repaired = 0usize;
    for project_id in ctx.meta.list_project_ids()? {
        for binding in ctx.meta.collections_for_project(&project_id, None)? {
            let name = &binding.collection_name;
            let meta_ids: HashSet<String> =
                ctx.meta.chunk_ids_for_collection(name)?.into_iter().collect();
            let point_ids: HashSet<String> = match ctx.vectors.point_ids(name).await {
                Ok(ids) => ids.into_iter().collect(),
                Err(_) => continue, // collection not created yet
            };

            let rows_without_vectors: Vec<String> =
                meta_ids.difference(&point_ids).cloned().collect();
            let vectors_without_rows: Vec<String> =
                point_ids.difference(&meta_ids).cloned().collect();

            if !rows_without_vectors.is_empty() {
                repaired += ctx.meta.delete_chunks(name, &rows_without_vectors)?;
            }
            if !vectors_without_rows.is_empty() {
                ctx.vectors.delete_points(name, &vectors_without_rows).await?;
                repaired += vectors_without_rows.len();
            }
        }
    }
    if repaired > 0 {
        info!(repaired, "reconciliation sweep removed orphans");
    }
    Ok(repaired)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discovered(path: &str, hash: &str) -> DiscoveredFile {
        DiscoveredFile {
            rel_path: path.to_string(),
            abs_path: PathBuf::from(path),
            hash: hash.to_string(),
        }
    }

    fn snapshot(path: &str, hash: &str) -> FileSnapshot {
        FileSnapshot {
            project_id: "p".into(),
            dataset_id: "d".into(),
            relative_path: path.to_string(),
            file_hash: hash.to_string(),
            chunk_ids: vec![format!("{path}-old")],
            indexed_at: Utc::now(),
        }
    }

    #[test]
    fn plan_partitions_added_changed_removed() {
        let files = vec![
            discovered("a.rs", "h1"),     // unchanged
            discovered("b.rs", "h2-new"), // changed
            discovered("c.rs", "h3"),     // added
        ];
        let snaps = vec![snapshot("a.rs", "h1"), snapshot("b.rs", "h2"), snapshot("gone.rs", "h4")];

        let plan = compute_plan(files, snaps, false);
        assert_eq!(plan.unchanged, 1);
        assert_eq!(plan.removed, 1);
        let work: Vec<&str> = plan.work.iter().map(|f| f.rel_path.as_str()).collect();
        assert_eq!(work, vec!["b.rs", "c.rs"]);
        let stale: Vec<&str> = plan.stale.iter().map(|s| s.relative_path.as_str()).collect();
        assert_eq!(stale, vec!["b.rs", "gone.rs"]);
    }

    #[test]
    fn force_treats_everything_as_changed() {
        let files = vec![discovered("a.rs", "h1")];
        let snaps = vec![snapshot("a.rs", "h1")];
        let plan = compute_plan(files, snaps, true);
        assert_eq!(plan.unchanged, 0);
        assert_eq!(plan.work.len(), 1);
        assert_eq!(plan.stale.len(), 1);
    }

    #[test]
    fn discovery_skips_binaries_and_oversize() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ok.rs"), "fn main() {}").unwrap();
        std::fs::write(dir.path().join("img.png"), [0u8, 1, 2]).unwrap();
        std::fs::write(dir.path().join("blob.dat"), [0u8; 64]).unwrap();
        std::fs::write(dir.path().join("big.txt"), "x".repeat(4096)).unwrap();
        std::fs::create_dir(dir.path().join("node_modules")).unwrap();
        std::fs::write(dir.path().join("node_modules/dep.js"), "module.exports = 1;").unwrap();

        let mut tally = FailureTally::default();
        let files = discover_files(dir.path(), 1024, &mut tally);
        let names: Vec<&str> = files.iter().map(|f| f.rel_path.as_str()).collect();
        assert_eq!(names, vec!["ok.rs"]);
        // blob.dat (NUL sniff) and big.txt (size cap) are soft skips
        assert_eq!(tally.failed, 2);
    }

    #[test]
    fn discovery_hashes_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let mut tally = FailureTally::default();
        let files = discover_files(dir.path(), 1024, &mut tally);
        assert_eq!(files[0].hash, file_hash(b"hello"));
    }
}
