//! Metadata store — the durable half of the dual-store pair.
//!
//! One sqlite database holds projects, datasets, dataset→collection
//! bindings, file snapshots, the denormalized chunk mirror, jobs, crawl
//! sessions, web provenance, and shares. Every public operation is a single
//! statement or one short transaction (the dedup-checked enqueue), so the
//! hot path never holds the connection across I/O it doesn't own.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use atoll_core::types::{
    Chunk, CrawlSession, CrawlStats, Dataset, DatasetScope, FileSnapshot, Job, JobKind, JobState,
    Progress, ProjectStats, Symbol, WebPageProvenance,
};

use crate::error::{Error, Result};

/// Running jobs with no heartbeat for this long are orphans.
pub const ORPHAN_AFTER_SECS: i64 = 60;

// ---------------------------------------------------------------------------
// Store handle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MetaStore {
    conn: Arc<Mutex<Connection>>,
}

/// A dataset-bound collection as the retrieval engine needs it: which
/// encoder family its dense field is pinned to, and whether it carries
/// sparse vectors.
#[derive(Debug, Clone)]
pub struct CollectionBinding {
    pub collection_name: String,
    pub dataset_id: String,
    pub dataset_name: String,
    pub family: String,
    pub dense_dim: usize,
    pub sparse: bool,
}

/// What `projects.clear` would (or did) remove.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ClearSummary {
    pub datasets: usize,
    pub collections: Vec<String>,
    pub chunks: usize,
    pub snapshots: usize,
    pub dry_run: bool,
}

impl MetaStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_conn(conn)
    }

    /// In-memory store, used by tests and `--ephemeral` runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_conn(Connection::open_in_memory()?)
    }

    fn from_conn(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(MetaStore { conn: Arc::new(Mutex::new(conn)) })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    // -----------------------------------------------------------------------
    // Projects
    // -----------------------------------------------------------------------

    /// Create the project on first reference; subsequent calls are no-ops
    /// returning the stored row. `locator_hash` is the full-locator hash used
    /// for collision verification.
    pub fn get_or_create_project(
        &self,
        id: &str,
        name: &str,
        locator_hash: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO projects (id, name, name_lower, locator_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO NOTHING",
            params![id, name, name.to_lowercase(), locator_hash, now_str()],
        )?;
        Ok(())
    }

    /// True when `project_id` is already taken by a *different* locator —
    /// the scope resolver salts and retries on this.
    pub fn project_locator_collides(&self, project_id: &str, locator_hash: &str) -> bool {
        let conn = self.lock();
        conn.query_row(
            "SELECT locator_hash FROM projects WHERE id = ?1",
            params![project_id],
            |row| row.get::<_, Option<String>>(0),
        )
        .optional()
        .ok()
        .flatten()
        .flatten()
        .map(|stored| stored != locator_hash)
        .unwrap_or(false)
    }

    pub fn list_project_ids(&self) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT id FROM projects ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    // -----------------------------------------------------------------------
    // Datasets and collection bindings
    // -----------------------------------------------------------------------

    pub fn get_or_create_dataset(
        &self,
        project_id: &str,
        name: &str,
        scope: DatasetScope,
    ) -> Result<Dataset> {
        let conn = self.lock();
        let existing = conn
            .query_row(
                "SELECT id, scope, metadata FROM datasets WHERE project_id = ?1 AND name = ?2",
                params![project_id, name],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        if let Some((id, scope_str, metadata)) = existing {
            return Ok(Dataset {
                id,
                project_id: project_id.to_string(),
                name: name.to_string(),
                scope: parse_scope(&scope_str),
                metadata: serde_json::from_str(&metadata).unwrap_or_default(),
            });
        }

        let id = ulid::Ulid::new().to_string().to_lowercase();
        conn.execute(
            "INSERT INTO datasets (id, project_id, name, scope, metadata) VALUES (?1, ?2, ?3, ?4, '{}')",
            params![id, project_id, name, scope.as_str()],
        )?;
        Ok(Dataset {
            id,
            project_id: project_id.to_string(),
            name: name.to_string(),
            scope,
            metadata: BTreeMap::new(),
        })
    }

    pub fn get_dataset(&self, dataset_id: &str) -> Result<Dataset> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, project_id, name, scope, metadata FROM datasets WHERE id = ?1",
            params![dataset_id],
            |row| {
                let metadata: String = row.get(4)?;
                Ok(Dataset {
                    id: row.get(0)?,
                    project_id: row.get(1)?,
                    name: row.get(2)?,
                    scope: parse_scope(&row.get::<_, String>(3)?),
                    metadata: serde_json::from_str(&metadata).unwrap_or_default(),
                })
            },
        )
        .optional()?
        .ok_or_else(|| Error::StoreFatal(format!("unknown dataset {dataset_id}")))
    }

    /// Bind a dataset to a physical collection, pinning the encoder family
    /// and dimensionality. Idempotent; re-binding with a different family is
    /// a store error (collections are never reused across families).
    pub fn bind_collection(
        &self,
        dataset_id: &str,
        collection_name: &str,
        family: &str,
        dense_dim: usize,
        sparse: bool,
    ) -> Result<()> {
        let conn = self.lock();
        let existing = conn
            .query_row(
                "SELECT family FROM dataset_collections
                 WHERE dataset_id = ?1 AND collection_name = ?2",
                params![dataset_id, collection_name],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        match existing {
            Some(f) if f == family => Ok(()),
            Some(f) => Err(Error::StoreFatal(format!(
                "collection {collection_name} is pinned to encoder family {f}, not {family}"
            ))),
            None => {
                conn.execute(
                    "INSERT INTO dataset_collections
                       (dataset_id, collection_name, family, dense_dim, sparse, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![dataset_id, collection_name, family, dense_dim, sparse, now_str()],
                )?;
                Ok(())
            }
        }
    }

    /// All collections a query under `project_id` may touch, optionally
    /// narrowed to named datasets. Scope isolation lives here: only
    /// collections of datasets owned by the project are returned.
    pub fn collections_for_project(
        &self,
        project_id: &str,
        dataset_filter: Option<&[String]>,
    ) -> Result<Vec<CollectionBinding>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT dc.collection_name, dc.dataset_id, d.name, dc.family, dc.dense_dim, dc.sparse
             FROM dataset_collections dc JOIN datasets d ON d.id = dc.dataset_id
             WHERE d.project_id = ?1
             ORDER BY dc.collection_name",
        )?;
        let rows = stmt.query_map(params![project_id], binding_from_row)?;
        let mut out: Vec<CollectionBinding> = rows.collect::<rusqlite::Result<_>>()?;
        if let Some(filter) = dataset_filter {
            out.retain(|b| filter.iter().any(|f| f == &b.dataset_name));
        }
        Ok(out)
    }

    /// Collections of global-scope datasets, for `include_global` queries.
    pub fn global_collections(&self) -> Result<Vec<CollectionBinding>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT dc.collection_name, dc.dataset_id, d.name, dc.family, dc.dense_dim, dc.sparse
             FROM dataset_collections dc JOIN datasets d ON d.id = dc.dataset_id
             WHERE d.scope = 'global'
             ORDER BY dc.collection_name",
        )?;
        let rows = stmt.query_map([], binding_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    // -----------------------------------------------------------------------
    // File snapshots (incremental sync state)
    // -----------------------------------------------------------------------

    pub fn upsert_file_snapshot(&self, snap: &FileSnapshot) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO file_snapshots
               (project_id, dataset_id, relative_path, file_hash, chunk_ids, indexed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(dataset_id, relative_path) DO UPDATE SET
               file_hash = excluded.file_hash,
               chunk_ids = excluded.chunk_ids,
               indexed_at = excluded.indexed_at",
            params![
                snap.project_id,
                snap.dataset_id,
                snap.relative_path,
                snap.file_hash,
                serde_json::to_string(&snap.chunk_ids)?,
                snap.indexed_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn list_file_snapshots(&self, dataset_id: &str) -> Result<Vec<FileSnapshot>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT project_id, dataset_id, relative_path, file_hash, chunk_ids, indexed_at
             FROM file_snapshots WHERE dataset_id = ?1 ORDER BY relative_path",
        )?;
        let rows = stmt.query_map(params![dataset_id], |row| {
            let chunk_ids: String = row.get(4)?;
            Ok(FileSnapshot {
                project_id: row.get(0)?,
                dataset_id: row.get(1)?,
                relative_path: row.get(2)?,
                file_hash: row.get(3)?,
                chunk_ids: serde_json::from_str(&chunk_ids).unwrap_or_default(),
                indexed_at: parse_ts(5, &row.get::<_, String>(5)?)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn delete_file_snapshot(&self, dataset_id: &str, relative_path: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM file_snapshots WHERE dataset_id = ?1 AND relative_path = ?2",
            params![dataset_id, relative_path],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Chunk mirror
    // -----------------------------------------------------------------------

    /// Upsert chunk rows. Identity is content-derived, so replaying a batch
    /// is harmless.
    pub fn upsert_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO chunks
                   (id, collection_name, project_id, dataset_id, relative_path,
                    start_line, end_line, lang, repo, file_hash, content, symbol,
                    metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            )?;
            for c in chunks {
                stmt.execute(params![
                    c.id,
                    c.collection_name,
                    c.project_id,
                    c.dataset_id,
                    c.relative_path,
                    c.start_line as i64,
                    c.end_line as i64,
                    c.lang,
                    c.repo,
                    c.file_hash,
                    c.content,
                    c.symbol.as_ref().map(serde_json::to_string).transpose()?,
                    serde_json::to_string(&c.metadata)?,
                    c.created_at.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn delete_chunks(&self, collection_name: &str, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut deleted = 0usize;
        {
            let mut stmt =
                tx.prepare("DELETE FROM chunks WHERE collection_name = ?1 AND id = ?2")?;
            for id in ids {
                deleted += stmt.execute(params![collection_name, id])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    /// Delete chunk rows by id within a dataset, returning
    /// `(collection_name, id)` pairs so the caller can mirror the deletes
    /// into the vector store.
    pub fn delete_chunks_by_ids(
        &self,
        dataset_id: &str,
        ids: &[String],
    ) -> Result<Vec<(String, String)>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut deleted = Vec::new();
        {
            let mut find = tx.prepare(
                "SELECT collection_name FROM chunks WHERE dataset_id = ?1 AND id = ?2",
            )?;
            let mut remove =
                tx.prepare("DELETE FROM chunks WHERE dataset_id = ?1 AND id = ?2")?;
            for id in ids {
                let collection: Option<String> = find
                    .query_row(params![dataset_id, id], |row| row.get(0))
                    .optional()?;
                if let Some(collection) = collection {
                    remove.execute(params![dataset_id, id])?;
                    deleted.push((collection, id.clone()));
                }
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    pub fn get_chunk(&self, collection_name: &str, id: &str) -> Result<Option<Chunk>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, collection_name, project_id, dataset_id, relative_path, start_line,
                    end_line, lang, repo, file_hash, content, symbol, metadata, created_at
             FROM chunks WHERE collection_name = ?1 AND id = ?2",
            params![collection_name, id],
            chunk_from_row,
        )
        .optional()
        .map_err(Error::from)
    }

    /// All chunk ids in a collection, for the reconciliation sweep.
    pub fn chunk_ids_for_collection(&self, collection_name: &str) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT id FROM chunks WHERE collection_name = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![collection_name], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    /// Enqueue with dedup: when a non-terminal job already holds this
    /// `dedup_key`, the existing job comes back and `created` is false.
    pub fn enqueue_job(&self, job: &Job) -> Result<(Job, bool)> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let existing = tx
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     WHERE dedup_key = ?1 AND state IN ('queued', 'running')
                     ORDER BY rowid LIMIT 1"
                ),
                params![job.dedup_key],
                job_from_row,
            )
            .optional()?;

        if let Some(found) = existing {
            tx.commit()?;
            return Ok((found, false));
        }

        tx.execute(
            "INSERT INTO jobs (id, kind, project_id, dataset_id, state, dedup_key, payload,
                               phase, fraction, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                job.id,
                job.kind.as_str(),
                job.project_id,
                job.dataset_id,
                job.state.as_str(),
                job.dedup_key,
                serde_json::to_string(&job.payload)?,
                job.progress.phase,
                job.progress.fraction,
                serde_json::to_string(&job.metadata)?,
                job.created_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok((job.clone(), true))
    }

    /// Atomically claim the oldest queued job of `kind` for execution.
    pub fn claim_next_job(&self, kind: JobKind) -> Result<Option<Job>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let candidate = tx
            .query_row(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs
                     WHERE state = 'queued' AND kind = ?1 ORDER BY rowid LIMIT 1"
                ),
                params![kind.as_str()],
                job_from_row,
            )
            .optional()?;

        let Some(mut job) = candidate else {
            tx.commit()?;
            return Ok(None);
        };

        let now = now_str();
        tx.execute(
            "UPDATE jobs SET state = 'running', started_at = ?2, heartbeat_at = ?2
             WHERE id = ?1 AND state = 'queued'",
            params![job.id, now],
        )?;
        tx.commit()?;

        job.state = JobState::Running;
        job.started_at = Some(Utc::now());
        Ok(Some(job))
    }

    pub fn heartbeat_job(&self, id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE jobs SET heartbeat_at = ?2 WHERE id = ?1 AND state = 'running'",
            params![id, now_str()],
        )?;
        Ok(())
    }

    /// Persist progress. The monotonic clamp happens in the progress mapper;
    /// the store just records what it is told.
    pub fn update_job_progress(
        &self,
        id: &str,
        phase: &str,
        fraction: f64,
        detail: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE jobs SET phase = ?2, fraction = ?3, detail = ?4
             WHERE id = ?1 AND state IN ('queued', 'running')",
            params![id, phase, fraction, detail],
        )?;
        Ok(())
    }

    /// Move a job to a terminal (or running) state. Terminal states are
    /// immutable: updates against a finished job are ignored.
    pub fn finish_job(
        &self,
        id: &str,
        state: JobState,
        error: Option<&str>,
        summary: Option<&serde_json::Value>,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE jobs SET state = ?2, error = ?3, finished_at = ?4,
                    metadata = json_set(metadata, '$.summary', json(?5))
             WHERE id = ?1 AND state IN ('queued', 'running')",
            params![
                id,
                state.as_str(),
                error,
                now_str(),
                serde_json::to_string(summary.unwrap_or(&serde_json::Value::Null))?,
            ],
        )?;
        Ok(())
    }

    pub fn get_job(&self, id: &str) -> Result<Job> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            params![id],
            job_from_row,
        )
        .optional()?
        .ok_or_else(|| Error::JobNotFound(id.to_string()))
    }

    pub fn list_jobs(
        &self,
        project_id: Option<&str>,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE (?1 IS NULL OR project_id = ?1) AND (?2 IS NULL OR state = ?2)
             ORDER BY rowid DESC LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            params![project_id, state.map(|s| s.as_str()), limit as i64],
            job_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Startup recovery: running jobs whose heartbeat went stale become
    /// `failed/"orphaned"`.
    pub fn mark_orphaned_jobs(&self) -> Result<usize> {
        let cutoff = (Utc::now() - chrono::Duration::seconds(ORPHAN_AFTER_SECS)).to_rfc3339();
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE jobs SET state = 'failed', error = 'orphaned', finished_at = ?1
             WHERE state = 'running' AND (heartbeat_at IS NULL OR heartbeat_at < ?1)",
            params![cutoff],
        )?;
        Ok(n)
    }

    // -----------------------------------------------------------------------
    // Crawl sessions
    // -----------------------------------------------------------------------

    pub fn create_crawl_session(&self, session: &CrawlSession) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO crawl_sessions
               (id, project_id, dataset_id, seed_url, mode, max_pages, max_depth,
                status, stats, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                session.id,
                session.project_id,
                session.dataset_id,
                session.seed_url,
                session.mode.as_str(),
                session.max_pages as i64,
                session.max_depth as i64,
                session.status.as_str(),
                serde_json::to_string(&session.stats)?,
                session.started_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn finish_crawl_session(
        &self,
        id: &str,
        status: JobState,
        stats: &CrawlStats,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE crawl_sessions SET status = ?2, stats = ?3, finished_at = ?4
             WHERE id = ?1 AND finished_at IS NULL",
            params![id, status.as_str(), serde_json::to_string(stats)?, now_str()],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Web provenance
    // -----------------------------------------------------------------------

    /// Record a fetched page. Returns true when the content is new or
    /// changed (i.e. the page needs chunking); an unchanged page only gets
    /// its `last_indexed_at` bumped.
    pub fn upsert_web_provenance(
        &self,
        url: &str,
        domain: &str,
        content_hash: &str,
        last_modified_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let conn = self.lock();
        let existing = conn
            .query_row(
                "SELECT content_hash FROM web_provenance WHERE url = ?1",
                params![url],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        let now = now_str();
        match existing {
            None => {
                conn.execute(
                    "INSERT INTO web_provenance
                       (url, domain, first_indexed_at, last_indexed_at, last_modified_at,
                        content_hash, version, metadata)
                     VALUES (?1, ?2, ?3, ?3, ?4, ?5, 1, '{}')",
                    params![url, domain, now, last_modified_at.map(|t| t.to_rfc3339()), content_hash],
                )?;
                Ok(true)
            }
            Some(stored) if stored == content_hash => {
                conn.execute(
                    "UPDATE web_provenance SET last_indexed_at = ?2 WHERE url = ?1",
                    params![url, now],
                )?;
                Ok(false)
            }
            Some(_) => {
                conn.execute(
                    "UPDATE web_provenance SET last_indexed_at = ?2, last_modified_at = ?3,
                            content_hash = ?4, version = version + 1
                     WHERE url = ?1",
                    params![url, now, last_modified_at.map(|t| t.to_rfc3339()), content_hash],
                )?;
                Ok(true)
            }
        }
    }

    pub fn get_web_provenance(&self, url: &str) -> Result<Option<WebPageProvenance>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT url, domain, first_indexed_at, last_indexed_at, last_modified_at,
                    content_hash, version, metadata
             FROM web_provenance WHERE url = ?1",
            params![url],
            |row| {
                let metadata: String = row.get(7)?;
                Ok(WebPageProvenance {
                    url: row.get(0)?,
                    domain: row.get(1)?,
                    first_indexed_at: parse_ts(2, &row.get::<_, String>(2)?)?,
                    last_indexed_at: parse_ts(3, &row.get::<_, String>(3)?)?,
                    last_modified_at: row
                        .get::<_, Option<String>>(4)?
                        .map(|s| parse_ts(4, &s))
                        .transpose()?,
                    content_hash: row.get(5)?,
                    version: row.get::<_, i64>(6)? as u64,
                    metadata: serde_json::from_str(&metadata).unwrap_or_default(),
                })
            },
        )
        .optional()
        .map_err(Error::from)
    }

    // -----------------------------------------------------------------------
    // Shares
    // -----------------------------------------------------------------------

    /// Record a read grant of a dataset to another project.
    pub fn record_share(&self, dataset_id: &str, granted_project_id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO shares (dataset_id, granted_project_id, access, created_at)
             VALUES (?1, ?2, 'read', ?3)
             ON CONFLICT(dataset_id, granted_project_id) DO NOTHING",
            params![dataset_id, granted_project_id, now_str()],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stats and clearing
    // -----------------------------------------------------------------------

    pub fn project_stats(&self, project_id: &str) -> Result<ProjectStats> {
        let conn = self.lock();
        let datasets: i64 = conn.query_row(
            "SELECT COUNT(*) FROM datasets WHERE project_id = ?1",
            params![project_id],
            |row| row.get(0),
        )?;
        let collections: i64 = conn.query_row(
            "SELECT COUNT(*) FROM dataset_collections dc
             JOIN datasets d ON d.id = dc.dataset_id WHERE d.project_id = ?1",
            params![project_id],
            |row| row.get(0),
        )?;
        let files: i64 = conn.query_row(
            "SELECT COUNT(*) FROM file_snapshots WHERE project_id = ?1",
            params![project_id],
            |row| row.get(0),
        )?;
        let chunks: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE project_id = ?1",
            params![project_id],
            |row| row.get(0),
        )?;
        let pages: i64 = conn.query_row(
            "SELECT COUNT(*) FROM web_provenance wp
             WHERE EXISTS (SELECT 1 FROM chunks c
                           WHERE c.project_id = ?1 AND c.relative_path = wp.url)",
            params![project_id],
            |row| row.get(0),
        )?;
        Ok(ProjectStats {
            project_id: project_id.to_string(),
            datasets: datasets as usize,
            collections: collections as usize,
            files: files as usize,
            chunks: chunks as usize,
            pages: pages as usize,
        })
    }

    /// Remove a project's (or one dataset's) rows. Returns the collection
    /// names so the caller can drop them from the vector store too.
    pub fn clear_project(
        &self,
        project_id: &str,
        dataset: Option<&str>,
        dry_run: bool,
    ) -> Result<ClearSummary> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let mut summary = ClearSummary { dry_run, ..Default::default() };
        {
            let mut stmt = tx.prepare(
                "SELECT d.id, dc.collection_name FROM datasets d
                 LEFT JOIN dataset_collections dc ON dc.dataset_id = d.id
                 WHERE d.project_id = ?1 AND (?2 IS NULL OR d.name = ?2)",
            )?;
            let rows = stmt.query_map(params![project_id, dataset], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })?;

            let mut dataset_ids: Vec<String> = Vec::new();
            for row in rows {
                let (dataset_id, collection) = row?;
                if !dataset_ids.contains(&dataset_id) {
                    dataset_ids.push(dataset_id);
                }
                if let Some(name) = collection {
                    if !summary.collections.contains(&name) {
                        summary.collections.push(name);
                    }
                }
            }
            summary.datasets = dataset_ids.len();

            for dataset_id in &dataset_ids {
                let chunks: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM chunks WHERE dataset_id = ?1",
                    params![dataset_id],
                    |row| row.get(0),
                )?;
                let snapshots: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM file_snapshots WHERE dataset_id = ?1",
                    params![dataset_id],
                    |row| row.get(0),
                )?;
                summary.chunks += chunks as usize;
                summary.snapshots += snapshots as usize;

                if !dry_run {
                    tx.execute("DELETE FROM chunks WHERE dataset_id = ?1", params![dataset_id])?;
                    tx.execute(
                        "DELETE FROM file_snapshots WHERE dataset_id = ?1",
                        params![dataset_id],
                    )?;
                    tx.execute("DELETE FROM datasets WHERE id = ?1", params![dataset_id])?;
                }
            }

            if !dry_run && dataset.is_none() {
                tx.execute("DELETE FROM projects WHERE id = ?1", params![project_id])?;
            }
        }
        tx.commit()?;
        Ok(summary)
    }
}

// ---------------------------------------------------------------------------
// Row conversion
// ---------------------------------------------------------------------------

const JOB_COLUMNS: &str = "id, kind, project_id, dataset_id, state, dedup_key, payload, phase, \
                           fraction, detail, error, started_at, finished_at, metadata, created_at";

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let payload: String = row.get(6)?;
    let metadata: String = row.get(13)?;
    Ok(Job {
        id: row.get(0)?,
        kind: parse_kind(&row.get::<_, String>(1)?),
        project_id: row.get(2)?,
        dataset_id: row.get(3)?,
        state: parse_state(&row.get::<_, String>(4)?),
        dedup_key: row.get(5)?,
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        progress: Progress {
            phase: row.get(7)?,
            fraction: row.get(8)?,
            detail: row.get(9)?,
        },
        error: row.get(10)?,
        started_at: row.get::<_, Option<String>>(11)?.map(|s| parse_ts(11, &s)).transpose()?,
        finished_at: row.get::<_, Option<String>>(12)?.map(|s| parse_ts(12, &s)).transpose()?,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        created_at: parse_ts(14, &row.get::<_, String>(14)?)?,
    })
}

fn chunk_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chunk> {
    let symbol: Option<String> = row.get(11)?;
    let metadata: String = row.get(12)?;
    Ok(Chunk {
        id: row.get(0)?,
        collection_name: row.get(1)?,
        project_id: row.get(2)?,
        dataset_id: row.get(3)?,
        relative_path: row.get(4)?,
        start_line: row.get::<_, i64>(5)? as usize,
        end_line: row.get::<_, i64>(6)? as usize,
        lang: row.get(7)?,
        repo: row.get(8)?,
        file_hash: row.get(9)?,
        content: row.get(10)?,
        sparse_vector: None,
        symbol: symbol.and_then(|s| serde_json::from_str::<Symbol>(&s).ok()),
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        created_at: parse_ts(13, &row.get::<_, String>(13)?)?,
    })
}

fn binding_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CollectionBinding> {
    Ok(CollectionBinding {
        collection_name: row.get(0)?,
        dataset_id: row.get(1)?,
        dataset_name: row.get(2)?,
        family: row.get(3)?,
        dense_dim: row.get::<_, i64>(4)? as usize,
        sparse: row.get(5)?,
    })
}

fn now_str() -> String {
    Utc::now().to_rfc3339()
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_scope(raw: &str) -> DatasetScope {
    match raw {
        "global" => DatasetScope::Global,
        "local" => DatasetScope::Local,
        _ => DatasetScope::Project,
    }
}

fn parse_state(raw: &str) -> JobState {
    match raw {
        "queued" => JobState::Queued,
        "running" => JobState::Running,
        "succeeded" => JobState::Succeeded,
        "skipped" => JobState::Skipped,
        "cancelled" => JobState::Cancelled,
        _ => JobState::Failed,
    }
}

fn parse_kind(raw: &str) -> JobKind {
    match raw {
        "ingest_remote_repo" => JobKind::IngestRemoteRepo,
        "crawl" => JobKind::Crawl,
        "reindex" => JobKind::Reindex,
        _ => JobKind::IngestLocal,
    }
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// Migrations add columns, never remove: table and column names are stable.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS projects (
    id            TEXT PRIMARY KEY,
    name          TEXT NOT NULL,
    name_lower    TEXT NOT NULL UNIQUE,
    locator_hash  TEXT,
    created_at    TEXT NOT NULL,
    metadata      TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS datasets (
    id          TEXT PRIMARY KEY,
    project_id  TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    name        TEXT NOT NULL,
    scope       TEXT NOT NULL DEFAULT 'project',
    metadata    TEXT NOT NULL DEFAULT '{}',
    UNIQUE (project_id, name)
);

CREATE TABLE IF NOT EXISTS dataset_collections (
    dataset_id       TEXT NOT NULL REFERENCES datasets(id) ON DELETE CASCADE,
    collection_name  TEXT NOT NULL,
    family           TEXT NOT NULL DEFAULT 'text',
    dense_dim        INTEGER NOT NULL DEFAULT 0,
    sparse           INTEGER NOT NULL DEFAULT 0,
    created_at       TEXT NOT NULL,
    PRIMARY KEY (dataset_id, collection_name)
);

CREATE TABLE IF NOT EXISTS file_snapshots (
    project_id     TEXT NOT NULL,
    dataset_id     TEXT NOT NULL,
    relative_path  TEXT NOT NULL,
    file_hash      TEXT NOT NULL,
    chunk_ids      TEXT NOT NULL DEFAULT '[]',
    indexed_at     TEXT NOT NULL,
    PRIMARY KEY (dataset_id, relative_path)
);
CREATE INDEX IF NOT EXISTS idx_snapshots_project ON file_snapshots (project_id, dataset_id);

CREATE TABLE IF NOT EXISTS chunks (
    id               TEXT NOT NULL,
    collection_name  TEXT NOT NULL,
    project_id       TEXT NOT NULL,
    dataset_id       TEXT NOT NULL,
    relative_path    TEXT NOT NULL,
    start_line       INTEGER NOT NULL,
    end_line         INTEGER NOT NULL,
    lang             TEXT,
    repo             TEXT,
    file_hash        TEXT NOT NULL,
    content          TEXT NOT NULL,
    symbol           TEXT,
    metadata         TEXT NOT NULL DEFAULT '{}',
    created_at       TEXT NOT NULL,
    PRIMARY KEY (collection_name, id)
);
CREATE INDEX IF NOT EXISTS idx_chunks_dataset ON chunks (dataset_id, relative_path);
CREATE INDEX IF NOT EXISTS idx_chunks_project ON chunks (project_id);

CREATE TABLE IF NOT EXISTS jobs (
    id           TEXT PRIMARY KEY,
    kind         TEXT NOT NULL,
    project_id   TEXT NOT NULL,
    dataset_id   TEXT NOT NULL,
    state        TEXT NOT NULL DEFAULT 'queued',
    dedup_key    TEXT NOT NULL,
    payload      TEXT NOT NULL DEFAULT 'null',
    phase        TEXT NOT NULL DEFAULT 'queued',
    fraction     REAL NOT NULL DEFAULT 0,
    detail       TEXT,
    error        TEXT,
    heartbeat_at TEXT,
    started_at   TEXT,
    finished_at  TEXT,
    metadata     TEXT NOT NULL DEFAULT '{}',
    created_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs (state);
CREATE INDEX IF NOT EXISTS idx_jobs_dedup ON jobs (dedup_key);
CREATE INDEX IF NOT EXISTS idx_jobs_project ON jobs (project_id);

CREATE TABLE IF NOT EXISTS crawl_sessions (
    id          TEXT PRIMARY KEY,
    project_id  TEXT NOT NULL,
    dataset_id  TEXT NOT NULL,
    seed_url    TEXT NOT NULL,
    mode        TEXT NOT NULL,
    max_pages   INTEGER NOT NULL,
    max_depth   INTEGER NOT NULL,
    status      TEXT NOT NULL,
    stats       TEXT NOT NULL DEFAULT '{}',
    started_at  TEXT NOT NULL,
    finished_at TEXT
);

CREATE TABLE IF NOT EXISTS web_provenance (
    url              TEXT PRIMARY KEY,
    domain           TEXT NOT NULL,
    first_indexed_at TEXT NOT NULL,
    last_indexed_at  TEXT NOT NULL,
    last_modified_at TEXT,
    content_hash     TEXT NOT NULL,
    version          INTEGER NOT NULL DEFAULT 1,
    metadata         TEXT NOT NULL DEFAULT '{}'
);
CREATE INDEX IF NOT EXISTS idx_provenance_domain ON web_provenance (domain);

CREATE TABLE IF NOT EXISTS shares (
    dataset_id          TEXT NOT NULL REFERENCES datasets(id) ON DELETE CASCADE,
    granted_project_id  TEXT NOT NULL,
    access              TEXT NOT NULL DEFAULT 'read',
    created_at          TEXT NOT NULL,
    PRIMARY KEY (dataset_id, granted_project_id)
);
";

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fresh_job(dedup: &str) -> Job {
        Job {
            id: ulid::Ulid::new().to_string().to_lowercase(),
            kind: JobKind::IngestLocal,
            project_id: "p1".into(),
            dataset_id: "d1".into(),
            state: JobState::Queued,
            dedup_key: dedup.into(),
            payload: json!({"path": "/tmp/x"}),
            progress: Progress::default(),
            started_at: None,
            finished_at: None,
            error: None,
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn project_and_dataset_creation_is_idempotent() {
        let store = MetaStore::open_in_memory().unwrap();
        store.get_or_create_project("p1", "p1", Some("hashA")).unwrap();
        store.get_or_create_project("p1", "p1", Some("hashA")).unwrap();

        let a = store.get_or_create_dataset("p1", "local", DatasetScope::Local).unwrap();
        let b = store.get_or_create_dataset("p1", "local", DatasetScope::Local).unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn locator_collision_detection() {
        let store = MetaStore::open_in_memory().unwrap();
        store.get_or_create_project("p1", "p1", Some("hashA")).unwrap();
        assert!(!store.project_locator_collides("p1", "hashA"));
        assert!(store.project_locator_collides("p1", "hashB"));
        assert!(!store.project_locator_collides("unknown", "hashA"));
    }

    #[test]
    fn collection_binding_pins_encoder_family() {
        let store = MetaStore::open_in_memory().unwrap();
        store.get_or_create_project("p1", "p1", None).unwrap();
        let ds = store.get_or_create_dataset("p1", "local", DatasetScope::Local).unwrap();

        store.bind_collection(&ds.id, "project_p1_dataset_local", "code", 768, false).unwrap();
        // same family: fine
        store.bind_collection(&ds.id, "project_p1_dataset_local", "code", 768, false).unwrap();
        // different family: refused
        let err = store.bind_collection(&ds.id, "project_p1_dataset_local", "text", 384, false);
        assert!(err.is_err());
    }

    #[test]
    fn scope_isolation_in_collection_listing() {
        let store = MetaStore::open_in_memory().unwrap();
        store.get_or_create_project("p1", "p1", None).unwrap();
        store.get_or_create_project("p2", "p2", None).unwrap();
        let d1 = store.get_or_create_dataset("p1", "local", DatasetScope::Local).unwrap();
        let d2 = store.get_or_create_dataset("p2", "local", DatasetScope::Local).unwrap();
        store.bind_collection(&d1.id, "c1", "text", 384, false).unwrap();
        store.bind_collection(&d2.id, "c2", "text", 384, false).unwrap();

        let got = store.collections_for_project("p1", None).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].collection_name, "c1");
    }

    #[test]
    fn job_dedup_returns_existing() {
        let store = MetaStore::open_in_memory().unwrap();
        let (first, created) = store.enqueue_job(&fresh_job("k1")).unwrap();
        assert!(created);
        let (second, created) = store.enqueue_job(&fresh_job("k1")).unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);

        // Finish it; the key is free again.
        store.finish_job(&first.id, JobState::Succeeded, None, None).unwrap();
        let (_, created) = store.enqueue_job(&fresh_job("k1")).unwrap();
        assert!(created);
    }

    #[test]
    fn claim_is_fifo_and_single_shot() {
        let store = MetaStore::open_in_memory().unwrap();
        let (a, _) = store.enqueue_job(&fresh_job("k1")).unwrap();
        let (b, _) = store.enqueue_job(&fresh_job("k2")).unwrap();

        let first = store.claim_next_job(JobKind::IngestLocal).unwrap().unwrap();
        assert_eq!(first.id, a.id);
        assert_eq!(first.state, JobState::Running);
        let second = store.claim_next_job(JobKind::IngestLocal).unwrap().unwrap();
        assert_eq!(second.id, b.id);
        assert!(store.claim_next_job(JobKind::IngestLocal).unwrap().is_none());
    }

    #[test]
    fn terminal_state_is_immutable() {
        let store = MetaStore::open_in_memory().unwrap();
        let (job, _) = store.enqueue_job(&fresh_job("k1")).unwrap();
        store.finish_job(&job.id, JobState::Cancelled, None, None).unwrap();
        store.finish_job(&job.id, JobState::Succeeded, None, None).unwrap();
        assert_eq!(store.get_job(&job.id).unwrap().state, JobState::Cancelled);
    }

    #[test]
    fn orphan_sweep_fails_stale_running_jobs() {
        let store = MetaStore::open_in_memory().unwrap();
        let (job, _) = store.enqueue_job(&fresh_job("k1")).unwrap();
        store.claim_next_job(JobKind::IngestLocal).unwrap();

        // Backdate the heartbeat past the cutoff.
        {
            let conn = store.lock();
            let stale = (Utc::now() - chrono::Duration::seconds(ORPHAN_AFTER_SECS * 2))
                .to_rfc3339();
            conn.execute(
                "UPDATE jobs SET heartbeat_at = ?2 WHERE id = ?1",
                params![job.id, stale],
            )
            .unwrap();
        }

        assert_eq!(store.mark_orphaned_jobs().unwrap(), 1);
        let got = store.get_job(&job.id).unwrap();
        assert_eq!(got.state, JobState::Failed);
        assert_eq!(got.error.as_deref(), Some("orphaned"));
    }

    #[test]
    fn snapshots_round_trip_and_replace() {
        let store = MetaStore::open_in_memory().unwrap();
        let snap = FileSnapshot {
            project_id: "p1".into(),
            dataset_id: "d1".into(),
            relative_path: "src/lib.rs".into(),
            file_hash: "aaa".into(),
            chunk_ids: vec!["c1".into(), "c2".into()],
            indexed_at: Utc::now(),
        };
        store.upsert_file_snapshot(&snap).unwrap();

        let replaced = FileSnapshot { file_hash: "bbb".into(), chunk_ids: vec!["c3".into()], ..snap };
        store.upsert_file_snapshot(&replaced).unwrap();

        let got = store.list_file_snapshots("d1").unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].file_hash, "bbb");
        assert_eq!(got[0].chunk_ids, vec!["c3".to_string()]);
    }

    #[test]
    fn shares_record_read_grants_idempotently() {
        let store = MetaStore::open_in_memory().unwrap();
        store.get_or_create_project("p1", "p1", None).unwrap();
        let ds = store.get_or_create_dataset("p1", "handbook", DatasetScope::Global).unwrap();
        store.record_share(&ds.id, "p2").unwrap();
        store.record_share(&ds.id, "p2").unwrap();

        let conn = store.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM shares", [], |row| row.get(0)).unwrap();
        assert_eq!(count, 1);
        let access: String = conn
            .query_row("SELECT access FROM shares", [], |row| row.get(0))
            .unwrap();
        assert_eq!(access, "read");
    }

    #[test]
    fn provenance_versioning() {
        let store = MetaStore::open_in_memory().unwrap();
        assert!(store
            .upsert_web_provenance("https://e.com/a", "e.com", "h1", None)
            .unwrap());
        // unchanged content: no re-chunking needed
        assert!(!store
            .upsert_web_provenance("https://e.com/a", "e.com", "h1", None)
            .unwrap());
        // changed content bumps the version
        assert!(store
            .upsert_web_provenance("https://e.com/a", "e.com", "h2", None)
            .unwrap());
        let got = store.get_web_provenance("https://e.com/a").unwrap().unwrap();
        assert_eq!(got.version, 2);
    }

    #[test]
    fn clear_project_reports_and_deletes() {
        let store = MetaStore::open_in_memory().unwrap();
        store.get_or_create_project("p1", "p1", None).unwrap();
        let ds = store.get_or_create_dataset("p1", "local", DatasetScope::Local).unwrap();
        store.bind_collection(&ds.id, "c1", "text", 384, false).unwrap();

        let chunk = Chunk {
            id: "x1".into(),
            project_id: "p1".into(),
            dataset_id: ds.id.clone(),
            collection_name: "c1".into(),
            content: "hello".into(),
            start_line: 1,
            end_line: 1,
            lang: None,
            relative_path: "a.md".into(),
            repo: None,
            file_hash: "fh".into(),
            sparse_vector: None,
            symbol: None,
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        };
        store.upsert_chunks(std::slice::from_ref(&chunk)).unwrap();

        let dry = store.clear_project("p1", None, true).unwrap();
        assert_eq!(dry.chunks, 1);
        assert_eq!(store.project_stats("p1").unwrap().chunks, 1, "dry run must not delete");

        let wet = store.clear_project("p1", None, false).unwrap();
        assert_eq!(wet.collections, vec!["c1".to_string()]);
        assert_eq!(store.project_stats("p1").unwrap().chunks, 0);
    }
}
