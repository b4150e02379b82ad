//! Job queue and progress mapping.
//!
//! Jobs are durable rows in the metadata store; this module adds the
//! in-process machinery: dedup-checked enqueue, one dispatcher task per job
//! kind claiming work FIFO, heartbeats, cancellation tokens, and the
//! monotonic progress mapper that turns phase-local fractions into the
//! global 0–1 figure.

use chrono::Utc;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use atoll_core::types::{Job, JobKind, JobState, JobSummary, Progress};

use crate::bus::{EventBus, EventKind, ProgressCoalescer};
use crate::error::{Error, Result};
use crate::meta::MetaStore;
use crate::state::AppContext;

/// Dispatcher poll interval when the queue is empty.
const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Heartbeat period for running jobs.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Progress mapper
// ---------------------------------------------------------------------------

/// Global range of each ingestion phase. A crawl job spends the combined
/// chunking+embedding span inside its crawl loop instead.
pub fn phase_range(phase: &str) -> (f64, f64) {
    match phase {
        "initializing" => (0.0, 0.05),
        "discovery" => (0.05, 0.15),
        "chunking" => (0.15, 0.70),
        "crawling" => (0.15, 0.92),
        "embedding" => (0.70, 0.92),
        "storing" => (0.92, 0.98),
        "completed" => (0.98, 1.0),
        _ => (0.0, 1.0),
    }
}

/// Maps `(phase, local_fraction)` to a global fraction that never moves
/// backwards; regressions are silently clamped to the high-water mark.
#[derive(Debug, Default)]
pub struct ProgressMapper {
    high_water: f64,
}

impl ProgressMapper {
    pub fn map(&mut self, phase: &str, local_fraction: f64) -> f64 {
        let (lo, hi) = phase_range(phase);
        let global = lo + (hi - lo) * local_fraction.clamp(0.0, 1.0);
        if global > self.high_water {
            self.high_water = global;
        }
        self.high_water
    }
}

/// Handed to job handlers: persists mapped progress and publishes coalesced
/// `job.progress` events.
pub struct ProgressReporter {
    job_id: String,
    project_id: String,
    meta: MetaStore,
    bus: EventBus,
    mapper: ProgressMapper,
    coalescer: ProgressCoalescer,
}

impl ProgressReporter {
    pub fn new(job: &Job, meta: MetaStore, bus: EventBus) -> Self {
        ProgressReporter {
            job_id: job.id.clone(),
            project_id: job.project_id.clone(),
            meta,
            bus,
            mapper: ProgressMapper::default(),
            coalescer: ProgressCoalescer::default(),
        }
    }

    pub fn report(&mut self, phase: &str, local_fraction: f64, detail: Option<&str>) {
        let global = self.mapper.map(phase, local_fraction);
        if let Err(e) = self.meta.update_job_progress(&self.job_id, phase, global, detail) {
            warn!(job = %self.job_id, error = %e, "could not persist progress");
        }
        if self.coalescer.should_emit(phase, global) {
            self.bus.publish(
                Some(&self.project_id),
                EventKind::JobProgress {
                    job_id: self.job_id.clone(),
                    phase: phase.to_string(),
                    fraction: global,
                    detail: detail.map(str::to_string),
                },
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Queue handle
// ---------------------------------------------------------------------------

/// Cheap-to-clone facade over the durable queue plus the in-process
/// cancellation registry.
#[derive(Clone)]
pub struct JobQueue {
    meta: MetaStore,
    bus: EventBus,
    cancellations: Arc<DashMap<String, CancellationToken>>,
}

impl JobQueue {
    pub fn new(meta: MetaStore, bus: EventBus) -> Self {
        JobQueue { meta, bus, cancellations: Arc::new(DashMap::new()) }
    }

    /// Enqueue a job. On a dedup hit the existing job is returned and
    /// `created` is false — at most one non-terminal job per key.
    pub fn enqueue(
        &self,
        kind: JobKind,
        project_id: &str,
        dataset_id: &str,
        dedup_key: &str,
        payload: serde_json::Value,
    ) -> Result<(Job, bool)> {
        let job = Job {
            id: ulid::Ulid::new().to_string().to_lowercase(),
            kind,
            project_id: project_id.to_string(),
            dataset_id: dataset_id.to_string(),
            state: JobState::Queued,
            dedup_key: dedup_key.to_string(),
            payload,
            progress: Progress::default(),
            started_at: None,
            finished_at: None,
            error: None,
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        };
        let (job, created) = self.meta.enqueue_job(&job)?;
        if created {
            self.bus.publish(
                Some(&job.project_id),
                EventKind::JobState { job_id: job.id.clone(), state: JobState::Queued, error: None },
            );
        } else {
            info!(job = %job.id, dedup_key, "dedup hit, returning existing job");
        }
        Ok((job, created))
    }

    /// Cancel a job: queued jobs finish immediately, running jobs get their
    /// token cancelled and settle at the next checkpoint.
    pub fn cancel(&self, job_id: &str) -> Result<Job> {
        let job = self.meta.get_job(job_id)?;
        match job.state {
            JobState::Queued => {
                self.finish(&job, JobState::Cancelled, None, None)?;
                self.meta.get_job(job_id)
            }
            JobState::Running => {
                if let Some(token) = self.cancellations.get(job_id) {
                    token.cancel();
                }
                Ok(job)
            }
            _ => Ok(job),
        }
    }

    pub fn get(&self, job_id: &str) -> Result<Job> {
        self.meta.get_job(job_id)
    }

    pub fn list(
        &self,
        project_id: Option<&str>,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<Job>> {
        self.meta.list_jobs(project_id, state, limit)
    }

    fn register_cancellation(&self, job_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.cancellations.insert(job_id.to_string(), token.clone());
        token
    }

    fn finish(
        &self,
        job: &Job,
        state: JobState,
        error: Option<&str>,
        summary: Option<&JobSummary>,
    ) -> Result<()> {
        let summary_json = summary.map(|s| serde_json::to_value(s)).transpose()?;
        self.meta.finish_job(&job.id, state, error, summary_json.as_ref())?;
        self.cancellations.remove(&job.id);
        self.bus.publish(
            Some(&job.project_id),
            EventKind::JobState {
                job_id: job.id.clone(),
                state,
                error: error.map(str::to_string),
            },
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Dispatchers
// ---------------------------------------------------------------------------

/// Spawn one dispatcher task per job kind. Each claims FIFO, heartbeats
/// while the handler runs, and settles the job's terminal state exactly
/// once.
pub fn spawn_dispatchers(ctx: Arc<AppContext>) -> Vec<tokio::task::JoinHandle<()>> {
    [JobKind::IngestLocal, JobKind::IngestRemoteRepo, JobKind::Crawl, JobKind::Reindex]
        .into_iter()
        .map(|kind| {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { dispatch_loop(ctx, kind).await })
        })
        .collect()
}

async fn dispatch_loop(ctx: Arc<AppContext>, kind: JobKind) {
    loop {
        let claimed = match ctx.meta.claim_next_job(kind) {
            Ok(found) => found,
            Err(e) => {
                error!(kind = kind.as_str(), error = %e, "claim failed");
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }
        };

        let Some(job) = claimed else {
            tokio::time::sleep(POLL_INTERVAL).await;
            continue;
        };

        info!(job = %job.id, kind = kind.as_str(), project = %job.project_id, "job started");
        ctx.bus.publish(
            Some(&job.project_id),
            EventKind::JobState { job_id: job.id.clone(), state: JobState::Running, error: None },
        );

        let token = ctx.jobs.register_cancellation(&job.id);
        let heartbeat = spawn_heartbeat(ctx.meta.clone(), job.id.clone());

        let mut reporter = ProgressReporter::new(&job, ctx.meta.clone(), ctx.bus.clone());
        let outcome = run_handler(&ctx, &job, &mut reporter, &token).await;
        heartbeat.abort();

        let result = match outcome {
            Ok(summary) => {
                reporter.report("completed", 1.0, None);
                info!(job = %job.id, files = summary.files, chunks = summary.chunks, "job succeeded");
                if let Ok(stats) = ctx.meta.project_stats(&job.project_id) {
                    ctx.bus.publish(
                        Some(&job.project_id),
                        EventKind::StoreStats {
                            collections: stats.collections,
                            chunks: stats.chunks,
                        },
                    );
                }
                ctx.jobs.finish(&job, JobState::Succeeded, None, Some(&summary))
            }
            Err(Error::Cancelled) => {
                info!(job = %job.id, "job cancelled");
                ctx.jobs.finish(&job, JobState::Cancelled, None, None)
            }
            Err(e) => {
                error!(job = %job.id, code = e.code(), error = %e, "job failed");
                ctx.bus.publish(
                    Some(&job.project_id),
                    EventKind::Error { code: e.code().to_string(), message: e.to_string() },
                );
                ctx.jobs.finish(&job, JobState::Failed, Some(&e.to_string()), None)
            }
        };
        if let Err(e) = result {
            error!(job = %job.id, error = %e, "could not settle job state");
        }
    }
}

async fn run_handler(
    ctx: &Arc<AppContext>,
    job: &Job,
    reporter: &mut ProgressReporter,
    cancel: &CancellationToken,
) -> Result<JobSummary> {
    match job.kind {
        JobKind::IngestLocal => crate::ingest::run_local_job(ctx, job, reporter, cancel).await,
        JobKind::Reindex => crate::ingest::run_reindex_job(ctx, job, reporter, cancel).await,
        JobKind::IngestRemoteRepo => {
            crate::ingest::run_remote_repo_job(ctx, job, reporter, cancel).await
        }
        JobKind::Crawl => crate::crawl::run_crawl_job(ctx, job, reporter, cancel).await,
    }
}

fn spawn_heartbeat(meta: MetaStore, job_id: String) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = meta.heartbeat_job(&job_id) {
                warn!(job = %job_id, error = %e, "heartbeat failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapper_is_monotone_across_phase_updates() {
        let mut mapper = ProgressMapper::default();
        let a = mapper.map("initializing", 1.0);
        let b = mapper.map("discovery", 0.5);
        let c = mapper.map("discovery", 0.2); // regression: clamped
        let d = mapper.map("chunking", 0.0);
        assert!((a - 0.05).abs() < 1e-9);
        assert!((b - 0.10).abs() < 1e-9);
        assert!(c >= b, "fraction never decreases");
        assert!(d >= c);
        let done = mapper.map("completed", 1.0);
        assert!((done - 1.0).abs() < 1e-9);
    }

    #[test]
    fn mapper_clamps_out_of_range_locals() {
        let mut mapper = ProgressMapper::default();
        let v = mapper.map("discovery", 7.5);
        assert!((v - 0.15).abs() < 1e-9);
        let w = mapper.map("discovery", -3.0);
        assert!((w - 0.15).abs() < 1e-9, "negative local clamps and monotone holds");
    }

    #[test]
    fn queue_enqueue_dedups_and_cancels_queued() {
        let meta = MetaStore::open_in_memory().unwrap();
        let queue = JobQueue::new(meta, EventBus::new());

        let (a, created) = queue
            .enqueue(JobKind::IngestLocal, "p1", "d1", "k1", serde_json::json!({}))
            .unwrap();
        assert!(created);
        let (b, created) = queue
            .enqueue(JobKind::IngestLocal, "p1", "d1", "k1", serde_json::json!({}))
            .unwrap();
        assert!(!created);
        assert_eq!(a.id, b.id);

        let cancelled = queue.cancel(&a.id).unwrap();
        assert_eq!(cancelled.state, JobState::Cancelled);

        // Terminal key freed: enqueue works again.
        let (_, created) = queue
            .enqueue(JobKind::IngestLocal, "p1", "d1", "k1", serde_json::json!({}))
            .unwrap();
        assert!(created);
    }
}
