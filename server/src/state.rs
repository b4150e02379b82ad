//! The process-wide context value.
//!
//! Everything stateful hangs off one [`AppContext`] built at startup and
//! passed explicitly — no globals. Teardown drops it, which closes the
//! sqlite handle and lets in-flight HTTP drain.

use std::sync::Arc;

use crate::bus::EventBus;
use crate::config::Config;
use crate::crawl::PageFetcher;
use crate::embed::{EmbedderRouter, Reranker};
use crate::error::Result;
use crate::jobs::JobQueue;
use crate::meta::MetaStore;
use crate::vector::VectorStore;

pub struct AppContext {
    pub config: Config,
    pub meta: MetaStore,
    pub vectors: Arc<dyn VectorStore>,
    pub router: Arc<EmbedderRouter>,
    pub reranker: Option<Arc<dyn Reranker>>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub bus: EventBus,
    pub jobs: JobQueue,
}

impl AppContext {
    pub fn new(
        config: Config,
        meta: MetaStore,
        vectors: Arc<dyn VectorStore>,
        router: Arc<EmbedderRouter>,
        reranker: Option<Arc<dyn Reranker>>,
        fetcher: Arc<dyn PageFetcher>,
    ) -> Arc<Self> {
        let bus = EventBus::new();
        let jobs = JobQueue::new(meta.clone(), bus.clone());
        Arc::new(AppContext { config, meta, vectors, router, reranker, fetcher, bus, jobs })
    }

    /// Startup recovery: jobs left `running` by a dead process fail as
    /// orphaned before the dispatchers start.
    pub fn recover(&self) -> Result<()> {
        let orphaned = self.meta.mark_orphaned_jobs()?;
        if orphaned > 0 {
            tracing::warn!(orphaned, "marked stale running jobs as failed");
        }
        Ok(())
    }
}
