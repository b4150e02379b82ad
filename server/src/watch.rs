//! File watcher for locally ingested trees.
//!
//! Watches the source roots of previously ingested local datasets and, after
//! a debounce window of quiet, enqueues an incremental re-index job for the
//! affected dataset. The snapshot diff makes the re-index cheap — only the
//! files that actually changed get re-chunked. Roots are re-derived from the
//! job history periodically so newly ingested paths get picked up without a
//! restart.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use atoll_core::hash::sha256_hex;
use atoll_core::types::{JobKind, JobState};

use crate::ingest::{LocalIngestPayload, SKIP_DIRS};
use crate::state::AppContext;

/// Wait this long after the last event before enqueueing.
const DEBOUNCE: Duration = Duration::from_millis(750);
/// How often the watch-root set is refreshed from job history.
const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// One watched source root and the scope its changes re-index into.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WatchRoot {
    path: PathBuf,
    project_id: String,
    dataset_id: String,
}

/// Derive watch roots from succeeded local-ingest jobs.
fn current_roots(ctx: &Arc<AppContext>) -> Vec<WatchRoot> {
    let jobs = match ctx.meta.list_jobs(None, Some(JobState::Succeeded), 500) {
        Ok(jobs) => jobs,
        Err(e) => {
            warn!(error = %e, "could not list jobs for watch roots");
            return Vec::new();
        }
    };

    let mut seen = HashSet::new();
    let mut roots = Vec::new();
    for job in jobs {
        if job.kind != JobKind::IngestLocal {
            continue;
        }
        let Ok(payload) = serde_json::from_value::<LocalIngestPayload>(job.payload.clone())
        else {
            continue;
        };
        let path = PathBuf::from(&payload.path);
        if !path.is_dir() {
            continue;
        }
        let root = WatchRoot {
            path,
            project_id: job.project_id.clone(),
            dataset_id: job.dataset_id.clone(),
        };
        if seen.insert(root.clone()) {
            roots.push(root);
        }
    }
    roots
}

/// Start watching. The watcher handle lives on the refresh thread, which
/// also registers roots ingested after startup.
pub fn start_watcher(ctx: Arc<AppContext>) {
    let (tx, rx) = mpsc::channel::<Event>();

    let mut watcher = match RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        },
        notify::Config::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            warn!(error = %e, "could not create file watcher");
            return;
        }
    };

    let mut watched: Vec<WatchRoot> = current_roots(&ctx);
    for root in &watched {
        match watcher.watch(&root.path, RecursiveMode::Recursive) {
            Ok(()) => info!(path = %root.path.display(), "watching"),
            Err(e) => warn!(path = %root.path.display(), error = %e, "could not watch"),
        }
    }

    let ctx_bg = Arc::clone(&ctx);
    std::thread::spawn(move || debounce_loop(rx, ctx_bg));

    std::thread::spawn(move || loop {
        std::thread::sleep(REFRESH_INTERVAL);
        let fresh = current_roots(&ctx);
        for root in fresh {
            if !watched.contains(&root) {
                if let Err(e) = watcher.watch(&root.path, RecursiveMode::Recursive) {
                    warn!(path = %root.path.display(), error = %e, "could not watch new root");
                } else {
                    info!(path = %root.path.display(), "watching new root");
                }
                watched.push(root);
            }
        }
    });
}

/// Collect events and enqueue re-index jobs after a quiet period.
fn debounce_loop(rx: mpsc::Receiver<Event>, ctx: Arc<AppContext>) {
    let mut pending: HashMap<PathBuf, Instant> = HashMap::new();

    loop {
        match rx.recv_timeout(DEBOUNCE) {
            Ok(event) => {
                let relevant = matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                );
                if relevant {
                    let now = Instant::now();
                    for path in event.paths {
                        let parts: Vec<String> = path
                            .components()
                            .map(|c| c.as_os_str().to_string_lossy().into_owned())
                            .collect();
                        if parts.iter().any(|p| SKIP_DIRS.contains(&p.as_str())) {
                            continue;
                        }
                        pending.insert(path, now);
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if pending.is_empty() {
                    continue;
                }
                let cutoff = Instant::now() - DEBOUNCE;
                let ready: Vec<PathBuf> = pending
                    .iter()
                    .filter(|(_, t)| **t <= cutoff)
                    .map(|(p, _)| p.clone())
                    .collect();
                if ready.is_empty() {
                    continue;
                }
                for path in &ready {
                    pending.remove(path);
                }
                enqueue_for_changes(&ctx, &ready);
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// Map changed paths back to their watch roots and enqueue one incremental
/// re-index per affected dataset. The dedup key keeps bursts to one job.
fn enqueue_for_changes(ctx: &Arc<AppContext>, paths: &[PathBuf]) {
    let roots = current_roots(ctx);
    let mut touched: HashSet<&WatchRoot> = HashSet::new();
    for path in paths {
        for root in &roots {
            if path.starts_with(&root.path) {
                touched.insert(root);
                break;
            }
        }
    }

    for root in touched {
        let path_str = root.path.to_string_lossy().to_string();
        let payload = LocalIngestPayload { path: path_str.clone(), force: false };
        let fingerprint = &sha256_hex(path_str.as_bytes())[..16];
        let dedup_key =
            format!("ingest_local:{}:{}:{fingerprint}", root.project_id, root.dataset_id);
        match ctx.jobs.enqueue(
            JobKind::IngestLocal,
            &root.project_id,
            &root.dataset_id,
            &dedup_key,
            match serde_json::to_value(&payload) {
                Ok(v) => v,
                Err(_) => continue,
            },
        ) {
            Ok((job, true)) => {
                debug!(job = %job.id, path = %path_str, "change detected, re-index enqueued");
            }
            Ok((_, false)) => {} // one already pending
            Err(e) => warn!(path = %path_str, error = %e, "could not enqueue re-index"),
        }
    }
}
