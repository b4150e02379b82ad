//! Crawl engine — breadth-first, depth-limited, memory-adaptive.
//!
//! The page fetcher is an external headless-browser service; this module
//! owns everything around it: the level-queue BFS with batched dispatch,
//! the RSS-based throttle, URL normalization and same-domain/regex
//! filtering, the SSRF address policy, sitemap/llms.txt auto-discovery, and
//! provenance-based dedup against prior runs. Fetched pages run through the
//! prose chunker and the text encoder family.

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use quick_xml::events::Event as XmlEvent;
use quick_xml::Reader as XmlReader;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::System;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use atoll_core::hash::{chunk_id, sha256_hex};
use atoll_core::types::{
    Chunk, CrawlMode, CrawlSession, CrawlStats, Dataset, Job, JobState, JobSummary,
};

use crate::bus::EventKind;
use crate::chunk::{chunk_prose, html_to_text};
use crate::embed::{EmbedRequest, EncoderFamily};
use crate::error::{Error, FailureTally, Result};
use crate::jobs::ProgressReporter;
use crate::state::AppContext;
use crate::vector::{Payload, Point};

/// Page fetches get one shot with a hard deadline — crawls are wide, not deep.
pub const PAGE_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
/// Responses over this size are rejected by policy.
pub const MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;
/// RSS re-sampling interval for the dispatch throttle.
const MEMORY_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Canonical discovery files, in priority order.
const DISCOVERY_FILES: &[&str] = &[
    "llms.txt",
    "llms-full.txt",
    ".well-known/ai.txt",
    ".well-known/llms.txt",
    "sitemap.xml",
    "sitemap_index.xml",
    "robots.txt",
    ".well-known/sitemap.xml",
];

/// Common subdirectories probed in addition to the root.
const DISCOVERY_SUBDIRS: &[&str] = &[
    "docs", "api", "static", "public", "assets", "blog", "help", "guides", "developers",
    "reference", "manual", "en",
];

// ---------------------------------------------------------------------------
// Job payload
// ---------------------------------------------------------------------------

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlPayload {
    pub seed_url: String,
    pub mode: CrawlMode,
    pub max_pages: usize,
    pub max_depth: usize,
    #[serde(default = "default_true")]
    pub same_domain: bool,
    #[serde(default)]
    pub allow: Option<String>,
    #[serde(default)]
    pub deny: Option<String>,
    #[serde(default)]
    pub force: bool,
}

// ---------------------------------------------------------------------------
// Page fetcher port
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub status_code: u16,
    /// Extracted text content.
    #[serde(default)]
    pub content: String,
    /// Rendered DOM, when the service returns it.
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub content_hash: Option<String>,
    /// Outbound links from the rendered DOM.
    #[serde(default)]
    pub links: Vec<String>,
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage>;
}

/// Client for the external crawler service: posts the URL, then either gets
/// the page records inline or polls the returned progress handle.
pub struct HttpPageFetcher {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct CrawlDispatchResponse {
    #[serde(default)]
    pages: Vec<FetchedPage>,
    #[serde(default)]
    id: Option<String>,
}

#[derive(Deserialize)]
struct CrawlProgressResponse {
    status: String,
    #[serde(default)]
    pages: Vec<FetchedPage>,
}

impl HttpPageFetcher {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(PAGE_FETCH_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(HttpPageFetcher { client, base_url: base_url.trim_end_matches('/').to_string() })
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        let body = serde_json::json!({
            "urls": [url],
            "options": { "timeout_ms": PAGE_FETCH_TIMEOUT.as_millis() as u64 },
        });
        let resp = self
            .client
            .post(format!("{}/crawl", self.base_url))
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::SourceUnreadable(format!(
                "fetcher returned {} for {url}",
                resp.status()
            )));
        }
        let dispatch: CrawlDispatchResponse = resp.json().await?;
        if let Some(page) = dispatch.pages.into_iter().next() {
            return Ok(page);
        }

        let Some(id) = dispatch.id else {
            return Err(Error::SourceUnreadable(format!("fetcher returned nothing for {url}")));
        };
        let deadline = Instant::now() + PAGE_FETCH_TIMEOUT;
        loop {
            if Instant::now() > deadline {
                return Err(Error::SourceUnreadable(format!("fetch of {url} timed out")));
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
            let progress: CrawlProgressResponse = self
                .client
                .get(format!("{}/progress/{id}", self.base_url))
                .send()
                .await?
                .json()
                .await?;
            match progress.status.as_str() {
                "done" | "complete" | "succeeded" => {
                    return progress.pages.into_iter().next().ok_or_else(|| {
                        Error::SourceUnreadable(format!("fetcher finished without a page for {url}"))
                    });
                }
                "failed" | "error" => {
                    return Err(Error::SourceUnreadable(format!("fetcher failed for {url}")));
                }
                _ => continue,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SSRF address policy
// ---------------------------------------------------------------------------

/// Private, loopback, link-local, multicast, and reserved ranges — plus the
/// cloud metadata address — are never crawled.
pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || octets[0] >= 240 // reserved
                || octets == [169, 254, 169, 254] // metadata, covered by link-local but explicit
                || (octets[0] == 100 && (64..128).contains(&octets[1])) // CGNAT
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_multicast()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xfe00) == 0xfc00 // unique local
                || (v6.segments()[0] & 0xffc0) == 0xfe80 // link local
        }
    }
}

/// Validate scheme and resolved addresses before a URL is fetched. Redirect
/// targets go through the same check (the fetch client does not follow
/// redirects on its own).
pub async fn check_url_policy(url: &Url) -> Result<()> {
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::SsrfBlocked(format!("scheme {} not allowed", url.scheme())));
    }
    let host = url
        .host_str()
        .ok_or_else(|| Error::SsrfBlocked(format!("{url} has no host")))?;

    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_blocked_ip(ip) {
            return Err(Error::SsrfBlocked(format!("{host} is a blocked address")));
        }
        return Ok(());
    }

    let port = url.port_or_known_default().unwrap_or(443);
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| Error::SsrfBlocked(format!("{host} did not resolve: {e}")))?;
    for addr in addrs {
        if is_blocked_ip(addr.ip()) {
            return Err(Error::SsrfBlocked(format!("{host} resolves to {}", addr.ip())));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// URL normalization and link policy
// ---------------------------------------------------------------------------

/// Resolve `href` against `base`, strip the fragment, and keep only
/// http(s). The url crate lowercases hosts during parsing.
pub fn normalize_link(base: &Url, href: &str) -> Option<Url> {
    let mut resolved = base.join(href.trim()).ok()?;
    resolved.set_fragment(None);
    if !matches!(resolved.scheme(), "http" | "https") {
        return None;
    }
    Some(resolved)
}

/// Same-domain and allow/deny filtering, applied uniformly to page links
/// and discovery results.
pub struct LinkPolicy {
    seed_host: String,
    same_domain: bool,
    allow: Option<Regex>,
    deny: Option<Regex>,
}

impl LinkPolicy {
    pub fn new(seed: &Url, payload: &CrawlPayload) -> Result<Self> {
        let allow = payload
            .allow
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| Error::InvalidInput(format!("bad allow pattern: {e}")))?;
        let deny = payload
            .deny
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| Error::InvalidInput(format!("bad deny pattern: {e}")))?;
        Ok(LinkPolicy {
            seed_host: seed.host_str().unwrap_or_default().to_string(),
            same_domain: payload.same_domain,
            allow,
            deny,
        })
    }

    pub fn allows(&self, url: &Url) -> bool {
        if self.same_domain && url.host_str() != Some(self.seed_host.as_str()) {
            return false;
        }
        let text = url.as_str();
        if let Some(deny) = &self.deny {
            if deny.is_match(text) {
                return false;
            }
        }
        if let Some(allow) = &self.allow {
            return allow.is_match(text);
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Memory-adaptive dispatch
// ---------------------------------------------------------------------------

/// Samples this process's RSS against total system memory, at most once per
/// [`MEMORY_CHECK_INTERVAL`]. While over threshold, the dispatcher halves
/// its in-flight budget.
pub struct MemoryGovernor {
    threshold_percent: f64,
    state: std::sync::Mutex<(Instant, bool)>,
}

impl MemoryGovernor {
    pub fn new(threshold_percent: f64) -> Self {
        MemoryGovernor {
            threshold_percent,
            state: std::sync::Mutex::new((Instant::now() - MEMORY_CHECK_INTERVAL, false)),
        }
    }

    fn sample() -> Option<f64> {
        let pid = sysinfo::get_current_pid().ok()?;
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
        let process = sys.process(pid)?;
        let total = sys.total_memory();
        if total == 0 {
            return None;
        }
        Some(process.memory() as f64 * 100.0 / total as f64)
    }

    pub fn over_threshold(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.0.elapsed() >= MEMORY_CHECK_INTERVAL {
            let over = Self::sample()
                .map(|percent| percent > self.threshold_percent)
                .unwrap_or(false);
            if over && !state.1 {
                warn!(threshold = self.threshold_percent, "memory threshold exceeded, throttling crawl");
            }
            *state = (Instant::now(), over);
        }
        state.1
    }
}

// ---------------------------------------------------------------------------
// Auto-discovery
// ---------------------------------------------------------------------------

/// Pull `<loc>` entries out of a sitemap or sitemap index.
/// Returns `(urls, is_index)`.
fn parse_sitemap(xml: &str) -> (Vec<String>, bool) {
    let mut reader = XmlReader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut urls = Vec::new();
    let mut is_index = false;
    let mut in_loc = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(XmlEvent::Start(e)) => {
                let name = e.name();
                let local = name.local_name();
                if local.as_ref() == b"sitemapindex" {
                    is_index = true;
                } else if local.as_ref() == b"loc" {
                    in_loc = true;
                }
            }
            Ok(XmlEvent::Text(t)) if in_loc => {
                let text = String::from_utf8_lossy(&t);
                if !text.trim().is_empty() {
                    urls.push(text.trim().to_string());
                }
            }
            Ok(XmlEvent::End(e)) if e.name().local_name().as_ref() == b"loc" => {
                in_loc = false;
            }
            Ok(XmlEvent::Eof) | Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    (urls, is_index)
}

/// `Sitemap:` directives from robots.txt.
fn sitemaps_from_robots(robots: &str) -> Vec<String> {
    robots
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            if key.trim().eq_ignore_ascii_case("sitemap") {
                Some(value.trim().to_string())
            } else {
                None
            }
        })
        .collect()
}

/// URLs from llms.txt-style documents: markdown links plus bare URLs.
fn links_from_text(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for token in text.split([' ', '\n', '\t', '(', ')', '<', '>', '[', ']']) {
        let token = token.trim_end_matches([',', ';', '"', '\'']);
        if token.starts_with("http://") || token.starts_with("https://") {
            out.push(token.to_string());
        }
    }
    out
}

/// `<link rel="sitemap">` / `<meta name="sitemap">` hints on a page.
fn sitemap_hints_from_html(html: &str) -> Vec<String> {
    let link_re = Regex::new(r#"(?i)<link[^>]*rel\s*=\s*["']sitemap["'][^>]*href\s*=\s*["']([^"']+)["']"#);
    let meta_re = Regex::new(r#"(?i)<meta[^>]*name\s*=\s*["']sitemap["'][^>]*content\s*=\s*["']([^"']+)["']"#);
    let mut out = Vec::new();
    for re in [link_re, meta_re].into_iter().flatten() {
        for cap in re.captures_iter(html) {
            out.push(cap[1].to_string());
        }
    }
    out
}

/// Fetch a small text resource through the address policy, or `None` on any
/// failure — discovery is strictly best-effort.
async fn probe(client: &reqwest::Client, url: &Url) -> Option<String> {
    check_url_policy(url).await.ok()?;
    let resp = client.get(url.clone()).send().await.ok()?;
    if !resp.status().is_success() {
        return None;
    }
    if resp.content_length().unwrap_or(0) as usize > MAX_RESPONSE_BYTES {
        return None;
    }
    let text = resp.text().await.ok()?;
    if text.len() > MAX_RESPONSE_BYTES {
        return None;
    }
    Some(text)
}

/// Probe the canonical discovery locations and the seed page's sitemap
/// hints. Every hit contributes URLs (policy-filtered) that seed the crawl
/// queue alongside the seed itself.
async fn auto_discover(
    client: &reqwest::Client,
    seed: &Url,
    policy: &LinkPolicy,
    cap: usize,
    reporter: &mut ProgressReporter,
) -> Vec<Url> {
    let mut candidates: Vec<Url> = Vec::new();
    let root = match seed.join("/") {
        Ok(r) => r,
        Err(_) => return candidates,
    };

    let mut locations: Vec<Url> = Vec::new();
    for file in DISCOVERY_FILES {
        if let Ok(u) = root.join(file) {
            locations.push(u);
        }
    }
    for subdir in DISCOVERY_SUBDIRS {
        for file in DISCOVERY_FILES {
            if let Ok(u) = root.join(&format!("{subdir}/{file}")) {
                locations.push(u);
            }
        }
    }

    let total = locations.len();
    let mut sitemap_queue: Vec<Url> = Vec::new();

    for (i, location) in locations.into_iter().enumerate() {
        reporter.report("discovery", i as f64 / total as f64, Some(location.path()));
        if candidates.len() >= cap {
            break;
        }
        let Some(body) = probe(client, &location).await else {
            continue;
        };
        debug!(url = %location, "discovery hit");

        let path = location.path().to_lowercase();
        if path.ends_with(".xml") {
            let (urls, is_index) = parse_sitemap(&body);
            for raw in urls {
                if let Some(u) = normalize_link(&root, &raw) {
                    if is_index {
                        sitemap_queue.push(u);
                    } else if policy.allows(&u) {
                        candidates.push(u);
                    }
                }
            }
        } else if path.ends_with("robots.txt") {
            for raw in sitemaps_from_robots(&body) {
                if let Some(u) = normalize_link(&root, &raw) {
                    sitemap_queue.push(u);
                }
            }
        } else {
            for raw in links_from_text(&body) {
                if let Some(u) = normalize_link(&root, &raw) {
                    if policy.allows(&u) {
                        candidates.push(u);
                    }
                }
            }
        }
    }

    // Seed page hints: <link rel="sitemap"> and <meta name="sitemap">.
    if let Some(html) = probe(client, seed).await {
        for raw in sitemap_hints_from_html(&html) {
            if let Some(u) = normalize_link(seed, &raw) {
                sitemap_queue.push(u);
            }
        }
    }

    // One level of nested sitemaps.
    for sitemap in sitemap_queue {
        if candidates.len() >= cap {
            break;
        }
        // The same-domain decision applies to sitemap references too.
        if !policy.allows(&sitemap) {
            continue;
        }
        if let Some(body) = probe(client, &sitemap).await {
            let (urls, _) = parse_sitemap(&body);
            for raw in urls {
                if let Some(u) = normalize_link(&root, &raw) {
                    if policy.allows(&u) {
                        candidates.push(u);
                    }
                }
            }
        }
    }

    candidates.truncate(cap);
    info!(found = candidates.len(), "auto-discovery complete");
    candidates
}

// ---------------------------------------------------------------------------
// Crawl job
// ---------------------------------------------------------------------------

pub async fn run_crawl_job(
    ctx: &Arc<AppContext>,
    job: &Job,
    reporter: &mut ProgressReporter,
    cancel: &CancellationToken,
) -> Result<JobSummary> {
    let payload: CrawlPayload = serde_json::from_value(job.payload.clone())
        .map_err(|e| Error::InvalidInput(format!("bad crawl payload: {e}")))?;

    reporter.report("initializing", 0.0, None);
    ctx.meta.get_or_create_project(&job.project_id, &job.project_id, None)?;
    let dataset = ctx.meta.get_dataset(&job.dataset_id)?;

    let seed = Url::parse(&payload.seed_url)
        .map_err(|e| Error::InvalidInput(format!("bad seed url: {e}")))?;
    check_url_policy(&seed).await?;

    let session = CrawlSession {
        id: ulid::Ulid::new().to_string().to_lowercase(),
        project_id: job.project_id.clone(),
        dataset_id: dataset.id.clone(),
        seed_url: payload.seed_url.clone(),
        mode: payload.mode,
        max_pages: payload.max_pages,
        max_depth: payload.max_depth,
        status: JobState::Running,
        stats: CrawlStats::default(),
        started_at: Utc::now(),
        finished_at: None,
    };
    ctx.meta.create_crawl_session(&session)?;
    reporter.report("initializing", 1.0, None);

    let mut stats = CrawlStats::default();
    let outcome =
        crawl_inner(ctx, job, &dataset, &payload, &seed, &session, &mut stats, reporter, cancel)
            .await;

    let (status, result) = match outcome {
        Ok(summary) => (JobState::Succeeded, Ok(summary)),
        Err(Error::Cancelled) => (JobState::Cancelled, Err(Error::Cancelled)),
        Err(e) => (JobState::Failed, Err(e)),
    };
    ctx.meta.finish_crawl_session(&session.id, status, &stats)?;
    result
}

#[allow(clippy::too_many_arguments)]
async fn crawl_inner(
    ctx: &Arc<AppContext>,
    job: &Job,
    dataset: &Dataset,
    payload: &CrawlPayload,
    seed: &Url,
    session: &CrawlSession,
    stats: &mut CrawlStats,
    reporter: &mut ProgressReporter,
    cancel: &CancellationToken,
) -> Result<JobSummary> {
    let policy = LinkPolicy::new(seed, payload)?;
    let discovery_client = reqwest::Client::builder().timeout(PAGE_FETCH_TIMEOUT).build()?;
    let governor = MemoryGovernor::new(ctx.config.memory_threshold_percent);
    let max_pages = payload.max_pages.max(1);
    let mut tally = FailureTally::default();

    // --- discovery: build the initial level --------------------------------
    reporter.report("discovery", 0.0, None);
    let mut level: Vec<Url> = vec![seed.clone()];
    match payload.mode {
        CrawlMode::Single => {}
        CrawlMode::Sitemap | CrawlMode::Recursive if ctx.config.crawl_auto_discovery => {
            let found =
                auto_discover(&discovery_client, seed, &policy, max_pages, reporter).await;
            level.extend(found);
        }
        CrawlMode::Sitemap | CrawlMode::Recursive => {}
    }
    reporter.report("discovery", 1.0, Some(&format!("{} seeds", level.len())));

    let mut visited: HashSet<String> = HashSet::new();
    level.retain(|u| visited.insert(u.to_string()));

    let mut total_chunks = 0usize;
    let mut depth = 0usize;
    let follow_links = payload.mode == CrawlMode::Recursive;

    // --- BFS over depth levels --------------------------------------------
    while !level.is_empty() && stats.pages_fetched < max_pages && depth <= payload.max_depth {
        let mut next: Vec<Url> = Vec::new();
        let mut level_attempted = 0usize;
        let mut level_failed = 0usize;

        for batch in level.chunks(ctx.config.crawl_batch_size.max(1)) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let remaining = max_pages.saturating_sub(stats.pages_fetched);
            if remaining == 0 {
                break;
            }
            let batch: Vec<Url> = batch.iter().take(remaining).cloned().collect();

            // Memory-adaptive dispatch: halve the budget while over threshold.
            let base = ctx.config.crawl_max_concurrent.max(1);
            let in_flight = if governor.over_threshold() { (base / 2).max(1) } else { base };

            let fetcher = Arc::clone(&ctx.fetcher);
            let results: Vec<(Url, Result<FetchedPage>)> = stream::iter(batch)
                .map(|url| {
                    let fetcher = Arc::clone(&fetcher);
                    async move {
                        let checked = check_url_policy(&url).await;
                        match checked {
                            Ok(()) => {
                                let page = fetcher.fetch(url.as_str()).await;
                                (url, page)
                            }
                            Err(e) => (url, Err(e)),
                        }
                    }
                })
                .buffer_unordered(in_flight)
                .collect()
                .await;

            for (url, result) in results {
                level_attempted += 1;
                let page = match result {
                    Ok(page) => page,
                    Err(e) => {
                        level_failed += 1;
                        stats.errors += 1;
                        tally.soft(
                            if matches!(e, Error::SsrfBlocked(_)) {
                                "ssrf.blocked"
                            } else {
                                "source.unreadable"
                            },
                            url.as_str(),
                            &e.to_string(),
                        );
                        continue;
                    }
                };

                stats.pages_fetched += 1;
                ctx.bus.publish(
                    Some(&job.project_id),
                    EventKind::CrawlPage {
                        session_id: session.id.clone(),
                        url: url.to_string(),
                        depth,
                        status: page.status_code,
                    },
                );

                // Links feed the next depth regardless of content dedup.
                if follow_links {
                    let mut links = page.links.clone();
                    if links.is_empty() {
                        if let Some(html) = &page.html {
                            links = links_from_html(html);
                        }
                    }
                    for href in links {
                        if let Some(normalized) = normalize_link(&url, &href) {
                            if policy.allows(&normalized)
                                && visited.insert(normalized.to_string())
                            {
                                next.push(normalized);
                            }
                        }
                    }
                }

                // Provenance dedup: unchanged content skips chunking.
                let text = match &page.html {
                    Some(html) => html_to_text(html),
                    None => page.content.clone(),
                };
                let content_hash = page
                    .content_hash
                    .clone()
                    .unwrap_or_else(|| sha256_hex(text.as_bytes()));
                let domain = url.host_str().unwrap_or_default().to_string();
                let changed =
                    ctx.meta.upsert_web_provenance(url.as_str(), &domain, &content_hash, None)?;
                if !changed && !payload.force {
                    stats.pages_skipped += 1;
                    continue;
                }

                match index_page(ctx, job, dataset, &url, &text, &content_hash, cancel).await {
                    Ok(chunks) => total_chunks += chunks,
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => {
                        stats.errors += 1;
                        tally.soft("source.unreadable", url.as_str(), &e.to_string());
                    }
                }
            }

            let depth_fraction = (depth + 1) as f64 / (payload.max_depth + 1) as f64;
            let page_fraction = stats.pages_fetched as f64 / max_pages as f64;
            reporter.report(
                "crawling",
                page_fraction.min(depth_fraction),
                Some(&format!("depth {depth}, {} pages", stats.pages_fetched)),
            );
        }

        if level_attempted > 0 && level_failed == level_attempted {
            return Err(Error::SourceUnreadable(format!(
                "every URL at depth {depth} failed"
            )));
        }

        stats.depth_reached = depth;
        level = next;
        depth += 1;
    }

    reporter.report("storing", 1.0, None);
    info!(
        job = %job.id,
        pages = stats.pages_fetched,
        skipped = stats.pages_skipped,
        chunks = total_chunks,
        "crawl complete"
    );
    Ok(JobSummary {
        files: 0,
        chunks: total_chunks,
        pages: stats.pages_fetched,
        removed: 0,
        soft_errors: tally.samples().to_vec(),
    })
}

/// Fallback link extraction when the fetcher didn't provide rendered links.
fn links_from_html(html: &str) -> Vec<String> {
    let re = match Regex::new(r#"(?i)href\s*=\s*["']([^"']+)["']"#) {
        Ok(re) => re,
        Err(_) => return Vec::new(),
    };
    re.captures_iter(html).map(|cap| cap[1].to_string()).collect()
}

/// Chunk, embed, and store one fetched page into the dataset's text-family
/// collection. The page URL stands in for the relative path.
async fn index_page(
    ctx: &Arc<AppContext>,
    job: &Job,
    dataset: &Dataset,
    url: &Url,
    text: &str,
    content_hash: &str,
    cancel: &CancellationToken,
) -> Result<usize> {
    let raw_chunks = chunk_prose(text);
    if raw_chunks.is_empty() {
        return Ok(0);
    }

    let binding = crate::ingest::page_collection(ctx, dataset).await?;
    let requests: Vec<EmbedRequest> = raw_chunks
        .iter()
        .map(|c| EmbedRequest { content: c.content.clone(), family: EncoderFamily::Text })
        .collect();
    let outcome = ctx.router.embed_all(&requests, cancel).await?;

    let now = Utc::now();
    let mut chunks = Vec::new();
    let mut points = Vec::new();
    for (i, raw) in raw_chunks.iter().enumerate() {
        let Some(dense) = outcome.dense[i].clone() else {
            continue;
        };
        let id = chunk_id(
            &binding.collection_name,
            url.as_str(),
            raw.start_line,
            raw.end_line,
            &raw.content,
        );
        chunks.push(Chunk {
            id: id.clone(),
            project_id: job.project_id.clone(),
            dataset_id: dataset.id.clone(),
            collection_name: binding.collection_name.clone(),
            content: raw.content.clone(),
            start_line: raw.start_line,
            end_line: raw.end_line,
            lang: None,
            relative_path: url.to_string(),
            repo: None,
            file_hash: content_hash.to_string(),
            sparse_vector: outcome.sparse[i].clone(),
            symbol: None,
            metadata: BTreeMap::new(),
            created_at: now,
        });
        points.push(Point {
            id,
            dense,
            sparse: outcome.sparse[i].clone(),
            payload: Payload {
                project_id: job.project_id.clone(),
                dataset_id: dataset.id.clone(),
                relative_path: url.to_string(),
                start_line: raw.start_line,
                end_line: raw.end_line,
                repo: None,
                lang: None,
                symbol: None,
                content: raw.content.clone(),
                file_hash: content_hash.to_string(),
            },
        });
    }

    let stored = points.len();
    ctx.vectors.upsert(&binding.collection_name, points).await?;
    ctx.meta.upsert_chunks(&chunks)?;
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(seed: &str) -> CrawlPayload {
        CrawlPayload {
            seed_url: seed.to_string(),
            mode: CrawlMode::Recursive,
            max_pages: 30,
            max_depth: 3,
            same_domain: true,
            allow: None,
            deny: None,
            force: false,
        }
    }

    #[test]
    fn blocked_addresses() {
        for ip in [
            "127.0.0.1",
            "10.1.2.3",
            "172.16.0.1",
            "192.168.1.1",
            "169.254.169.254",
            "224.0.0.1",
            "0.0.0.0",
            "255.255.255.255",
            "100.64.0.1",
            "::1",
            "fe80::1",
            "fc00::1",
        ] {
            assert!(is_blocked_ip(ip.parse().unwrap()), "{ip} must be blocked");
        }
        for ip in ["93.184.216.34", "8.8.8.8", "2606:2800:220:1:248:1893:25c8:1946"] {
            assert!(!is_blocked_ip(ip.parse().unwrap()), "{ip} must be allowed");
        }
    }

    #[tokio::test]
    async fn policy_rejects_schemes_and_literal_ips() {
        let file = Url::parse("file:///etc/passwd").unwrap();
        assert!(matches!(check_url_policy(&file).await, Err(Error::SsrfBlocked(_))));

        let metadata = Url::parse("http://169.254.169.254/latest/meta-data/").unwrap();
        assert!(matches!(check_url_policy(&metadata).await, Err(Error::SsrfBlocked(_))));
    }

    #[test]
    fn link_normalization() {
        let base = Url::parse("https://Docs.Example.com/guide/intro?x=1#frag").unwrap();
        let abs = normalize_link(&base, "/api/reference#anchor").unwrap();
        assert_eq!(abs.as_str(), "https://docs.example.com/api/reference");

        let rel = normalize_link(&base, "next-page").unwrap();
        assert_eq!(rel.as_str(), "https://docs.example.com/guide/next-page");

        assert!(normalize_link(&base, "javascript:void(0)").is_none());
        assert!(normalize_link(&base, "mailto:x@example.com").is_none());
    }

    #[test]
    fn policy_same_domain_and_patterns() {
        let seed = Url::parse("https://docs.example.com/").unwrap();
        let mut p = payload("https://docs.example.com/");
        p.deny = Some("/private/".to_string());
        let policy = LinkPolicy::new(&seed, &p).unwrap();

        assert!(policy.allows(&Url::parse("https://docs.example.com/guide").unwrap()));
        assert!(!policy.allows(&Url::parse("https://other.example.com/guide").unwrap()));
        assert!(!policy.allows(&Url::parse("https://docs.example.com/private/x").unwrap()));
    }

    #[test]
    fn sitemap_parsing_and_index_detection() {
        let sitemap = r#"<?xml version="1.0"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>https://example.com/a</loc></url>
  <url><loc>https://example.com/b</loc></url>
</urlset>"#;
        let (urls, is_index) = parse_sitemap(sitemap);
        assert_eq!(urls, vec!["https://example.com/a", "https://example.com/b"]);
        assert!(!is_index);

        let index = r#"<sitemapindex><sitemap><loc>https://example.com/sub.xml</loc></sitemap></sitemapindex>"#;
        let (urls, is_index) = parse_sitemap(index);
        assert_eq!(urls, vec!["https://example.com/sub.xml"]);
        assert!(is_index);
    }

    #[test]
    fn robots_sitemap_directives() {
        let robots = "User-agent: *\nDisallow: /admin\nSitemap: https://example.com/sitemap.xml\nsitemap: https://example.com/extra.xml\n";
        assert_eq!(
            sitemaps_from_robots(robots),
            vec!["https://example.com/sitemap.xml", "https://example.com/extra.xml"]
        );
    }

    #[test]
    fn llms_txt_link_extraction() {
        let text = "# Docs\n- [Guide](https://example.com/guide)\nPlain https://example.com/api too.";
        let links = links_from_text(text);
        assert!(links.contains(&"https://example.com/guide".to_string()));
        assert!(links.contains(&"https://example.com/api".to_string()));
    }

    #[test]
    fn html_sitemap_hints() {
        let html = r#"<head><link rel="sitemap" href="/sitemap.xml"><meta name="sitemap" content="https://e.com/sm.xml"></head>"#;
        let hints = sitemap_hints_from_html(html);
        assert_eq!(hints.len(), 2);
    }

    #[test]
    fn html_href_fallback() {
        let html = r#"<a href="/a">A</a> <a HREF='https://x.com/b'>B</a>"#;
        let links = links_from_html(html);
        assert_eq!(links, vec!["/a", "https://x.com/b"]);
    }
}
