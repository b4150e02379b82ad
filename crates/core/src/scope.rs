//! Auto-scoping — deterministic `(project_id, dataset)` naming from a
//! locator: a filesystem path, a git remote, or a crawl seed URL.
//!
//! The same locator always resolves to the same project id, so callers can
//! skip explicit project bookkeeping entirely. Collisions (same id, different
//! locator) are broken by salting the suffix hash until the id is unique;
//! uniqueness is checked through a caller-supplied lookup so this module
//! stays store-free.

use crate::hash::{base58_encode, sha256, sha256_hex};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Dataset name used for local working copies when no override is given.
pub const DEFAULT_LOCAL_DATASET: &str = "local";

/// Hash characters taken from each Base58 digest for the id affixes.
const AFFIX_LEN: usize = 8;

/// Upper bound on collision-salt retries before giving up.
const MAX_COLLISION_SALTS: u32 = 32;

#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("path does not exist: {0}")]
    PathNotFound(String),
    #[error("locator cannot be scoped: {0}")]
    InvalidLocator(String),
    #[error("could not resolve a unique project id for {0} after {MAX_COLLISION_SALTS} salts")]
    CollisionUnresolved(String),
}

/// How the scope was determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeSource {
    Detected,
    Override,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedScope {
    pub project_id: String,
    pub dataset: String,
    pub source: ScopeSource,
}

/// Optional caller-provided overrides for either half of the scope.
#[derive(Debug, Clone, Default)]
pub struct ScopeOverride {
    pub project: Option<String>,
    pub dataset: Option<String>,
}

// ---------------------------------------------------------------------------
// Slugs and collection naming
// ---------------------------------------------------------------------------

/// Lowercase alphanumeric + underscore; runs of anything else collapse to a
/// single underscore. Leading/trailing underscores are trimmed.
pub fn slug(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_was_sep = true;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// Like [`slug`] but with `-` as the separator, for dataset names.
fn dash_slug(input: &str) -> String {
    slug(input).replace('_', "-")
}

/// Canonical collection handle for a `(project, dataset)` pair.
pub fn collection_name(project_id: &str, dataset_name: &str) -> String {
    format!("project_{}_dataset_{}", slug(project_id), slug(dataset_name))
}

// ---------------------------------------------------------------------------
// Locator normalization
// ---------------------------------------------------------------------------

/// Canonicalize a local path: resolve symlinks, strip trailing separators,
/// lowercase on case-insensitive platforms.
fn normalize_local(path: &Path) -> Result<String, ScopeError> {
    let canonical = path
        .canonicalize()
        .map_err(|_| ScopeError::PathNotFound(path.display().to_string()))?;
    let mut s = canonical.to_string_lossy().replace('\\', "/");
    while s.len() > 1 && s.ends_with('/') {
        s.pop();
    }
    if cfg!(any(target_os = "windows", target_os = "macos")) {
        s = s.to_lowercase();
    }
    Ok(s)
}

/// Normalize a git remote: trim, strip a trailing `.git`, lowercase.
fn normalize_remote(remote: &str) -> String {
    let trimmed = remote.trim().trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    trimmed.to_lowercase()
}

/// Extract the host from a URL-ish string without a full parser:
/// strips scheme, userinfo, port, and path.
fn host_of(url: &str) -> Option<String> {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let rest = rest.rsplit_once('@').map(|(_, r)| r).unwrap_or(rest);
    let host = rest.split(['/', '?', '#']).next()?;
    let host = host.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_lowercase())
    }
}

// ---------------------------------------------------------------------------
// Project id derivation
// ---------------------------------------------------------------------------

/// First `AFFIX_LEN` Base58 chars of `SHA-256(locator + tag)`.
fn affix(normalized: &str, tag: &str) -> String {
    let digest = sha256(format!("{normalized}{tag}").as_bytes());
    base58_encode(&digest).chars().take(AFFIX_LEN).collect()
}

/// Build `{prefix8}-{name}-{suffix8}`, salting the suffix until
/// `is_collision` clears. The prefix never changes, so colliding ids stay
/// recognizably related to their locator.
fn derive_project_id(
    normalized: &str,
    name: &str,
    is_collision: &dyn Fn(&str) -> bool,
) -> Result<String, ScopeError> {
    let prefix = affix(normalized, ":prefix");
    for salt in 1..=MAX_COLLISION_SALTS {
        let tag = if salt == 1 { ":suffix".to_string() } else { format!(":suffix#{salt}") };
        let suffix = affix(normalized, &tag);
        let candidate = format!("{prefix}-{name}-{suffix}");
        if !is_collision(&candidate) {
            if salt > 1 {
                tracing::warn!(project_id = %candidate, salt, "project id collision resolved by salting");
            }
            return Ok(candidate);
        }
    }
    Err(ScopeError::CollisionUnresolved(normalized.to_string()))
}

/// Name segment for a local path: the slug of its basename, falling back to
/// `root_{hash8}` when the basename sanitizes to nothing (e.g. `/`).
fn local_name_segment(normalized: &str) -> String {
    let basename = normalized.rsplit('/').next().unwrap_or("");
    let name = slug(basename);
    if name.is_empty() {
        format!("root_{}", &sha256_hex(normalized.as_bytes())[..8])
    } else {
        name
    }
}

// ---------------------------------------------------------------------------
// Resolvers
// ---------------------------------------------------------------------------

/// Resolve a local working copy. The path must exist.
pub fn resolve_local(
    path: &Path,
    over: &ScopeOverride,
    is_collision: &dyn Fn(&str) -> bool,
) -> Result<ResolvedScope, ScopeError> {
    let dataset = over.dataset.clone().unwrap_or_else(|| DEFAULT_LOCAL_DATASET.to_string());
    if let Some(project) = &over.project {
        return Ok(ResolvedScope {
            project_id: project.clone(),
            dataset,
            source: ScopeSource::Override,
        });
    }

    let normalized = normalize_local(path)?;
    let name = local_name_segment(&normalized);
    let project_id = derive_project_id(&normalized, &name, is_collision)?;
    let source =
        if over.dataset.is_some() { ScopeSource::Override } else { ScopeSource::Detected };
    Ok(ResolvedScope { project_id, dataset, source })
}

/// Resolve a remote git repository locator (https, ssh, or scp-like).
pub fn resolve_remote_repo(
    remote: &str,
    over: &ScopeOverride,
    is_collision: &dyn Fn(&str) -> bool,
) -> Result<ResolvedScope, ScopeError> {
    let normalized = normalize_remote(remote);
    if normalized.is_empty() {
        return Err(ScopeError::InvalidLocator(remote.to_string()));
    }

    // owner/repo are the last two path-ish segments; handles both
    // `host/owner/repo` and scp-style `host:owner/repo`.
    let segments: Vec<&str> = normalized
        .rsplit(['/', ':'])
        .take(2)
        .collect();
    let (repo, owner) = match segments.as_slice() {
        [repo, owner] if !repo.is_empty() && !owner.is_empty() => (*repo, *owner),
        _ => return Err(ScopeError::InvalidLocator(remote.to_string())),
    };

    let dataset = over
        .dataset
        .clone()
        .unwrap_or_else(|| format!("github-{}-{}", dash_slug(owner), dash_slug(repo)));

    if let Some(project) = &over.project {
        return Ok(ResolvedScope {
            project_id: project.clone(),
            dataset,
            source: ScopeSource::Override,
        });
    }

    let project_id = derive_project_id(&normalized, &slug(repo), is_collision)?;
    let source =
        if over.dataset.is_some() { ScopeSource::Override } else { ScopeSource::Detected };
    Ok(ResolvedScope { project_id, dataset, source })
}

/// Resolve a crawl seed URL. Dataset is `crawl-{domain}` with dots as dashes.
pub fn resolve_crawl(
    url: &str,
    over: &ScopeOverride,
    is_collision: &dyn Fn(&str) -> bool,
) -> Result<ResolvedScope, ScopeError> {
    let domain =
        host_of(url).ok_or_else(|| ScopeError::InvalidLocator(url.to_string()))?;

    let dataset = over
        .dataset
        .clone()
        .unwrap_or_else(|| format!("crawl-{}", dash_slug(&domain.replace('.', "-"))));

    if let Some(project) = &over.project {
        return Ok(ResolvedScope {
            project_id: project.clone(),
            dataset,
            source: ScopeSource::Override,
        });
    }

    // Scope by origin so every page of a site lands in one project.
    let scheme = url.split_once("://").map(|(s, _)| s.to_lowercase()).unwrap_or_else(|| "https".to_string());
    let normalized = format!("{scheme}://{domain}");
    let project_id = derive_project_id(&normalized, &slug(&domain), is_collision)?;
    let source =
        if over.dataset.is_some() { ScopeSource::Override } else { ScopeSource::Detected };
    Ok(ResolvedScope { project_id, dataset, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_collision(_: &str) -> bool {
        false
    }

    #[test]
    fn slug_collapses_runs() {
        assert_eq!(slug("My Cool-Project!!v2"), "my_cool_project_v2");
        assert_eq!(slug("--hello--"), "hello");
        assert_eq!(slug("///"), "");
    }

    #[test]
    fn collection_name_is_deterministic() {
        assert_eq!(
            collection_name("abc-myproj-def", "local"),
            "project_abc_myproj_def_dataset_local"
        );
    }

    #[test]
    fn local_resolution_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let a = resolve_local(dir.path(), &ScopeOverride::default(), &no_collision).unwrap();
        let b = resolve_local(dir.path(), &ScopeOverride::default(), &no_collision).unwrap();
        assert_eq!(a.project_id, b.project_id);
        assert_eq!(a.dataset, "local");
        assert_eq!(a.source, ScopeSource::Detected);
    }

    #[test]
    fn distinct_paths_get_distinct_ids() {
        let d1 = tempfile::tempdir().unwrap();
        let d2 = tempfile::tempdir().unwrap();
        let a = resolve_local(d1.path(), &ScopeOverride::default(), &no_collision).unwrap();
        let b = resolve_local(d2.path(), &ScopeOverride::default(), &no_collision).unwrap();
        assert_ne!(a.project_id, b.project_id);
    }

    #[test]
    fn missing_path_is_fatal() {
        let err = resolve_local(
            Path::new("/definitely/not/a/real/path"),
            &ScopeOverride::default(),
            &no_collision,
        );
        assert!(matches!(err, Err(ScopeError::PathNotFound(_))));
    }

    #[test]
    fn collision_salts_the_suffix_only() {
        let dir = tempfile::tempdir().unwrap();
        let plain = resolve_local(dir.path(), &ScopeOverride::default(), &no_collision).unwrap();

        // Report the unsalted id as colliding; the resolver must move on.
        let colliding = plain.project_id.clone();
        let salted = resolve_local(
            dir.path(),
            &ScopeOverride::default(),
            &move |id: &str| id == colliding,
        )
        .unwrap();

        assert_ne!(plain.project_id, salted.project_id);
        let prefix = plain.project_id.split('-').next().unwrap().to_string();
        assert!(salted.project_id.starts_with(&prefix), "prefix must be stable across salts");
    }

    #[test]
    fn override_wins() {
        let dir = tempfile::tempdir().unwrap();
        let over = ScopeOverride {
            project: Some("team-docs".to_string()),
            dataset: Some("handbook".to_string()),
        };
        let got = resolve_local(dir.path(), &over, &no_collision).unwrap();
        assert_eq!(got.project_id, "team-docs");
        assert_eq!(got.dataset, "handbook");
        assert_eq!(got.source, ScopeSource::Override);
    }

    #[test]
    fn remote_repo_dataset_naming() {
        for remote in [
            "https://github.com/Tokio-RS/Tokio.git",
            "git@github.com:tokio-rs/tokio.git",
            "https://github.com/tokio-rs/tokio",
        ] {
            let got =
                resolve_remote_repo(remote, &ScopeOverride::default(), &no_collision).unwrap();
            assert_eq!(got.dataset, "github-tokio-rs-tokio", "remote {remote}");
        }
    }

    #[test]
    fn equivalent_remotes_share_a_project() {
        let a = resolve_remote_repo(
            "https://github.com/tokio-rs/tokio.git",
            &ScopeOverride::default(),
            &no_collision,
        )
        .unwrap();
        let b = resolve_remote_repo(
            "https://github.com/tokio-rs/tokio",
            &ScopeOverride::default(),
            &no_collision,
        )
        .unwrap();
        assert_eq!(a.project_id, b.project_id);
    }

    #[test]
    fn crawl_dataset_naming() {
        let got = resolve_crawl(
            "https://docs.example.com/guide/intro",
            &ScopeOverride::default(),
            &no_collision,
        )
        .unwrap();
        assert_eq!(got.dataset, "crawl-docs-example-com");
    }

    #[test]
    fn crawl_scope_is_per_origin() {
        let a = resolve_crawl("https://example.com/a", &ScopeOverride::default(), &no_collision)
            .unwrap();
        let b = resolve_crawl("https://example.com/b/c", &ScopeOverride::default(), &no_collision)
            .unwrap();
        assert_eq!(a.project_id, b.project_id);
    }
}
