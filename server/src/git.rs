//! Remote repository sync — clone/fetch a remote into the data dir and
//! check out the requested branch or commit so ingestion can treat it as a
//! local tree.

use git2::build::RepoBuilder;
use git2::{FetchOptions, Repository, ResetType};
use std::path::{Path, PathBuf};
use tracing::info;

use atoll_core::scope::slug;

use crate::error::Result;

/// Clone (or fetch) `remote` under `repos_dir` and hard-reset the working
/// tree to `sha`, `origin/{branch}`, or the remote HEAD. Returns the
/// checkout path.
pub fn sync_repo(
    repos_dir: &Path,
    remote: &str,
    branch: Option<&str>,
    sha: Option<&str>,
) -> Result<PathBuf> {
    std::fs::create_dir_all(repos_dir)?;
    let dir = repos_dir.join(slug(remote));

    let repo = if dir.join(".git").exists() {
        let repo = Repository::open(&dir)?;
        {
            let mut origin = repo.find_remote("origin")?;
            origin.fetch(&[] as &[&str], Some(&mut FetchOptions::new()), None)?;
        }
        info!(remote, dir = %dir.display(), "fetched existing checkout");
        repo
    } else {
        let repo = RepoBuilder::new()
            .fetch_options(FetchOptions::new())
            .clone(remote, &dir)?;
        info!(remote, dir = %dir.display(), "cloned");
        repo
    };

    let target = if let Some(sha) = sha {
        repo.revparse_single(sha)?
    } else if let Some(branch) = branch {
        repo.revparse_single(&format!("origin/{branch}"))
            .or_else(|_| repo.revparse_single(branch))?
    } else {
        repo.revparse_single("HEAD")?
    };
    repo.reset(&target, ResetType::Hard, None)?;

    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Signature;

    /// Build a one-commit repository to clone from.
    fn seed_repo(dir: &Path) -> String {
        let repo = Repository::init(dir).unwrap();
        std::fs::write(dir.join("lib.rs"), "pub fn seeded() {}\n").unwrap();

        let mut index = repo.index().unwrap();
        index.add_path(Path::new("lib.rs")).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = Signature::now("tester", "tester@example.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "seed", &tree, &[]).unwrap();

        dir.to_string_lossy().into_owned()
    }

    #[test]
    fn clone_then_fetch_is_idempotent() {
        let upstream = tempfile::tempdir().unwrap();
        let remote = seed_repo(upstream.path());
        let repos_dir = tempfile::tempdir().unwrap();

        let checkout = sync_repo(repos_dir.path(), &remote, None, None).unwrap();
        assert!(checkout.join("lib.rs").exists());

        // Second sync reuses the checkout.
        let again = sync_repo(repos_dir.path(), &remote, None, None).unwrap();
        assert_eq!(checkout, again);
    }

    #[test]
    fn unknown_sha_is_an_error() {
        let upstream = tempfile::tempdir().unwrap();
        let remote = seed_repo(upstream.path());
        let repos_dir = tempfile::tempdir().unwrap();

        let err = sync_repo(repos_dir.path(), &remote, None, Some("deadbeef"));
        assert!(err.is_err());
    }
}
