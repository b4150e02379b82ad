//! Error taxonomy for the pipeline.
//!
//! Hard errors terminate a job and surface a structured code; soft errors
//! are per-item values tallied by the coordinators, which fail the job only
//! when the failure ratio crosses the budget. Query-path degradations are
//! never errors — they ride back in the response metadata.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// A job fails outright once more than this fraction of its items fail.
pub const FAILURE_RATIO_CAP: f64 = 0.25;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad caller input. Surfaced, never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Scope(#[from] atoll_core::scope::ScopeError),

    #[error("source unreadable: {0}")]
    SourceUnreadable(String),

    /// Encoder kept failing after retries exhausted.
    #[error("encoder failure: {0}")]
    EncoderFatal(String),

    #[error("store unavailable: {0}")]
    StoreTransient(String),

    #[error("store failure: {0}")]
    StoreFatal(String),

    /// Metadata and vector stores diverged beyond the reconciliation window.
    #[error("stores diverged for collection {collection}: {detail}")]
    CoherenceBroken { collection: String, detail: String },

    #[error("cancelled")]
    Cancelled,

    #[error("crawl target blocked by address policy: {0}")]
    SsrfBlocked(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("git: {0}")]
    Git(#[from] git2::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Stable machine-readable code attached to job errors and API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "input.invalid",
            Error::Scope(atoll_core::scope::ScopeError::CollisionUnresolved(_)) => {
                "scope.collision"
            }
            Error::Scope(_) => "input.invalid",
            Error::SourceUnreadable(_) => "source.unreadable",
            Error::EncoderFatal(_) => "encoder.fatal",
            Error::StoreTransient(_) => "store.transient",
            Error::StoreFatal(_) | Error::Sqlite(_) => "store.fatal",
            Error::CoherenceBroken { .. } => "coherence.broken",
            Error::Cancelled => "cancelled",
            Error::SsrfBlocked(_) => "ssrf.blocked",
            Error::JobNotFound(_) => "job.not_found",
            Error::Http(_) => "encoder.transient",
            Error::Io(_) => "source.unreadable",
            Error::Git(_) => "source.unreadable",
            Error::Json(_) => "store.fatal",
        }
    }
}

// ---------------------------------------------------------------------------
// Soft-error accounting
// ---------------------------------------------------------------------------

/// Per-item soft failures collected across a job. The coordinator calls
/// [`FailureTally::over_budget`] at aggregation points to decide whether the
/// accumulated damage turns the job hard.
#[derive(Debug, Default)]
pub struct FailureTally {
    pub attempted: usize,
    pub failed: usize,
    samples: Vec<String>,
}

/// Sample lines kept for the job summary.
const SAMPLE_CAP: usize = 20;

impl FailureTally {
    pub fn ok(&mut self) {
        self.attempted += 1;
    }

    pub fn soft(&mut self, code: &str, item: &str, detail: &str) {
        self.attempted += 1;
        self.failed += 1;
        if self.samples.len() < SAMPLE_CAP {
            self.samples.push(format!("{code}: {item}: {detail}"));
        }
        tracing::warn!(code, item, detail, "soft error");
    }

    pub fn ratio(&self) -> f64 {
        if self.attempted == 0 {
            0.0
        } else {
            self.failed as f64 / self.attempted as f64
        }
    }

    pub fn over_budget(&self) -> bool {
        self.ratio() > FAILURE_RATIO_CAP
    }

    pub fn samples(&self) -> &[String] {
        &self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tally_ratio_and_budget() {
        let mut t = FailureTally::default();
        assert!(!t.over_budget());

        for _ in 0..3 {
            t.ok();
        }
        t.soft("chunk.skip", "a.bin", "binary");
        assert!((t.ratio() - 0.25).abs() < 1e-9);
        assert!(!t.over_budget(), "exactly 25% is within budget");

        t.soft("source.unreadable", "b.txt", "denied");
        assert!(t.over_budget());
        assert_eq!(t.samples().len(), 2);
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(Error::InvalidInput("x".into()).code(), "input.invalid");
        assert_eq!(Error::Cancelled.code(), "cancelled");
        assert_eq!(
            Error::CoherenceBroken { collection: "c".into(), detail: "d".into() }.code(),
            "coherence.broken"
        );
    }
}
