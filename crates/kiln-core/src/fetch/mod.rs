//! Pluggable source retrieval.
//!
//! A [`FetchDescriptor`] is attached to one recipe version. Turning it into a
//! [`FetchStrategy`] binds it to the four stage operations: fetch, verify,
//! expand and reset.

pub mod extract;
pub mod git;
pub mod stage;
pub mod url;

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kiln_schema::Sha256Digest;
use thiserror::Error;

use crate::process::{ProcessError, RunLimits};
use crate::reporter::{NullReporter, Reporter};

pub use extract::{ArchiveFormat, ExtractError};
pub use git::{GitFetch, GitRef};
pub use stage::Stage;
pub use url::UrlFetch;

/// Where a version's source comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchDescriptor {
    /// Archive or file downloaded over HTTP(S) or `file://`.
    Url {
        /// Download location.
        url: String,
        /// Expected SHA-256 of the download.
        checksum: Sha256Digest,
    },
    /// Git checkout.
    Vcs {
        /// Clone location.
        url: String,
        /// What to check out.
        reference: GitRef,
    },
}

impl FetchDescriptor {
    /// Strategy that performs this fetch.
    pub fn strategy(&self) -> Box<dyn FetchStrategy> {
        match self {
            Self::Url { url, checksum } => Box::new(UrlFetch::new(url.clone(), checksum.clone())),
            Self::Vcs { url, reference } => Box::new(GitFetch::new(url.clone(), reference.clone())),
        }
    }

    /// Location the source is retrieved from.
    pub fn url(&self) -> &str {
        match self {
            Self::Url { url, .. } | Self::Vcs { url, .. } => url,
        }
    }
}

impl fmt::Display for FetchDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url { url, .. } => f.write_str(url),
            Self::Vcs { url, reference } => write!(f, "{url} ({reference})"),
        }
    }
}

/// Shared inputs for every fetch operation.
#[derive(Clone)]
pub struct FetchContext {
    /// HTTP client.
    pub client: reqwest::Client,
    /// Timeout and cancellation for each download or subprocess.
    pub limits: RunLimits,
    /// Retries for transient network errors.
    pub retries: u32,
    /// Receives non-fatal warnings.
    pub reporter: Arc<dyn Reporter>,
}

impl fmt::Debug for FetchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchContext")
            .field("limits", &self.limits)
            .field("retries", &self.retries)
            .finish_non_exhaustive()
    }
}

impl Default for FetchContext {
    fn default() -> Self {
        Self {
            client: reqwest::Client::new(),
            limits: RunLimits::default(),
            retries: 3,
            reporter: Arc::new(NullReporter),
        }
    }
}

/// Errors raised by fetch strategies.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The archive's digest differs from the recipe's; the archive was deleted.
    #[error("checksum mismatch for {}: expected {expected}, got {actual}", path.display())]
    ChecksumMismatch {
        /// Archive path.
        path: PathBuf,
        /// Digest from the recipe.
        expected: Sha256Digest,
        /// Digest of the downloaded bytes.
        actual: Sha256Digest,
    },
    /// Retrieval failed after any retries.
    #[error("failed to fetch {url}: {cause}")]
    FetchFailed {
        /// Source location.
        url: String,
        /// Last failure.
        cause: String,
    },
    /// Verify or expand ran before a successful fetch.
    #[error("no archive at {}", .0.display())]
    NoArchive(PathBuf),
    /// The archive could not be unpacked.
    #[error("failed to expand {}", path.display())]
    Expand {
        /// Archive path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: ExtractError,
    },
    /// A download or subprocess exceeded its timeout.
    #[error("fetching {url} timed out after {}s", after.as_secs())]
    Timeout {
        /// Source location.
        url: String,
        /// Limit that elapsed.
        after: Duration,
    },
    /// Cancellation was requested.
    #[error("fetching {0} was cancelled")]
    Cancelled(String),
    /// Filesystem error inside the stage.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Taxonomy name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChecksumMismatch { .. } => "ChecksumMismatch",
            Self::FetchFailed { .. } => "FetchFailed",
            Self::NoArchive(_) => "NoArchive",
            Self::Expand { .. } => "Expand",
            Self::Timeout { .. } => "Timeout",
            Self::Cancelled(_) => "Cancelled",
            Self::Io(_) => "Io",
        }
    }

    /// Whether another attempt may succeed.
    pub(crate) fn is_transient(&self) -> bool {
        matches!(self, Self::FetchFailed { .. } | Self::Timeout { .. })
    }

    pub(crate) fn from_process(url: &str, err: ProcessError) -> Self {
        match err {
            ProcessError::TimedOut { after, .. } => Self::Timeout {
                url: url.to_string(),
                after,
            },
            ProcessError::Cancelled { .. } => Self::Cancelled(url.to_string()),
            other => Self::FetchFailed {
                url: url.to_string(),
                cause: other.to_string(),
            },
        }
    }
}

const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Delay before retry number `attempt` (1-based).
pub(crate) fn backoff(attempt: u32) -> Duration {
    let millis = 250u64.saturating_mul(1 << attempt.min(8));
    Duration::from_millis(millis).min(MAX_BACKOFF)
}

/// Run `op` until it succeeds, fails permanently, or `ctx.retries`
/// transient failures have been retried.
pub(crate) async fn with_retries<T, F, Fut>(source: &str, ctx: &FetchContext, mut op: F) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if attempt < ctx.retries && e.is_transient() => {
                attempt += 1;
                tracing::warn!(source, attempt, error = %e, "retrying fetch");
                tokio::select! {
                    () = tokio::time::sleep(backoff(attempt)) => {}
                    () = ctx.limits.cancel.cancelled() => return Err(FetchError::Cancelled(source.to_string())),
                }
            }
            result => return result,
        }
    }
}

/// The four stage operations.
///
/// Every path is derived from the [`Stage`]; the process working directory
/// is never consulted.
#[async_trait]
pub trait FetchStrategy: Send + Sync + fmt::Debug {
    /// Location being retrieved.
    fn source(&self) -> &str;

    /// Retrieve into the stage unless already present.
    async fn fetch(&self, stage: &Stage, ctx: &FetchContext) -> Result<(), FetchError>;

    /// Check the retrieved data.
    async fn verify(&self, stage: &Stage) -> Result<(), FetchError>;

    /// Produce the stage's source directory unless already present.
    async fn expand(&self, stage: &Stage) -> Result<(), FetchError>;

    /// Return the source directory to its freshly-expanded state.
    async fn reset(&self, stage: &Stage, ctx: &FetchContext) -> Result<(), FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn failed() -> FetchError {
        FetchError::FetchFailed {
            url: "https://example.org/zlib.tar.gz".into(),
            cause: "connection reset".into(),
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let ctx = FetchContext {
            retries: 2,
            ..FetchContext::default()
        };
        let calls = &AtomicU32::new(0);
        let got = with_retries("zlib", &ctx, move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 { Err(failed()) } else { Ok(7) }
        })
        .await
        .unwrap();
        assert_eq!(got, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded_and_selective() {
        let ctx = FetchContext {
            retries: 1,
            ..FetchContext::default()
        };
        let calls = &AtomicU32::new(0);
        let err = with_retries("zlib", &ctx, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(failed())
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "FetchFailed");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let calls = &AtomicU32::new(0);
        let err = with_retries("zlib", &ctx, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(FetchError::NoArchive(PathBuf::from("/stage/zlib.tar.gz")))
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "NoArchive");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert!(backoff(1) < backoff(2));
        assert_eq!(backoff(30), MAX_BACKOFF);
    }
}
