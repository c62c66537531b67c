use std::time::Duration;

use thiserror::Error;

/// An error that happens while obtaining or rendering an asset.
///
/// Errors are never written to disk. The next request for the same key tries again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The asset was not found at its source.
    #[error("not found")]
    NotFound,
    /// The asset could not be fetched from its source due to a timeout.
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    /// The asset could not be fetched from its source due to another problem,
    /// like connection loss, DNS resolution, or a 5xx server response.
    ///
    /// The attached string contains the source's response.
    #[error("download failed: {0}")]
    DownloadError(String),
    /// The asset was fetched successfully, but could not be decoded or rendered.
    #[error("malformed: {0}")]
    Malformed(String),
    /// An unexpected error in the cache itself.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl CacheError {
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// A short name of the error kind, used as a metrics tag.
    pub fn kind(&self) -> &'static str {
        match self {
            CacheError::NotFound => "notfound",
            CacheError::Timeout(_) => "timeout",
            CacheError::DownloadError(_) => "downloaderror",
            CacheError::Malformed(_) => "malformed",
            CacheError::InternalError => "internalerror",
        }
    }
}

/// The contents of a cache operation, containing either `Ok(T)` or an error denoting the
/// reason why an asset could not be obtained.
pub type CacheContents<T = ()> = Result<T, CacheError>;
