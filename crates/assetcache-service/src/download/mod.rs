//! Obtaining canonical assets from their [`Source`].
//!
//! Remote sources go through a [`Transport`], custom sources through their own loader.
//! Seeded sources can not be fetched at all, they only exist once they were put into the cache.

use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::BoxFuture;
use url::Url;

use crate::caching::{CacheContents, CacheError, Source};
use crate::metric;
use crate::types::Asset;
use crate::utils::http::DownloadTimeouts;

mod http;

pub use self::http::HttpTransport;

/// The user agent sent with all outgoing requests.
pub const USER_AGENT: &str = concat!("assetcache/", env!("CARGO_PKG_VERSION"));

/// Fetches the raw bytes behind a remote URL.
pub trait Transport: fmt::Debug + Send + Sync + 'static {
    fn fetch(&self, url: &Url) -> BoxFuture<'static, CacheContents<Bytes>>;
}

impl CacheError {
    fn download_error(mut error: &dyn Error) -> Self {
        while let Some(src) = error.source() {
            error = src;
        }

        let mut error_string = error.to_string();

        // Special-case a few error strings
        if error_string.contains("certificate verify failed") {
            error_string = "certificate verify failed".to_string();
        }

        if error_string.contains("SSL routines") {
            error_string = "SSL error".to_string();
        }

        Self::DownloadError(error_string)
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            tracing::debug!("Request timed out: {}", error);
        }
        Self::download_error(&error)
    }
}

/// What a source yielded.
#[derive(Debug)]
pub enum Fetched {
    /// Raw bytes from a transport, still to be decoded.
    Data(Bytes),
    /// A ready asset from a custom loader.
    Asset(Asset),
}

/// A service which can fetch canonical assets from any [`Source`].
#[derive(Clone, Debug)]
pub struct DownloadService {
    transport: Arc<dyn Transport>,
    timeouts: DownloadTimeouts,
}

impl DownloadService {
    pub fn new(transport: Arc<dyn Transport>, timeouts: DownloadTimeouts) -> Self {
        Self {
            transport,
            timeouts,
        }
    }

    /// Fetches whatever `source` points at, giving up after the configured download timeout.
    pub async fn fetch(&self, source: &Source) -> CacheContents<Fetched> {
        let source_kind = match source {
            Source::Remote(_) => "remote",
            Source::Custom(_) => "custom",
            Source::Seeded(identifier) => {
                tracing::debug!("Seeded asset `{}` is not available", identifier);
                return Err(CacheError::NotFound);
            }
        };

        let timeout = self.timeouts.max_download;
        let job = async {
            match source {
                Source::Remote(url) => {
                    tracing::debug!("Fetching asset from `{}`", url);
                    self.transport.fetch(url).await.map(Fetched::Data)
                }
                Source::Custom(custom) => {
                    tracing::debug!("Loading custom asset `{}`", source);
                    custom.load().await.map(Fetched::Asset).ok_or(CacheError::NotFound)
                }
                Source::Seeded(_) => Err(CacheError::NotFound),
            }
        };

        let start = Instant::now();
        let result = match tokio::time::timeout(timeout, job).await {
            Err(_) => Err(CacheError::Timeout(timeout)),
            Ok(result) => result,
        };

        let status = match result {
            Ok(_) => "success",
            Err(ref e) => e.kind(),
        };
        metric!(
            timer("service.download.duration") = start.elapsed(),
            "source" => source_kind,
            "status" => status,
        );
        if let Err(ref e) = result {
            tracing::debug!(
                error = e as &dyn Error,
                source = %source,
                "failed to fetch asset"
            );
        }

        result
    }

    pub fn timeout(&self) -> Duration {
        self.timeouts.max_download
    }
}
