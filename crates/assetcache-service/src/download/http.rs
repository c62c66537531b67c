//! Support to download from HTTP sources.

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::{Client, StatusCode};
use url::Url;

use crate::caching::{CacheContents, CacheError};
use crate::utils::http::{DownloadTimeouts, create_client};

use super::Transport;

/// Transport implementation that fetches assets over HTTP.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn from_timeouts(timeouts: &DownloadTimeouts) -> reqwest::Result<Self> {
        Ok(Self::new(create_client(timeouts)?))
    }
}

impl Transport for HttpTransport {
    fn fetch(&self, url: &Url) -> BoxFuture<'static, CacheContents<Bytes>> {
        let request = self.client.get(url.clone());
        async move {
            let response = request.send().await?;
            let status = response.status();

            if status.is_success() {
                tracing::trace!("Success hitting `{}`", response.url());
                Ok(response.bytes().await?)
            } else if matches!(status, StatusCode::NOT_FOUND | StatusCode::GONE) {
                Err(CacheError::NotFound)
            } else {
                tracing::debug!("Unexpected status code from `{}`: {}", response.url(), status);
                Err(CacheError::DownloadError(status.to_string()))
            }
        }
        .boxed()
    }
}
