//! HTTP fetching.
//!
//! The pipeline never talks to the network directly; it goes through the
//! [`HttpFetch`] trait so workers can be exercised against canned responses.
//! [`ReqwestFetch`] is the production implementation.

use bytes::Bytes;
use futures_util::future::BoxFuture;

use crate::error::{HdsError, Result};

/// Fetch a URL fully into memory.
pub trait HttpFetch: Send + Sync {
    /// Perform a GET request and return the whole response body.
    ///
    /// Implementations must fail with [`HdsError::ShortRead`] when the body
    /// ends before the advertised Content-Length.
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Bytes>>;
}

/// [`HttpFetch`] backed by a shared `reqwest::Client`.
pub struct ReqwestFetch {
    client: reqwest::Client,
}

impl ReqwestFetch {
    /// Create a fetcher with a fresh client.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Create a fetcher around an existing client (connection pool reuse).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestFetch {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpFetch for ReqwestFetch {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Bytes>> {
        Box::pin(async move {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| HdsError::Http(e.to_string()))?;

            let advertised = response.content_length();
            let body = response
                .bytes()
                .await
                .map_err(|e| HdsError::Http(e.to_string()))?;

            if let Some(expected) = advertised {
                if (body.len() as u64) < expected {
                    return Err(HdsError::ShortRead {
                        received: body.len(),
                        expected: expected as usize,
                    });
                }
            }

            Ok(body)
        })
    }
}
