//! # HTTP Retrieval Utilities
//!
//! A JSON GET client for public market-data REST APIs. Transient failures
//! (connect errors, 5xx, 429) are retried with exponential backoff by
//! `reqwest-retry`; anything else comes back as an [`ApiResponse`] with the
//! status and, for non-2xx replies, the raw body.

use std::time::Duration;

use anyhow::Context;
use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use serde::de::DeserializeOwned;
use url::Url;

/// Retries applied to transient failures.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Upper bound on one attempt, connect through last body byte.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

const CLIENT_NAME: &str = concat!("lib_common/", env!("CARGO_PKG_VERSION"));

/// Outcome of one request after retries.
#[derive(Debug)]
pub struct ApiResponse<T> {
    /// Decoded body of a 2xx reply.
    pub data: Option<T>,
    /// Raw body of a non-2xx reply.
    pub error_body: Option<String>,
    pub status: u16,
    pub success: bool,
}

/// Cheaply cloneable; clones share the connection pool.
#[derive(Clone)]
pub struct ApiClient {
    inner: ClientWithMiddleware,
    base_url: Url,
}

impl ApiClient {
    /// Client with the default retry policy.
    ///
    /// # Errors
    /// Fails if `base_url` is not an absolute URL.
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        Self::with_retries(base_url, DEFAULT_MAX_RETRIES)
    }

    pub fn with_retries(base_url: &str, max_retries: u32) -> anyhow::Result<Self> {
        Self::with_options(base_url, max_retries, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Client with explicit retry count and per-attempt timeout.
    pub fn with_options(base_url: &str, max_retries: u32, request_timeout: Duration) -> anyhow::Result<Self> {
        // Relative joins drop the last segment unless the base ends with '/'.
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let base_url = Url::parse(&normalized)
            .with_context(|| format!("invalid base URL {:?} (must be absolute)", base_url))?;

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(request_timeout)
            .build()
            .context("failed to build HTTP client")?;
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);
        let inner = ClientBuilder::new(http)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self { inner, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolves `path` against the base and appends `query` pairs.
    pub fn endpoint(&self, path: &str, query: &[(&str, String)]) -> anyhow::Result<Url> {
        let mut url = self
            .base_url
            .join(path)
            .with_context(|| format!("invalid endpoint path {:?}", path))?;
        if !query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
        }
        Ok(url)
    }

    /// `GET {base}{path}?{query}` decoded as JSON.
    ///
    /// # Errors
    /// Network failures after retries and undecodable 2xx bodies. A non-2xx
    /// status is not an error; it comes back with `success == false`.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> anyhow::Result<ApiResponse<T>> {
        let url = self.endpoint(path, query)?;
        log::debug!("GET {}", url);

        let response = self
            .inner
            .get(url.clone())
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, CLIENT_NAME)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?;

        let status = response.status();
        if status.is_success() {
            let data = response
                .json::<T>()
                .await
                .with_context(|| format!("GET {} returned an undecodable body", url))?;
            Ok(ApiResponse {
                data: Some(data),
                error_body: None,
                status: status.as_u16(),
                success: true,
            })
        } else {
            log::warn!("GET {} returned HTTP {}", url, status);
            Ok(ApiResponse {
                data: None,
                error_body: response.text().await.ok(),
                status: status.as_u16(),
                success: false,
            })
        }
    }
}
