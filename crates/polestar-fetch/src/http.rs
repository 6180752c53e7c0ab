//! HTTP retrieval of module source.

use crate::error::{FetchError, Result};
use crate::scan;
use dashmap::DashMap;
use polestar_loader::{
    DependencyList, FetchFuture, FetchOptions, FetchResult, Fetcher, LoaderError,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// HTTP fetcher backed by a shared connection pool and a per-URL result
/// cache.
///
/// The module id is the *final* URL after redirects, so a range-addressed
/// request (`…/react@^16`) pins to the exact version the CDN serves.
/// `.css` responses become CSS modules and `.json` responses become
/// modules exporting the parsed value; anything else is scanned for
/// `require(...)` requests and UMD preambles.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    cache: Arc<DashMap<String, FetchResult>>,
}

impl HttpFetcher {
    /// Create a fetcher with the default client configuration.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(20)
            .user_agent(format!("polestar/{}", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(client))
    }

    /// Create a fetcher around an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            cache: Arc::new(DashMap::new()),
        }
    }

    /// Drop all cached results.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    #[instrument(skip(self, options))]
    async fn fetch_module(&self, url: String, options: FetchOptions) -> Result<FetchResult> {
        if let Some(hit) = self.cache.get(&url) {
            debug!("cache hit");
            return Ok(hit.clone());
        }
        debug!(
            required_by = options.required_by_id.as_deref().unwrap_or("<entry>"),
            request = options.original_request.as_deref().unwrap_or(&url),
            "fetching module source"
        );

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url,
                status: status.as_u16(),
            });
        }
        let final_url = response.url().to_string();
        let text = response.text().await?;

        let result = classify(&url, &final_url, text)?;
        self.cache.insert(url, result.clone());
        Ok(result)
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, options: FetchOptions) -> FetchFuture {
        let fetcher = self.clone();
        let url = url.to_string();
        Box::pin(async move {
            fetcher
                .fetch_module(url.clone(), options)
                .await
                .map_err(|err| LoaderError::fetch(url, err.to_string()))
        })
    }
}

/// Build a [`FetchResult`] from a retrieved body, keyed by what the URL's
/// path ends with.
fn classify(requested_url: &str, final_url: &str, text: String) -> Result<FetchResult> {
    let path = url_path(final_url);

    if path.ends_with(".css") {
        return Ok(FetchResult {
            url: requested_url.to_string(),
            id: final_url.to_string(),
            code: String::new(),
            css: Some(text),
            ..Default::default()
        });
    }

    if path.ends_with(".json") {
        return Ok(FetchResult {
            url: requested_url.to_string(),
            id: final_url.to_string(),
            code: format!("module.exports = {}", text),
            ..Default::default()
        });
    }

    let dependency_version_ranges = scan::dependency_ranges(requested_url, &text)?;
    let dependencies = if scan::is_umd(&text) {
        DependencyList::Umd
    } else {
        DependencyList::Requests(scan::find_requires(&text))
    };
    Ok(FetchResult {
        url: requested_url.to_string(),
        id: final_url.to_string(),
        code: text,
        dependencies,
        dependency_version_ranges,
        css: None,
    })
}

/// The path portion of a URL, without query or fragment.
fn url_path(url: &str) -> &str {
    let end = url.find(['?', '#']).unwrap_or(url.len());
    &url[..end]
}
