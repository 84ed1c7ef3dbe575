use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use tokio::task::JoinSet;

use crate::error::FetchError;

/// A remote list of endpoints, one per line.
#[async_trait]
pub trait EndpointSource: Send + Sync {
    fn uri(&self) -> &str;

    async fn fetch(&self, timeout: Duration) -> Result<Vec<String>, FetchError>;
}

/// Plain-text endpoint list served over HTTP(S).
pub struct HttpEndpointSource {
    client: reqwest::Client,
    uri: String,
}

impl HttpEndpointSource {
    pub fn new(uri: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), uri)
    }

    pub fn with_client(client: reqwest::Client, uri: impl Into<String>) -> Self {
        Self {
            client,
            uri: uri.into(),
        }
    }
}

#[async_trait]
impl EndpointSource for HttpEndpointSource {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn fetch(&self, timeout: Duration) -> Result<Vec<String>, FetchError> {
        let response = self
            .client
            .get(&self.uri)
            .timeout(timeout)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let body = response.text().await.map_err(classify)?;
        Ok(parse_endpoint_lines(&body))
    }
}

fn classify(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Http(e)
    }
}

/// One endpoint per non-blank line; `#` starts a comment line.
pub fn parse_endpoint_lines(body: &str) -> Vec<String> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Merged output of one fetch round, produced outside any lock.
#[derive(Debug, Default)]
pub struct FetchedEndpoints {
    pub endpoints: Vec<String>,
    pub succeeded: usize,
    pub failed_sources: Vec<String>,
}

/// Fetches every source concurrently, each bounded by `timeout`.
/// Duplicates are dropped, keeping source order.
pub async fn fetch_all(
    sources: &[Arc<dyn EndpointSource>],
    timeout: Duration,
) -> FetchedEndpoints {
    let mut tasks = JoinSet::new();
    for (index, source) in sources.iter().enumerate() {
        let source = Arc::clone(source);
        tasks.spawn(async move {
            let result = match tokio::time::timeout(timeout, source.fetch(timeout)).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Timeout),
            };
            (index, result)
        });
    }

    let mut results = Vec::with_capacity(sources.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(entry) => results.push(entry),
            Err(e) => log::error!("endpoint fetch task failed: {e}"),
        }
    }
    results.sort_by_key(|(index, _)| *index);

    let mut fetched = FetchedEndpoints::default();
    let mut seen = HashSet::new();
    let mut reported: HashSet<usize> = HashSet::new();
    for (index, result) in results {
        reported.insert(index);
        let uri = sources[index].uri();
        match result {
            Ok(lines) => {
                fetched.succeeded += 1;
                log::debug!("fetched {} endpoints from {uri}", lines.len());
                for line in lines {
                    if seen.insert(line.clone()) {
                        fetched.endpoints.push(line);
                    }
                }
            }
            Err(e) => {
                log::warn!("failed to load endpoints from {uri}: {e}");
                fetched.failed_sources.push(uri.to_string());
            }
        }
    }
    // A panicked task never reports back; count its source as failed.
    for (index, source) in sources.iter().enumerate() {
        if !reported.contains(&index) {
            fetched.failed_sources.push(source.uri().to_string());
        }
    }
    fetched
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshResult {
    /// Unique endpoints received this round.
    pub fetched: usize,
    pub failed_sources: Vec<String>,
    /// Whether the proxy list was swapped in.
    pub replaced: bool,
}

/// Proxy and tunnel endpoint lists handed out to agents.
///
/// Proxy endpoints are swapped wholesale on refresh; a round where nothing
/// arrives keeps the previous list.
pub struct EndpointCatalog {
    proxy_endpoints: Vec<String>,
    tunnel_endpoints: Vec<String>,
    refreshed_at: Option<DateTime<Utc>>,
    rng: StdRng,
}

impl EndpointCatalog {
    pub fn new(tunnel_endpoints: Vec<String>) -> Self {
        Self::with_rng(tunnel_endpoints, StdRng::from_entropy())
    }

    pub fn with_rng(tunnel_endpoints: Vec<String>, rng: StdRng) -> Self {
        Self {
            proxy_endpoints: Vec::new(),
            tunnel_endpoints,
            refreshed_at: None,
            rng,
        }
    }

    /// Fetch and swap in one call. Callers sharing the catalog behind a lock
    /// should use [`fetch_all`] and [`apply`](Self::apply) instead.
    pub async fn refresh(
        &mut self,
        sources: &[Arc<dyn EndpointSource>],
        timeout: Duration,
    ) -> RefreshResult {
        let fetched = fetch_all(sources, timeout).await;
        self.apply(fetched)
    }

    pub fn apply(&mut self, fetched: FetchedEndpoints) -> RefreshResult {
        let count = fetched.endpoints.len();
        let replaced = fetched.succeeded > 0 && count > 0;
        if replaced {
            self.proxy_endpoints = fetched.endpoints;
            self.refreshed_at = Some(Utc::now());
            log::info!("loaded {count} proxy endpoints");
        } else {
            log::warn!(
                "endpoint refresh produced nothing, keeping {} existing proxies",
                self.proxy_endpoints.len()
            );
        }
        RefreshResult {
            fetched: count,
            failed_sources: fetched.failed_sources,
            replaced,
        }
    }

    /// Up to `n` distinct proxy endpoints.
    pub fn sample(&mut self, n: usize) -> Vec<String> {
        self.proxy_endpoints
            .choose_multiple(&mut self.rng, n)
            .cloned()
            .collect()
    }

    /// Up to `n` distinct tunnel endpoints.
    pub fn sample_tunnels(&mut self, n: usize) -> Vec<String> {
        self.tunnel_endpoints
            .choose_multiple(&mut self.rng, n)
            .cloned()
            .collect()
    }

    pub fn proxy_endpoints(&self) -> &[String] {
        &self.proxy_endpoints
    }

    pub fn tunnel_endpoints(&self) -> &[String] {
        &self.tunnel_endpoints
    }

    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.refreshed_at
    }
}
