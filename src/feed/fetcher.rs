use crate::feed::parser::{parse_entries, ParseResult};
use crate::feed::source::{Source, SourceKind};
use crate::proxy::{ProxyMap, ResolvedProxy};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

const MAX_FEED_SIZE: usize = 10 * 1024 * 1024; // 10MB

/// Errors that can occur while fetching one source.
///
/// All of them are per-source: the source contributes no entries and the
/// run carries on with the rest.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, unreachable proxy, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// The configured proxy could not be used to build a client
    #[error("Invalid proxy {proxy}: {reason}")]
    Proxy { proxy: String, reason: String },
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the fetch timeout
    #[error("Request timed out")]
    Timeout,
    /// The run deadline passed before this source finished
    #[error("Cancelled: run deadline reached")]
    Cancelled,
    /// Response body or file exceeded the 10MB size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Local feed file could not be read
    #[error("Failed to read feed file: {0}")]
    Io(#[from] std::io::Error),
    /// Content could not be parsed as RSS, Atom or JSON Feed
    #[error("Parse error: {0}")]
    Parse(String),
}

/// Settings shared by every fetch in a run.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Maximum number of sources fetched at once.
    pub workers: usize,
    /// Per-request timeout for remote sources.
    pub timeout: Duration,
    pub user_agent: String,
    /// Outstanding fetches are abandoned once this instant passes.
    pub deadline: Option<Instant>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            workers: 5,
            timeout: Duration::from_secs(30),
            user_agent: concat!("feedlinks/", env!("CARGO_PKG_VERSION")).to_string(),
            deadline: None,
        }
    }
}

/// A source paired with the proxies resolved for it.
#[derive(Debug, Clone)]
pub struct FetchJob {
    pub source: Source,
    pub proxy: ResolvedProxy,
}

/// Outcome of fetching and parsing one source.
#[derive(Debug)]
pub struct SourceOutcome {
    pub source: Source,
    pub result: Result<ParseResult, FetchError>,
}

/// Builds an HTTP client that routes through `proxies`.
///
/// A map with no proxies yields a client with proxying disabled entirely,
/// including proxies picked up from the environment.
pub fn build_client(
    proxies: &ProxyMap,
    user_agent: &str,
) -> Result<reqwest::Client, FetchError> {
    let mut builder = reqwest::Client::builder().user_agent(user_agent);

    if proxies.is_direct() {
        builder = builder.no_proxy();
    }
    if let Some(proxy) = &proxies.http {
        builder = builder.proxy(reqwest::Proxy::http(proxy).map_err(|e| FetchError::Proxy {
            proxy: proxy.clone(),
            reason: e.to_string(),
        })?);
    }
    if let Some(proxy) = &proxies.https {
        builder = builder.proxy(reqwest::Proxy::https(proxy).map_err(|e| FetchError::Proxy {
            proxy: proxy.clone(),
            reason: e.to_string(),
        })?);
    }

    Ok(builder.build()?)
}

/// Fetches every job with bounded concurrency.
///
/// Results come back in job order no matter which fetch finishes first, so
/// everything downstream sees sources in configuration order.
pub async fn fetch_all(jobs: Vec<FetchJob>, options: &FetchOptions) -> Vec<SourceOutcome> {
    // One client per distinct proxy map; remote jobs with the same proxies
    // share a connection pool.
    let mut clients: HashMap<ProxyMap, reqwest::Client> = HashMap::new();
    let prepared: Vec<(FetchJob, Result<Option<reqwest::Client>, FetchError>)> = jobs
        .into_iter()
        .map(|job| {
            if !matches!(job.source.kind(), SourceKind::RemoteUrl(_)) {
                return (job, Ok(None));
            }
            let client = match clients.get(&job.proxy.map) {
                Some(client) => Ok(client.clone()),
                None => build_client(&job.proxy.map, &options.user_agent).inspect(|client| {
                    clients.insert(job.proxy.map.clone(), client.clone());
                }),
            };
            (job, client.map(Some))
        })
        .collect();

    stream::iter(prepared)
        .map(|(job, client)| async move {
            if let Some(origin) = job.proxy.origin() {
                tracing::info!(
                    source = %job.source,
                    proxies = %job.proxy.map,
                    origin = %origin,
                    "Using proxies"
                );
            }

            let fetch = async {
                let client = client?;
                load_entries(&job.source, client.as_ref(), options.timeout).await
            };

            let result = match options.deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, fetch)
                    .await
                    .unwrap_or(Err(FetchError::Cancelled)),
                None => fetch.await,
            };

            SourceOutcome {
                source: job.source,
                result,
            }
        })
        .buffered(options.workers.max(1))
        .collect()
        .await
}

/// Reads one source and parses it. Relative entry links in remote feeds
/// resolve against the feed URL.
async fn load_entries(
    source: &Source,
    client: Option<&reqwest::Client>,
    timeout: Duration,
) -> Result<ParseResult, FetchError> {
    let bytes = read_source(source, client, timeout).await?;
    let base = match source.kind() {
        SourceKind::RemoteUrl(url) => Some(url),
        _ => None,
    };
    parse_entries(&bytes, base).map_err(|e| FetchError::Parse(e.to_string()))
}

async fn read_source(
    source: &Source,
    client: Option<&reqwest::Client>,
    timeout: Duration,
) -> Result<Vec<u8>, FetchError> {
    match source.kind() {
        SourceKind::RemoteUrl(url) => {
            let client = client.ok_or_else(|| FetchError::Proxy {
                proxy: String::new(),
                reason: "no HTTP client for remote source".to_string(),
            })?;
            let response = tokio::time::timeout(timeout, client.get(url.clone()).send())
                .await
                .map_err(|_| FetchError::Timeout)?
                .map_err(FetchError::Network)?;

            if !response.status().is_success() {
                return Err(FetchError::HttpStatus(response.status().as_u16()));
            }

            tokio::time::timeout(timeout, read_limited_bytes(response, MAX_FEED_SIZE))
                .await
                .map_err(|_| FetchError::Timeout)?
        }
        SourceKind::LocalPath(path) => {
            let metadata = tokio::fs::metadata(path).await?;
            if metadata.len() > MAX_FEED_SIZE as u64 {
                return Err(FetchError::ResponseTooLarge);
            }
            Ok(tokio::fs::read(path).await?)
        }
        SourceKind::LiteralContent => Ok(source.as_str().trim().as_bytes().to_vec()),
    }
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    // Fast path: check Content-Length header
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}
