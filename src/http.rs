//! HTTP client for the Strava v3 API.
//!
//! Blocking facade over `reqwest`: each call runs on a private
//! current-thread tokio runtime, so the sync engine stays sequential.
//! Responses are classified into [`FetchError`] variants and retried by the
//! caller's [`RetryPolicy`](crate::RetryPolicy), never here.
//!
//! Listing pages through `/athlete/activities` 200 at a time until a short
//! page. Pages already received survive a failed call, so a retried listing
//! continues from the page that failed.

use std::time::{Duration, Instant};

use log::{debug, info};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tokio::runtime::Runtime;

use crate::error::{FetchError, Result, SyncError};
use crate::sync::ActivitySource;
use crate::types::ActivityRecord;

pub const STRAVA_API_BASE: &str = "https://www.strava.com/api/v3";

/// Maximum page size accepted by the listing endpoint.
const PAGE_SIZE: usize = 200;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Body excerpt kept in error messages.
const ERROR_BODY_LIMIT: usize = 200;

/// Strava activity source authenticated with a bearer token.
pub struct StravaClient {
    client: Client,
    runtime: Runtime,
    base_url: String,
    auth_header: String,
    /// Pages collected by an unfinished listing
    listing: Vec<ActivityRecord>,
    next_page: u32,
}

impl StravaClient {
    pub fn new(access_token: &str) -> Result<Self> {
        Self::with_base_url(access_token, STRAVA_API_BASE)
    }

    /// Client against a different API root (e.g. a local mock server).
    pub fn with_base_url(access_token: &str, base_url: &str) -> Result<Self> {
        if access_token.trim().is_empty() {
            return Err(SyncError::Config {
                message: "Strava access token is empty".to_string(),
            });
        }

        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("strava-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::Config {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| SyncError::Config {
                message: format!("Failed to create tokio runtime: {}", e),
            })?;

        Ok(Self {
            client,
            runtime,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_header: format!("Bearer {}", access_token.trim()),
            listing: Vec::new(),
            next_page: 1,
        })
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> std::result::Result<T, FetchError> {
        let url = format!("{}{}", self.base_url, path);
        let start = Instant::now();

        let (status, headers, body) = self.runtime.block_on(async {
            let response = self
                .client
                .get(&url)
                .header(reqwest::header::AUTHORIZATION, &self.auth_header)
                .query(query)
                .send()
                .await
                .map_err(classify_send_error)?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.text().await.map_err(classify_send_error)?;
            Ok::<_, FetchError>((status, headers, body))
        })?;

        debug!(
            "[StravaClient] GET {} -> {} in {}ms",
            path,
            status.as_u16(),
            start.elapsed().as_millis()
        );

        if !status.is_success() {
            return Err(classify_status(status, &headers, &body));
        }

        serde_json::from_str(&body).map_err(|e| FetchError::Rejected {
            message: format!("unparseable response from {}: {}", path, e),
            status_code: Some(status.as_u16()),
        })
    }
}

impl ActivitySource for StravaClient {
    fn list_summaries(&mut self) -> std::result::Result<Vec<ActivityRecord>, FetchError> {
        loop {
            let page: Vec<ActivityRecord> = self.get_json(
                "/athlete/activities",
                &[
                    ("per_page", PAGE_SIZE.to_string()),
                    ("page", self.next_page.to_string()),
                ],
            )?;
            let short = page.len() < PAGE_SIZE;
            debug!(
                "[StravaClient] Page {}: {} activities",
                self.next_page,
                page.len()
            );
            self.listing.extend(page);
            self.next_page += 1;

            if short {
                break;
            }
        }

        let listing = std::mem::take(&mut self.listing);
        info!(
            "[StravaClient] Listed {} activities in {} pages",
            listing.len(),
            self.next_page - 1
        );
        self.next_page = 1;
        Ok(listing)
    }

    fn fetch_detail(&mut self, id: u64) -> std::result::Result<ActivityRecord, FetchError> {
        self.get_json(&format!("/activities/{}", id), &[])
    }
}

fn classify_send_error(error: reqwest::Error) -> FetchError {
    if error.is_builder() {
        return FetchError::Rejected {
            message: error.to_string(),
            status_code: None,
        };
    }
    // Timeouts, refused connections and dropped bodies are all worth a retry
    FetchError::Transient {
        message: error.to_string(),
    }
}

/// Map a non-success response onto the retry taxonomy.
fn classify_status(status: StatusCode, headers: &HeaderMap, body: &str) -> FetchError {
    let excerpt = excerpt(body);
    match status {
        StatusCode::TOO_MANY_REQUESTS => FetchError::Throttled {
            retry_after: parse_retry_after(headers),
        },
        StatusCode::UNAUTHORIZED => FetchError::AuthExpired {
            message: format!("{}: {}", status, excerpt),
        },
        s if s.is_server_error() => FetchError::Transient {
            message: format!("{}: {}", status, excerpt),
        },
        s => FetchError::Rejected {
            message: format!("{}: {}", status, excerpt),
            status_code: Some(s.as_u16()),
        },
    }
}

/// Seconds form only; HTTP-date hints fall back to the policy default.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn excerpt(body: &str) -> &str {
    let body = body.trim();
    match body.char_indices().nth(ERROR_BODY_LIMIT) {
        Some((end, _)) => &body[..end],
        None => body,
    }
}
