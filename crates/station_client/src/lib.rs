//! HTTP client for the weather station REST API.
//!
//! Implements the coordinator's [`StationFetcher`] seam. Requests are paced
//! by a client-side limiter; HTTP 429 is reported as
//! [`FetchError::RateLimited`] so the coordinator can lower its ceiling.
//! Nothing is retried here.

pub mod rate_limit;
pub mod records;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::config::EndpointConfig;
use common::{Error, HistoricalWindow, RequestIdentity};
use refresh_core::fetch::decode_lenient;
use refresh_core::{FetchError, HistoryRequest, StationFetcher};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::rate_limit::RateLimiter;

/// Records per history page (the API maximum).
const PAGE_LIMIT: usize = 288;
/// Upper bound on history pages per request.
const MAX_PAGES: usize = 16;

#[derive(Debug, Clone)]
pub struct StationClient {
    client: reqwest::Client,
    base_url: Url,
    limiter: RateLimiter,
}

impl StationClient {
    pub fn new(cfg: &EndpointConfig) -> Result<Self, Error> {
        let base_url = Url::parse(cfg.base_url.trim_end_matches('/'))
            .map_err(|e| Error::Config(format!("invalid station API base_url {}: {e}", cfg.base_url)))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::Config(format!(
                "station API base_url cannot be a base: {}",
                cfg.base_url
            )));
        }

        let client = reqwest::Client::builder()
            .user_agent("station-monitor/0.1")
            .pool_max_idle_per_host(4)
            .timeout(std::time::Duration::from_secs(cfg.timeout_secs.max(1)))
            .build()
            .expect("failed to build station API HTTP client");

        Ok(Self {
            client,
            base_url,
            limiter: RateLimiter::per_second(cfg.requests_per_second),
        })
    }

    /// `base_url` with `segments` appended.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Paced GET returning the leniently decoded body.
    async fn get_json(
        &self,
        url: Url,
        identity: &RequestIdentity,
        extra: &[(&str, String)],
    ) -> Result<Value, FetchError> {
        self.limiter.wait().await;
        debug!("GET {} for {}", url, identity.station);

        let resp = self
            .client
            .get(url)
            .query(&[
                ("apiKey", identity.credentials.api_key.as_str()),
                ("applicationKey", identity.credentials.application_key.as_str()),
            ])
            .query(extra)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        if status.as_u16() == 429 {
            return Err(FetchError::RateLimited);
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                message: body.chars().take(500).collect(),
            });
        }
        decode_lenient(&body)
    }

    /// One page of history records ending at `end`, newest first.
    async fn history_page(
        &self,
        identity: &RequestIdentity,
        end: DateTime<Utc>,
    ) -> Result<Vec<Value>, FetchError> {
        let url = self.endpoint(&["devices", identity.station.as_str()]);
        let extra = [
            ("endDate", end.timestamp_millis().to_string()),
            ("limit", PAGE_LIMIT.to_string()),
        ];
        match self.get_json(url, identity, &extra).await? {
            Value::Array(records) => Ok(records),
            other => Err(FetchError::Parse(format!(
                "expected history array, got {}",
                kind_of(&other)
            ))),
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[async_trait]
impl StationFetcher for StationClient {
    async fn fetch_current(&self, identity: &RequestIdentity) -> Result<Value, FetchError> {
        let listing = self
            .get_json(self.endpoint(&["devices"]), identity, &[])
            .await?;
        records::select_device(listing, &identity.station)
    }

    async fn fetch_history(
        &self,
        identity: &RequestIdentity,
        request: HistoryRequest,
    ) -> Result<HistoricalWindow, FetchError> {
        let mut window = HistoricalWindow::new(
            identity.station.clone(),
            request.role,
            request.start,
            request.end,
        );

        let mut end = request.end;
        for page in 0..MAX_PAGES {
            let records = self.history_page(identity, end).await?;
            let count = records.len();
            let oldest = records::fold_records(&mut window, &records, &request);

            match oldest {
                Some(oldest) if oldest > request.start && count >= PAGE_LIMIT && oldest < end => {
                    end = oldest;
                }
                _ => {
                    debug!(
                        "{}: history complete after {} pages, {} points",
                        identity.station,
                        page + 1,
                        window.point_count()
                    );
                    break;
                }
            }
        }
        Ok(window)
    }
}
