use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use super::{Recording, RecordingSource};
use crate::config::SourceConfig;
use crate::utils::http_client::build_client;
use crate::{Error, Result};

/// Upper bound on followed `next` links in one listing.
const MAX_PAGES: usize = 1000;

#[derive(Debug, Deserialize)]
struct RecordingPage {
    #[serde(default)]
    results: Vec<serde_json::Value>,
    #[serde(default)]
    next: Option<String>,
}

/// Recording source speaking the paginated session-recordings HTTP API.
pub struct HttpRecordingSource {
    client: Client,
    base_url: Url,
    project_id: String,
    api_key: Option<String>,
    page_size: u32,
}

impl HttpRecordingSource {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| Error::config(format!("invalid source base URL {:?}: {e}", config.base_url)))?;
        if config.project_id.trim().is_empty() {
            return Err(Error::config("source.projectId is required"));
        }
        Ok(Self {
            client: build_client(Duration::from_secs(config.request_timeout_secs))?,
            base_url,
            project_id: config.project_id.clone(),
            api_key: config.api_key.clone(),
            page_size: config.page_size.max(1),
        })
    }

    fn endpoint(&self, tail: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| Error::config("source base URL cannot be a base"))?;
            segments.pop_if_empty();
            segments.extend(["api", "projects", self.project_id.as_str(), "session_recordings"]);
            segments.extend(tail);
        }
        Ok(url)
    }

    fn listing_url(&self, date_from: DateTime<Utc>) -> Result<Url> {
        let mut url = self.endpoint(&[])?;
        url.query_pairs_mut()
            .append_pair(
                "date_from",
                &date_from.to_rfc3339_opts(SecondsFormat::Secs, true),
            )
            .append_pair("limit", &self.page_size.to_string());
        Ok(url)
    }

    fn request(&self, url: Url) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn get_checked(&self, url: Url) -> Result<reqwest::Response> {
        let response = self.request(url.clone()).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!("Recording source request failed: {} - {}", status, body);
            return Err(Error::Source(format!("GET {} failed: {} - {}", url.path(), status, body)));
        }
        Ok(response)
    }
}

#[async_trait]
impl RecordingSource for HttpRecordingSource {
    async fn list_recordings(&self, date_from: DateTime<Utc>) -> Result<Vec<Recording>> {
        let mut recordings = Vec::new();
        let mut seen = HashSet::new();
        let mut next = Some(self.listing_url(date_from)?);

        while let Some(url) = next.take() {
            if !seen.insert(url.to_string()) {
                warn!(url = %url, "Pagination loop detected, stopping");
                break;
            }
            if seen.len() > MAX_PAGES {
                warn!(pages = MAX_PAGES, "Page limit reached, stopping");
                break;
            }

            let page: RecordingPage = self.get_checked(url).await?.json().await?;
            for item in page.results {
                match serde_json::from_value::<Recording>(item) {
                    Ok(recording) => recordings.push(recording),
                    Err(e) => warn!(error = %e, "Skipping undecodable recording"),
                }
            }

            next = match page.next.filter(|n| !n.is_empty()) {
                Some(link) => Some(
                    self.base_url
                        .join(&link)
                        .map_err(|e| Error::Source(format!("invalid next link {link:?}: {e}")))?,
                ),
                None => None,
            };
        }

        debug!(count = recordings.len(), pages = seen.len(), "Listed recordings");
        Ok(recordings)
    }

    async fn fetch_events(&self, session_id: &str) -> Result<String> {
        let url = self.endpoint(&[session_id, "snapshots"])?;
        let body = self.get_checked(url).await?.text().await?;
        debug!(session_id, bytes = body.len(), "Fetched recording events");
        Ok(body)
    }
}
