//! Scrape collaborator contracts, the Apify and fixture clients, and record normalization.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use leadm_core::{FailureKind, Lead};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, info_span, Instrument};

pub const CRATE_NAME: &str = "leadm-adapters";

pub const DEFAULT_ACTOR_ID: &str = "compass/crawler-google-places";
pub const DEFAULT_LANGUAGE: &str = "fr";
pub const MIN_RESULTS: u32 = 1;
pub const MAX_RESULTS: u32 = 200;
const HISTORY_FALLBACK_LABEL: &str = "Search";
const RUN_WAIT_SECS: &str = "60";

/// Input for one directory search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeRequest {
    pub query: String,
    pub max_results: u32,
    pub language: String,
}

impl ScrapeRequest {
    /// Trims the query and clamps the result count into `1..=200`.
    pub fn new(query: &str, max_results: u32, language: &str) -> Self {
        Self {
            query: query.trim().to_string(),
            max_results: max_results.clamp(MIN_RESULTS, MAX_RESULTS),
            language: language.to_string(),
        }
    }

    pub fn actor_input(&self) -> JsonValue {
        serde_json::json!({
            "searchStringsArray": [self.query],
            "maxCrawledPlacesPerSearch": self.max_results,
            "language": self.language,
        })
    }
}

/// Handle of a finished scrape job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeRun {
    pub run_id: String,
    pub dataset_id: String,
}

/// A previously completed run that can be reloaded without scraping again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub label: String,
    pub dataset_id: String,
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("scraping is not configured: {0}")]
    NotConfigured(String),
    #[error("dataset \"{0}\" not found")]
    NotFound(String),
    #[error("scrape run {run_id} finished with status {status}")]
    RunFailed { run_id: String, status: String },
    #[error("scrape request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("scrape API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("unexpected scrape response: {0}")]
    InvalidResponse(String),
}

impl ScrapeError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ScrapeError::NotConfigured(_) => FailureKind::NotConfigured,
            ScrapeError::NotFound(_) => FailureKind::NotFound,
            _ => FailureKind::Upstream,
        }
    }
}

#[async_trait]
pub trait ScrapeClient: Send + Sync {
    fn client_id(&self) -> &'static str;

    /// Starts a search and waits until the job has finished.
    async fn run_search(&self, request: &ScrapeRequest) -> Result<ScrapeRun, ScrapeError>;

    /// Raw items of a dataset, exactly as the collaborator produced them.
    async fn dataset_items(&self, dataset_id: &str) -> Result<Vec<JsonValue>, ScrapeError>;

    /// Most recent successful runs, newest first.
    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunSummary>, ScrapeError>;
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn json_text(item: &JsonValue, key: &str) -> Option<String> {
    match item.get(key)? {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_first_text(item: &JsonValue, key: &str) -> Option<String> {
    item.get(key)?.as_array()?.first()?.as_str().and_then(text_or_none)
}

fn json_f64(item: &JsonValue, key: &str) -> Option<f64> {
    match item.get(key)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().replace(',', ".").parse().ok(),
        _ => None,
    }
}

fn json_u64(item: &JsonValue, key: &str) -> Option<u64> {
    match item.get(key)? {
        JsonValue::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Projects one raw directory item onto the canonical [`Lead`].
///
/// Phone falls back from `phone` to `phoneNumber`, email from `email` to the
/// first entry of `emails`. Empty strings become `None`; unknown keys are dropped.
pub fn normalize_item(item: &JsonValue) -> Lead {
    Lead {
        title: json_text(item, "title"),
        address: json_text(item, "address"),
        phone: json_text(item, "phone").or_else(|| json_text(item, "phoneNumber")),
        email: json_text(item, "email").or_else(|| json_first_text(item, "emails")),
        website: json_text(item, "website"),
        rating: json_f64(item, "totalScore"),
        review_count: json_u64(item, "reviewsCount"),
        source_url: json_text(item, "url"),
    }
}

pub fn normalize_items(items: &[JsonValue]) -> Vec<Lead> {
    items.iter().map(normalize_item).collect()
}

/// `"<first search string> (<YYYY-MM-DD>)"` for a run listing entry.
pub fn history_label(run: &JsonValue) -> String {
    let term = run
        .pointer("/input/searchStringsArray/0")
        .and_then(|v| v.as_str())
        .and_then(text_or_none)
        .unwrap_or_else(|| HISTORY_FALLBACK_LABEL.to_string());
    let started = run
        .get("startedAt")
        .and_then(|v| v.as_str())
        .map(|s| s.chars().take(10).collect::<String>())
        .unwrap_or_default();
    format!("{term} ({started})")
}

/// Keeps only `SUCCEEDED` runs with a dataset, preserving listing order.
pub fn parse_run_listing(body: &JsonValue) -> Vec<RunSummary> {
    body.pointer("/data/items")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter(|run| run.get("status").and_then(|s| s.as_str()) == Some("SUCCEEDED"))
                .filter_map(|run| {
                    Some(RunSummary {
                        run_id: run.get("id")?.as_str()?.to_string(),
                        dataset_id: run.get("defaultDatasetId")?.as_str()?.to_string(),
                        label: history_label(run),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone, Deserialize)]
struct RunEnvelope {
    data: RunData,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunData {
    id: String,
    status: String,
    default_dataset_id: Option<String>,
}

fn is_terminal_status(status: &str) -> bool {
    !matches!(status, "READY" | "RUNNING")
}

/// Apify actor client. Authenticates with a bearer API token.
#[derive(Debug, Clone)]
pub struct ApifyClient {
    http: reqwest::Client,
    token: String,
    actor_id: String,
    base_url: String,
}

impl ApifyClient {
    pub fn new(http: reqwest::Client, token: impl Into<String>, actor_id: impl Into<String>) -> Self {
        Self {
            http,
            token: token.into(),
            actor_id: actor_id.into(),
            base_url: "https://api.apify.com".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Actor ids use `~` instead of `/` in API paths.
    fn actor_path(&self) -> String {
        self.actor_id.replace('/', "~")
    }

    async fn send_json(
        &self,
        request: reqwest::RequestBuilder,
        resource: &str,
    ) -> Result<JsonValue, ScrapeError> {
        let resp = request.bearer_auth(&self.token).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if status == StatusCode::NOT_FOUND {
            return Err(ScrapeError::NotFound(resource.to_string()));
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(ScrapeError::NotConfigured(format!(
                "API token rejected: {}",
                apify_error_message(&text)
            )));
        }
        if !status.is_success() {
            return Err(ScrapeError::Api {
                status: status.as_u16(),
                message: apify_error_message(&text),
            });
        }
        serde_json::from_str(&text).map_err(|e| ScrapeError::InvalidResponse(e.to_string()))
    }

    async fn run_to_completion(&self, request: &ScrapeRequest) -> Result<ScrapeRun, ScrapeError> {
        let start = self
            .http
            .post(format!("{}/v2/acts/{}/runs", self.base_url, self.actor_path()))
            .query(&[("waitForFinish", RUN_WAIT_SECS)])
            .json(&request.actor_input());
        let mut run = Self::parse_run(self.send_json(start, &self.actor_id).await?)?;
        info!(run_id = %run.id, status = %run.status, "scrape run started");

        // The server holds each poll open for up to RUN_WAIT_SECS.
        while !is_terminal_status(&run.status) {
            let poll = self
                .http
                .get(format!("{}/v2/actor-runs/{}", self.base_url, run.id))
                .query(&[("waitForFinish", RUN_WAIT_SECS)]);
            run = Self::parse_run(self.send_json(poll, &run.id).await?)?;
        }

        if run.status != "SUCCEEDED" {
            return Err(ScrapeError::RunFailed {
                run_id: run.id,
                status: run.status,
            });
        }
        let dataset_id = run.default_dataset_id.ok_or_else(|| {
            ScrapeError::InvalidResponse(format!("run {} has no default dataset", run.id))
        })?;
        info!(run_id = %run.id, %dataset_id, "scrape run finished");
        Ok(ScrapeRun {
            run_id: run.id,
            dataset_id,
        })
    }

    fn parse_run(body: JsonValue) -> Result<RunData, ScrapeError> {
        serde_json::from_value::<RunEnvelope>(body)
            .map(|e| e.data)
            .map_err(|e| ScrapeError::InvalidResponse(format!("run payload: {e}")))
    }
}

fn apify_error_message(body: &str) -> String {
    serde_json::from_str::<JsonValue>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(ToString::to_string)
        })
        .unwrap_or_else(|| body.chars().take(300).collect())
}

#[async_trait]
impl ScrapeClient for ApifyClient {
    fn client_id(&self) -> &'static str {
        "apify"
    }

    async fn run_search(&self, request: &ScrapeRequest) -> Result<ScrapeRun, ScrapeError> {
        let span = info_span!("scrape_run", actor = %self.actor_id, query = %request.query);
        self.run_to_completion(request).instrument(span).await
    }

    async fn dataset_items(&self, dataset_id: &str) -> Result<Vec<JsonValue>, ScrapeError> {
        let request = self
            .http
            .get(format!("{}/v2/datasets/{}/items", self.base_url, dataset_id))
            .query(&[("clean", "true"), ("format", "json")]);
        match self.send_json(request, dataset_id).await? {
            JsonValue::Array(items) => Ok(items),
            other => Err(ScrapeError::InvalidResponse(format!(
                "dataset {dataset_id} is not a JSON array: {}",
                other.to_string().chars().take(120).collect::<String>()
            ))),
        }
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunSummary>, ScrapeError> {
        let limit = limit.to_string();
        let request = self
            .http
            .get(format!("{}/v2/acts/{}/runs", self.base_url, self.actor_path()))
            .query(&[("limit", limit.as_str()), ("desc", "true")]);
        let body = self.send_json(request, &self.actor_id).await?;
        Ok(parse_run_listing(&body))
    }
}

/// Serves recorded datasets from memory. A search matches the dataset whose id
/// equals the slugified query.
#[derive(Debug, Clone, Default)]
pub struct FixtureScrapeClient {
    datasets: BTreeMap<String, Vec<JsonValue>>,
}

impl FixtureScrapeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset(mut self, dataset_id: &str, items: Vec<JsonValue>) -> Self {
        self.datasets.insert(dataset_id.to_string(), items);
        self
    }

    /// Loads every `<dataset_id>.json` file (a JSON array of items) in `dir`.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut client = Self::new();
        let entries = fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let data = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
            let items: Vec<JsonValue> =
                serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))?;
            client.datasets.insert(stem.to_string(), items);
        }
        Ok(client)
    }

    pub fn dataset_for_query(query: &str) -> String {
        query
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '-' })
            .collect::<String>()
            .split('-')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("-")
    }
}

#[async_trait]
impl ScrapeClient for FixtureScrapeClient {
    fn client_id(&self) -> &'static str {
        "fixtures"
    }

    async fn run_search(&self, request: &ScrapeRequest) -> Result<ScrapeRun, ScrapeError> {
        let dataset_id = Self::dataset_for_query(&request.query);
        if !self.datasets.contains_key(&dataset_id) {
            return Err(ScrapeError::NotFound(dataset_id));
        }
        Ok(ScrapeRun {
            run_id: format!("fixture-{dataset_id}"),
            dataset_id,
        })
    }

    async fn dataset_items(&self, dataset_id: &str) -> Result<Vec<JsonValue>, ScrapeError> {
        self.datasets
            .get(dataset_id)
            .cloned()
            .ok_or_else(|| ScrapeError::NotFound(dataset_id.to_string()))
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunSummary>, ScrapeError> {
        Ok(self
            .datasets
            .keys()
            .take(limit)
            .map(|id| RunSummary {
                run_id: format!("fixture-{id}"),
                label: format!("{id} (fixture)"),
                dataset_id: id.clone(),
            })
            .collect())
    }
}
