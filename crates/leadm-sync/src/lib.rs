//! Dashboard actions: configuration, collaborator wiring, CRM export and the draft pass.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Local, NaiveDate, Utc};
use leadm_adapters::{
    normalize_items, ApifyClient, FixtureScrapeClient, RunSummary, ScrapeClient, ScrapeError,
    ScrapeRequest, DEFAULT_ACTOR_ID, DEFAULT_LANGUAGE, MAX_RESULTS, MIN_RESULTS,
};
use leadm_core::{
    search_records, CrmSummary, FailureKind, Lead, LeadBatch, LeadStatus, ResultsOrigin,
    SheetRecord, SheetTable, StatusBreakdown, Unavailable, COL_DRAFT_EMAIL, COL_NAME, COL_WEBSITE,
    CRM_COLUMNS, DATE_ADDED_FORMAT,
};
use leadm_storage::{
    build_http_client, ExportStore, GoogleEndpoints, GoogleSheets, HttpClientConfig,
    SheetBackend, StoreError, StoredExport, Worksheet,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "leadm-sync";

pub const DEFAULT_SHEET_NAME: &str = "prospects_database";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-flash";
pub const DRAFT_FAILED_PREFIX: &str = "[draft failed]";

const FEATURE_SCRAPING: &str = "scraping";
const FEATURE_CRM: &str = "crm";
const FEATURE_DRAFTS: &str = "drafts";

#[derive(Clone)]
pub struct AppConfig {
    pub apify_token: Option<String>,
    pub apify_actor: String,
    pub scrape_language: String,
    pub max_results: u32,
    pub history_limit: usize,
    pub fixtures_dir: Option<PathBuf>,
    pub google_credentials: Option<String>,
    /// Pre-minted OAuth token, used only when no service-account key is set.
    pub google_access_token: Option<String>,
    pub sheet_name: String,
    pub gemini_api_key: Option<String>,
    pub gemini_model: String,
    pub export_dir: PathBuf,
    pub web_port: u16,
    pub user_agent: String,
    /// Per-request timeout for outbound HTTP calls; unset means none.
    pub http_timeout: Option<Duration>,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set = |v: &Option<String>| if v.is_some() { "<set>" } else { "<unset>" };
        f.debug_struct("AppConfig")
            .field("apify_token", &set(&self.apify_token))
            .field("apify_actor", &self.apify_actor)
            .field("scrape_language", &self.scrape_language)
            .field("max_results", &self.max_results)
            .field("history_limit", &self.history_limit)
            .field("fixtures_dir", &self.fixtures_dir)
            .field("google_credentials", &set(&self.google_credentials))
            .field("google_access_token", &set(&self.google_access_token))
            .field("sheet_name", &self.sheet_name)
            .field("gemini_api_key", &set(&self.gemini_api_key))
            .field("gemini_model", &self.gemini_model)
            .field("export_dir", &self.export_dir)
            .field("web_port", &self.web_port)
            .field("user_agent", &self.user_agent)
            .field("http_timeout", &self.http_timeout)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            apify_token: get("APIFY_API_TOKEN"),
            apify_actor: get("LEADM_APIFY_ACTOR").unwrap_or_else(|| DEFAULT_ACTOR_ID.to_string()),
            scrape_language: get("LEADM_SCRAPE_LANGUAGE")
                .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
            max_results: get("LEADM_MAX_RESULTS")
                .and_then(|v| v.trim().parse::<u32>().ok())
                .unwrap_or(20)
                .clamp(MIN_RESULTS, MAX_RESULTS),
            history_limit: get("LEADM_HISTORY_LIMIT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(5),
            fixtures_dir: get("LEADM_FIXTURES_DIR").map(PathBuf::from),
            google_credentials: get("GOOGLE_CREDENTIALS"),
            google_access_token: get("GOOGLE_ACCESS_TOKEN"),
            sheet_name: get("LEADM_SHEET_NAME").unwrap_or_else(|| DEFAULT_SHEET_NAME.to_string()),
            gemini_api_key: get("GEMINI_API_KEY"),
            gemini_model: get("LEADM_GEMINI_MODEL")
                .unwrap_or_else(|| DEFAULT_GEMINI_MODEL.to_string()),
            export_dir: get("LEADM_EXPORT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./exports")),
            web_port: get("LEADM_WEB_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(8000),
            user_agent: get("LEADM_USER_AGENT").unwrap_or_else(|| "leadm/0.1".to_string()),
            http_timeout: get("LEADM_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        }
    }
}

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("text generation request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("text generation API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("text generation returned no text")]
    Empty,
    #[error("unexpected text generation response: {0}")]
    InvalidResponse(String),
}

impl GenerateError {
    pub fn kind(&self) -> FailureKind {
        match self {
            GenerateError::Api { status, .. } if *status == 401 || *status == 403 => {
                FailureKind::NotConfigured
            }
            _ => FailureKind::Upstream,
        }
    }
}

#[async_trait]
pub trait DraftGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, GenerateError>;
}

/// Gemini `generateContent` client.
#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl fmt::Debug for GeminiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiClient")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl GeminiClient {
    pub fn new(http: reqwest::Client, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http,
            api_key: api_key.into(),
            model: model.into(),
            base_url: "https://generativelanguage.googleapis.com".to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

/// Joins the text parts of the first candidate.
pub fn candidate_text(body: &JsonValue) -> Option<String> {
    let parts = body.pointer("/candidates/0/content/parts")?.as_array()?;
    let text = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect::<String>();
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

#[async_trait]
impl DraftGenerator for GeminiClient {
    async fn generate(&self, prompt: &str) -> Result<String, GenerateError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        );
        let body = serde_json::json!({ "contents": [{ "parts": [{ "text": prompt }] }] });
        let resp = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(GenerateError::Api {
                status: status.as_u16(),
                message: leadm_storage::api_error_message(&text),
            });
        }
        let value: JsonValue = serde_json::from_str(&text)
            .map_err(|e| GenerateError::InvalidResponse(e.to_string()))?;
        candidate_text(&value).ok_or(GenerateError::Empty)
    }
}

/// Builds the outreach prompt from the record's name, rating and website presence.
pub fn build_prompt(record: &SheetRecord) -> String {
    let name = record.get(COL_NAME).unwrap_or("this business");
    let rating = match record.rating() {
        Some(r) => format!("It is rated {r:.1}/5 on Google Maps."),
        None => "It has no Google Maps rating yet.".to_string(),
    };
    let website = if record.get(COL_WEBSITE).is_some() {
        "It already has a website; offer a redesign that brings in more customers."
    } else {
        "It has no website; offer to build one."
    };
    format!(
        "Write a short, friendly cold outreach email to \"{name}\", a local business. \
         {rating} {website} Keep it under 120 words, with a subject line and no placeholders."
    )
}

/// Per-feature collaborator, or the reason it is disabled.
pub type Feature<T> = std::result::Result<Arc<T>, Unavailable>;

#[derive(Clone)]
pub struct Collaborators {
    pub scrape: Feature<dyn ScrapeClient>,
    pub sheets: Feature<dyn SheetBackend>,
    pub generator: Feature<dyn DraftGenerator>,
    pub exports: ExportStore,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeatureStatus {
    pub feature: &'static str,
    pub available: bool,
    pub reason: Option<String>,
}

fn feature_status<T: ?Sized>(feature: &'static str, slot: &Feature<T>) -> FeatureStatus {
    FeatureStatus {
        feature,
        available: slot.is_ok(),
        reason: slot.as_ref().err().map(|e| e.reason.clone()),
    }
}

impl Collaborators {
    /// A missing or malformed credential disables only its own feature.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let http = build_http_client(&HttpClientConfig {
            timeout: config.http_timeout,
            user_agent: Some(config.user_agent.clone()),
        })?;

        let scrape: Feature<dyn ScrapeClient> = match (&config.fixtures_dir, &config.apify_token) {
            (Some(dir), _) => FixtureScrapeClient::from_dir(dir)
                .map(|c| Arc::new(c) as Arc<dyn ScrapeClient>)
                .map_err(|e| Unavailable::new(FEATURE_SCRAPING, format!("{e:#}"))),
            (None, Some(token)) => Ok(Arc::new(ApifyClient::new(
                http.clone(),
                token.clone(),
                config.apify_actor.clone(),
            ))),
            (None, None) => Err(Unavailable::missing_env(FEATURE_SCRAPING, "APIFY_API_TOKEN")),
        };

        let sheets: Feature<dyn SheetBackend> =
            match (&config.google_credentials, &config.google_access_token) {
                (Some(json), _) => {
                    GoogleSheets::from_credentials_json(json, http.clone(), GoogleEndpoints::default())
                        .map(|s| Arc::new(s) as Arc<dyn SheetBackend>)
                        .map_err(|e| Unavailable::new(FEATURE_CRM, e.to_string()))
                }
                (None, Some(token)) => {
                    GoogleSheets::with_access_token(token, http.clone(), GoogleEndpoints::default())
                        .map(|s| Arc::new(s) as Arc<dyn SheetBackend>)
                        .map_err(|e| Unavailable::new(FEATURE_CRM, e.to_string()))
                }
                (None, None) => Err(Unavailable::missing_env(FEATURE_CRM, "GOOGLE_CREDENTIALS")),
            };

        let generator: Feature<dyn DraftGenerator> = match &config.gemini_api_key {
            Some(key) => Ok(Arc::new(GeminiClient::new(
                http,
                key.clone(),
                config.gemini_model.clone(),
            ))),
            None => Err(Unavailable::missing_env(FEATURE_DRAFTS, "GEMINI_API_KEY")),
        };

        for status in [
            feature_status(FEATURE_SCRAPING, &scrape),
            feature_status(FEATURE_CRM, &sheets),
            feature_status(FEATURE_DRAFTS, &generator),
        ] {
            if let Some(reason) = status.reason {
                warn!(feature = status.feature, %reason, "feature disabled");
            }
        }

        Ok(Self {
            scrape,
            sheets,
            generator,
            exports: ExportStore::new(config.export_dir.clone()),
        })
    }

    pub fn availability(&self) -> Vec<FeatureStatus> {
        vec![
            feature_status(FEATURE_SCRAPING, &self.scrape),
            feature_status(FEATURE_CRM, &self.sheets),
            feature_status(FEATURE_DRAFTS, &self.generator),
        ]
    }
}

/// Records split by whether they still need a draft. Listing order is preserved.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DraftPlan {
    pub pending: Vec<SheetRecord>,
    pub drafted: Vec<SheetRecord>,
}

impl DraftPlan {
    pub fn from_records(records: Vec<SheetRecord>) -> Self {
        let (pending, drafted) = records.into_iter().partition(SheetRecord::needs_draft);
        Self { pending, drafted }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DraftProgress {
    pub completed: usize,
    pub total: usize,
    pub row: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DraftResult {
    Drafted,
    Failed { detail: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DraftOutcome {
    pub row: usize,
    pub name: Option<String>,
    pub result: DraftResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct DraftPassSummary {
    pub already_drafted: usize,
    pub outcomes: Vec<DraftOutcome>,
}

impl DraftPassSummary {
    pub fn drafted(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.result == DraftResult::Drafted)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.drafted()
    }
}

/// Drafts every record whose `DraftEmail` cell is empty, one at a time.
///
/// The sheet is read once; each draft is written back to the row captured at
/// read time, so rows inserted or removed by someone else during the pass can
/// receive the wrong draft. A generation failure is written into the cell as
/// `"[draft failed] <detail>"` and the pass moves on. A store failure aborts it.
pub async fn run_draft_pass<F>(
    sheet: &dyn Worksheet,
    generator: &dyn DraftGenerator,
    progress: F,
) -> Result<DraftPassSummary, StoreError>
where
    F: FnMut(DraftProgress) + Send,
{
    let table = SheetTable::from_values(sheet.read_all_values().await?);
    if table.is_empty() {
        return Ok(DraftPassSummary::default());
    }
    let draft_col = table
        .column_position(COL_DRAFT_EMAIL)
        .ok_or_else(|| StoreError::MissingColumn(COL_DRAFT_EMAIL.to_string()))?;

    let plan = DraftPlan::from_records(table.records);
    let span = info_span!(
        "draft_pass",
        pending = plan.pending.len(),
        already_drafted = plan.drafted.len()
    );
    draft_pending(sheet, generator, plan, draft_col, progress)
        .instrument(span)
        .await
}

async fn draft_pending<F>(
    sheet: &dyn Worksheet,
    generator: &dyn DraftGenerator,
    plan: DraftPlan,
    draft_col: usize,
    mut progress: F,
) -> Result<DraftPassSummary, StoreError>
where
    F: FnMut(DraftProgress) + Send,
{
    let total = plan.pending.len();
    let mut outcomes = Vec::with_capacity(total);
    for (idx, record) in plan.pending.iter().enumerate() {
        let (cell, result) = match generator.generate(&build_prompt(record)).await {
            Ok(text) => (text, DraftResult::Drafted),
            Err(err) => {
                warn!(row = record.row, error = %err, "draft generation failed");
                (
                    format!("{DRAFT_FAILED_PREFIX} {err}"),
                    DraftResult::Failed {
                        detail: err.to_string(),
                    },
                )
            }
        };
        sheet.update_cell(record.row, draft_col, &cell).await?;
        outcomes.push(DraftOutcome {
            row: record.row,
            name: record.get(COL_NAME).map(ToString::to_string),
            result,
        });
        progress(DraftProgress {
            completed: idx + 1,
            total,
            row: record.row,
        });
    }
    let summary = DraftPassSummary {
        already_drafted: plan.drafted.len(),
        outcomes,
    };
    info!(
        drafted = summary.drafted(),
        failed = summary.failed(),
        "draft pass finished"
    );
    Ok(summary)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportOutcome {
    pub appended: usize,
    pub header_written: bool,
    pub message: String,
}

impl ExportOutcome {
    fn new(appended: usize, header_written: bool) -> Self {
        Self {
            appended,
            header_written,
            message: format!("{appended} leads added to the database"),
        }
    }
}

/// One CRM row in `CRM_COLUMNS` order, stamped with `today` and `ToContact`.
pub fn lead_row(lead: &Lead, today: NaiveDate) -> Vec<String> {
    vec![
        lead.title.clone().unwrap_or_default(),
        lead.address.clone().unwrap_or_default(),
        lead.phone.clone().unwrap_or_default(),
        lead.email.clone().unwrap_or_default(),
        lead.website.clone().unwrap_or_default(),
        lead.rating.map(|r| r.to_string()).unwrap_or_default(),
        lead.review_count.map(|c| c.to_string()).unwrap_or_default(),
        today.format(DATE_ADDED_FORMAT).to_string(),
        LeadStatus::ToContact.as_str().to_string(),
        String::new(),
    ]
}

/// Appends `leads` to the CRM. Rows are only ever appended, so exporting the
/// same lead twice creates two rows.
pub async fn export_leads(
    sheet: &dyn Worksheet,
    leads: &[Lead],
    today: NaiveDate,
) -> Result<ExportOutcome, StoreError> {
    if leads.is_empty() {
        return Ok(ExportOutcome::new(0, false));
    }
    let existing = sheet.read_all_values().await?;
    let header_written = existing
        .iter()
        .all(|row| row.iter().all(|cell| cell.trim().is_empty()));
    if header_written {
        sheet
            .append_row(CRM_COLUMNS.iter().map(ToString::to_string).collect())
            .await?;
    }
    let rows = leads.iter().map(|lead| lead_row(lead, today)).collect();
    sheet.append_rows(rows).await?;
    info!(appended = leads.len(), header_written, "leads exported to crm");
    Ok(ExportOutcome::new(leads.len(), header_written))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Empty,
    Records(SheetTable),
}

pub async fn load_records(sheet: &dyn Worksheet) -> Result<LoadOutcome, StoreError> {
    let table = SheetTable::from_values(sheet.read_all_values().await?);
    if table.is_empty() {
        Ok(LoadOutcome::Empty)
    } else {
        Ok(LoadOutcome::Records(table))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrmView {
    pub summary: CrmSummary,
    /// Pipeline status counts over the whole table, ignoring the text filter.
    pub status_breakdown: StatusBreakdown,
    pub header: Vec<String>,
    pub records: Vec<SheetRecord>,
    pub statuses: Vec<LeadStatus>,
}

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("no results loaded; run a search or load a past run first")]
    NoResults,
    #[error(transparent)]
    Unavailable(#[from] Unavailable),
    #[error(transparent)]
    Scrape(#[from] ScrapeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("export failed: {0:#}")]
    Export(#[from] anyhow::Error),
}

impl ActionError {
    /// `None` for errors that are not collaborator failures.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            ActionError::Unavailable(_) => Some(FailureKind::NotConfigured),
            ActionError::Scrape(e) => Some(e.kind()),
            ActionError::Store(e) => Some(e.kind()),
            ActionError::InvalidInput(_) | ActionError::NoResults | ActionError::Export(_) => None,
        }
    }
}

fn feature<T: ?Sized>(slot: &Feature<T>) -> Result<&Arc<T>, Unavailable> {
    slot.as_ref().map_err(Clone::clone)
}

/// The user-triggered actions of the dashboard, shared by the web and CLI surfaces.
#[derive(Clone)]
pub struct Dashboard {
    config: AppConfig,
    collaborators: Collaborators,
}

impl Dashboard {
    pub fn new(config: AppConfig, collaborators: Collaborators) -> Self {
        Self {
            config,
            collaborators,
        }
    }

    pub fn from_env() -> Result<Self> {
        let config = AppConfig::from_env();
        let collaborators =
            Collaborators::from_config(&config).context("building collaborators")?;
        Ok(Self::new(config, collaborators))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Runs a scrape and normalizes its dataset. An empty dataset is a
    /// successful, empty batch.
    pub async fn search(
        &self,
        query: &str,
        max_results: Option<u32>,
    ) -> Result<LeadBatch, ActionError> {
        if query.trim().is_empty() {
            return Err(ActionError::InvalidInput(
                "enter a search term, e.g. \"Plombier Lyon\"".to_string(),
            ));
        }
        let scrape = feature(&self.collaborators.scrape)?;
        let request = ScrapeRequest::new(
            query,
            max_results.unwrap_or(self.config.max_results),
            &self.config.scrape_language,
        );
        let client = scrape.client_id();
        let run = scrape.run_search(&request).await?;
        let items = scrape.dataset_items(&run.dataset_id).await?;
        let leads = normalize_items(&items);
        if leads.is_empty() {
            warn!(client, query = %request.query, "search returned no results");
        } else {
            info!(client, query = %request.query, count = leads.len(), "search finished");
        }
        Ok(LeadBatch {
            origin: ResultsOrigin::Search {
                query: request.query,
            },
            leads,
            loaded_at: Utc::now(),
        })
    }

    pub async fn history(&self) -> Result<Vec<RunSummary>, ActionError> {
        let scrape = feature(&self.collaborators.scrape)?;
        let runs = scrape.recent_runs(self.config.history_limit).await?;
        info!(client = scrape.client_id(), count = runs.len(), "run history listed");
        Ok(runs)
    }

    pub async fn load_run(
        &self,
        dataset_id: &str,
        label: Option<String>,
    ) -> Result<LeadBatch, ActionError> {
        let scrape = feature(&self.collaborators.scrape)?;
        let items = scrape.dataset_items(dataset_id).await?;
        let leads = normalize_items(&items);
        info!(client = scrape.client_id(), dataset_id, count = leads.len(), "past run loaded");
        Ok(LeadBatch {
            origin: ResultsOrigin::History {
                dataset_id: dataset_id.to_string(),
                label,
            },
            leads,
            loaded_at: Utc::now(),
        })
    }

    async fn open_crm(&self) -> Result<Box<dyn Worksheet>, ActionError> {
        let sheets = feature(&self.collaborators.sheets)?;
        Ok(sheets.open(&self.config.sheet_name).await?)
    }

    pub async fn export_to_crm(&self, leads: &[Lead]) -> Result<ExportOutcome, ActionError> {
        if leads.is_empty() {
            feature(&self.collaborators.sheets)?;
            return Ok(ExportOutcome::new(0, false));
        }
        let sheet = self.open_crm().await?;
        Ok(export_leads(sheet.as_ref(), leads, Local::now().date_naive()).await?)
    }

    /// CRM table filtered by a case-insensitive search over every column.
    pub async fn crm_view(&self, query: &str) -> Result<CrmView, ActionError> {
        let sheet = self.open_crm().await?;
        let refreshed_at = Utc::now();
        let (header, records) = match load_records(sheet.as_ref()).await? {
            LoadOutcome::Empty => (Vec::new(), Vec::new()),
            LoadOutcome::Records(table) => (table.header, table.records),
        };
        Ok(CrmView {
            summary: CrmSummary::from_records(&records, refreshed_at),
            status_breakdown: StatusBreakdown::from_records(&records),
            header,
            records: search_records(&records, query),
            statuses: LeadStatus::ALL.to_vec(),
        })
    }

    pub async fn generate_drafts<F>(&self, progress: F) -> Result<DraftPassSummary, ActionError>
    where
        F: FnMut(DraftProgress) + Send,
    {
        let generator = feature(&self.collaborators.generator)?.clone();
        let sheet = self.open_crm().await?;
        Ok(run_draft_pass(sheet.as_ref(), generator.as_ref(), progress).await?)
    }

    pub async fn export_csv(&self, leads: &[Lead], label: &str) -> Result<StoredExport, ActionError> {
        let stored = self
            .collaborators
            .exports
            .write_csv(Utc::now(), label, leads)
            .await?;
        info!(path = %stored.absolute_path.display(), rows = stored.rows, "csv export written");
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leadm_storage::{InMemorySheets, SheetCall};
    use serde_json::json;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    const SHEET: &str = "prospects_database";

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    fn crm_header() -> Vec<String> {
        CRM_COLUMNS.iter().map(|c| c.to_string()).collect()
    }

    fn crm_row(name: &str, rating: &str, website: &str, draft: &str) -> Vec<String> {
        row(&[
            name, "1 rue X", "", "", website, rating, "10", "01/03/2026", "ToContact", draft,
        ])
    }

    /// Fails for names in `failing`, records every prompt it receives.
    #[derive(Default)]
    struct ScriptedGenerator {
        failing: HashSet<String>,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedGenerator {
        fn failing_for(names: &[&str]) -> Self {
            Self {
                failing: names.iter().map(|n| n.to_string()).collect(),
                prompts: Mutex::new(Vec::new()),
            }
        }

        fn prompts(&self) -> Vec<String> {
            self.prompts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DraftGenerator for ScriptedGenerator {
        async fn generate(&self, prompt: &str) -> Result<String, GenerateError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            if self.failing.iter().any(|n| prompt.contains(&format!("\"{n}\""))) {
                return Err(GenerateError::Api {
                    status: 429,
                    message: "quota exceeded".into(),
                });
            }
            Ok(format!("draft #{}", self.prompts.lock().unwrap().len()))
        }
    }

    fn test_config(dir: &std::path::Path) -> AppConfig {
        let vars: HashMap<&str, String> = HashMap::from([(
            "LEADM_EXPORT_DIR",
            dir.display().to_string(),
        )]);
        AppConfig::from_lookup(|k| vars.get(k).cloned())
    }

    fn dashboard(
        dir: &std::path::Path,
        scrape: Feature<dyn ScrapeClient>,
        sheets: Feature<dyn SheetBackend>,
        generator: Feature<dyn DraftGenerator>,
    ) -> Dashboard {
        let config = test_config(dir);
        let exports = ExportStore::new(config.export_dir.clone());
        Dashboard::new(
            config,
            Collaborators {
                scrape,
                sheets,
                generator,
                exports,
            },
        )
    }

    #[test]
    fn config_defaults_and_clamping() {
        let config = AppConfig::from_lookup(|_| None);
        assert_eq!(config.sheet_name, "prospects_database");
        assert_eq!(config.max_results, 20);
        assert_eq!(config.history_limit, 5);
        assert_eq!(config.scrape_language, "fr");
        assert_eq!(config.apify_actor, DEFAULT_ACTOR_ID);
        assert_eq!(config.web_port, 8000);
        assert!(config.apify_token.is_none());
        assert_eq!(config.http_timeout, None);

        let config = AppConfig::from_lookup(|k| match k {
            "LEADM_MAX_RESULTS" => Some("999".into()),
            "APIFY_API_TOKEN" => Some("   ".into()),
            _ => None,
        });
        assert_eq!(config.max_results, 200);
        assert!(config.apify_token.is_none());

        let config = AppConfig::from_lookup(|k| match k {
            "LEADM_HTTP_TIMEOUT_SECS" => Some(" 30 ".into()),
            _ => None,
        });
        assert_eq!(config.http_timeout, Some(Duration::from_secs(30)));
        for bad in ["0", "soon", "-5"] {
            let config = AppConfig::from_lookup(|k| {
                (k == "LEADM_HTTP_TIMEOUT_SECS").then(|| bad.to_string())
            });
            assert_eq!(config.http_timeout, None, "{bad}");
        }
    }

    #[test]
    fn configured_timeout_still_builds_every_collaborator() {
        let config = AppConfig::from_lookup(|k| match k {
            "LEADM_HTTP_TIMEOUT_SECS" => Some("5".into()),
            "APIFY_API_TOKEN" => Some("token".into()),
            "GOOGLE_ACCESS_TOKEN" => Some("ya29.secret-token".into()),
            "GEMINI_API_KEY" => Some("key".into()),
            _ => None,
        });
        let collaborators = Collaborators::from_config(&config).unwrap();
        let available: Vec<bool> = collaborators.availability().iter().map(|s| s.available).collect();
        assert_eq!(available, vec![true, true, true]);
        let debug = format!("{config:?}");
        assert!(debug.contains("http_timeout: Some(5s)"));
        assert!(!debug.contains("ya29.secret-token"));
    }

    #[test]
    fn missing_credentials_disable_only_their_feature() {
        let config = AppConfig::from_lookup(|k| match k {
            "GEMINI_API_KEY" => Some("secret-gemini-key".into()),
            "GOOGLE_CREDENTIALS" => Some("{not json".into()),
            _ => None,
        });
        let collaborators = Collaborators::from_config(&config).unwrap();
        let status = collaborators.availability();
        assert_eq!(status[0].feature, "scraping");
        assert!(!status[0].available);
        assert!(status[0].reason.as_deref().unwrap().contains("APIFY_API_TOKEN"));
        assert!(!status[1].available);
        assert!(status[2].available);
        assert!(!format!("{config:?}").contains("secret-gemini-key"));
    }

    #[test]
    fn draft_plan_partitions_preserving_order() {
        let table = SheetTable::from_values(vec![
            crm_header(),
            crm_row("A", "4.0", "", ""),
            crm_row("B", "4.0", "", "already"),
            crm_row("C", "4.0", "", "   "),
        ]);
        let plan = DraftPlan::from_records(table.records);
        let rows: Vec<usize> = plan.pending.iter().map(|r| r.row).collect();
        assert_eq!(rows, vec![2, 4]);
        assert_eq!(plan.drafted.len(), 1);
    }

    #[test]
    fn prompt_mentions_name_rating_and_website_presence() {
        let table = SheetTable::from_values(vec![
            crm_header(),
            crm_row("Café X", "4,3", "", ""),
            crm_row("Garage Y", "", "https://y.example", ""),
        ]);
        let first = build_prompt(&table.records[0]);
        assert!(first.contains("\"Café X\""));
        assert!(first.contains("4.3/5"));
        assert!(first.contains("no website"));

        let second = build_prompt(&table.records[1]);
        assert!(second.contains("no Google Maps rating"));
        assert!(second.contains("already has a website"));
    }

    #[test]
    fn candidate_text_joins_parts() {
        let body = json!({"candidates": [{"content": {"parts": [{"text": "Hello "}, {"text": "there"}]}}]});
        assert_eq!(candidate_text(&body).as_deref(), Some("Hello there"));
        assert_eq!(candidate_text(&json!({"candidates": []})), None);
    }

    #[tokio::test]
    async fn draft_pass_only_generates_for_records_without_draft() {
        let sheets = InMemorySheets::new().with_sheet(
            SHEET,
            vec![
                crm_header(),
                crm_row("A", "4.0", "", ""),
                crm_row("B", "3.0", "", "existing draft"),
                crm_row("C", "5.0", "https://c.example", ""),
                crm_row("D", "2.0", "", "another"),
            ],
        );
        let sheet = sheets.open(SHEET).await.unwrap();
        let generator = ScriptedGenerator::default();
        let mut seen = Vec::new();

        let summary = run_draft_pass(sheet.as_ref(), &generator, |p| seen.push(p))
            .await
            .unwrap();

        assert_eq!(generator.prompts().len(), 2);
        assert_eq!(summary.drafted(), 2);
        assert_eq!(summary.already_drafted, 2);
        assert_eq!(
            seen,
            vec![
                DraftProgress { completed: 1, total: 2, row: 2 },
                DraftProgress { completed: 2, total: 2, row: 4 },
            ]
        );

        let values = sheets.values(SHEET).unwrap();
        assert_eq!(values[1][9], "draft #1");
        assert_eq!(values[2][9], "existing draft");
        assert_eq!(values[3][9], "draft #2");
        assert_eq!(values[4][9], "another");

        // A second pass finds nothing left to draft.
        let again = run_draft_pass(sheet.as_ref(), &generator, |_| {}).await.unwrap();
        assert!(again.outcomes.is_empty());
        assert_eq!(generator.prompts().len(), 2);
    }

    #[tokio::test]
    async fn draft_pass_skips_blank_sheet_rows() {
        let sheets = InMemorySheets::new().with_sheet(
            SHEET,
            vec![
                crm_header(),
                crm_row("A", "4.0", "", ""),
                Vec::new(),
                crm_row("B", "4.0", "", ""),
            ],
        );
        let sheet = sheets.open(SHEET).await.unwrap();
        let generator = ScriptedGenerator::default();

        let summary = run_draft_pass(sheet.as_ref(), &generator, |_| {}).await.unwrap();

        assert_eq!(generator.prompts().len(), 2);
        assert!(generator.prompts().iter().all(|p| !p.contains("this business")));
        let rows: Vec<usize> = summary.outcomes.iter().map(|o| o.row).collect();
        assert_eq!(rows, vec![2, 4]);
        assert_eq!(
            sheets.calls(SHEET),
            vec![
                SheetCall::ReadAll,
                SheetCall::UpdateCell { row: 2, col: 10 },
                SheetCall::UpdateCell { row: 4, col: 10 },
            ]
        );
        let values = sheets.values(SHEET).unwrap();
        assert!(values[2].is_empty());
        assert_eq!(values[3][9], "draft #2");
    }

    #[tokio::test]
    async fn draft_failure_is_recorded_inline_and_pass_continues() {
        let sheets = InMemorySheets::new().with_sheet(
            SHEET,
            vec![
                crm_header(),
                crm_row("A", "4.0", "", ""),
                crm_row("B", "4.0", "", ""),
                crm_row("C", "4.0", "", ""),
            ],
        );
        let sheet = sheets.open(SHEET).await.unwrap();
        let generator = ScriptedGenerator::failing_for(&["B"]);

        let summary = run_draft_pass(sheet.as_ref(), &generator, |_| {}).await.unwrap();

        assert_eq!(generator.prompts().len(), 3);
        assert_eq!(summary.drafted(), 2);
        assert_eq!(summary.failed(), 1);
        assert!(matches!(summary.outcomes[1].result, DraftResult::Failed { .. }));
        assert_eq!(summary.outcomes[2].row, 4);

        let values = sheets.values(SHEET).unwrap();
        assert!(values[2][9].starts_with("[draft failed] "));
        assert!(values[2][9].contains("quota exceeded"));
        assert!(!values[3][9].is_empty());
    }

    #[tokio::test]
    async fn draft_pass_without_draft_column_aborts_before_generation() {
        let sheets = InMemorySheets::new().with_sheet(
            SHEET,
            vec![row(&["Name", "Rating"]), row(&["A", "4.0"])],
        );
        let sheet = sheets.open(SHEET).await.unwrap();
        let generator = ScriptedGenerator::default();

        let err = run_draft_pass(sheet.as_ref(), &generator, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::MissingColumn(ref c) if c == "DraftEmail"));
        assert!(generator.prompts().is_empty());
    }

    #[tokio::test]
    async fn export_to_empty_store_writes_header_then_one_bulk_append() {
        let sheets = InMemorySheets::new().with_sheet(SHEET, Vec::new());
        let sheet = sheets.open(SHEET).await.unwrap();
        let leads = vec![
            Lead {
                title: Some("A".into()),
                rating: Some(4.2),
                review_count: Some(8),
                ..Lead::default()
            },
            Lead {
                title: Some("B".into()),
                website: Some("https://b.example".into()),
                ..Lead::default()
            },
            Lead::default(),
        ];
        let today = NaiveDate::from_ymd_opt(2026, 3, 7).unwrap();

        let outcome = export_leads(sheet.as_ref(), &leads, today).await.unwrap();

        assert_eq!(outcome.appended, 3);
        assert!(outcome.header_written);
        assert_eq!(outcome.message, "3 leads added to the database");
        assert_eq!(
            sheets.calls(SHEET),
            vec![
                SheetCall::ReadAll,
                SheetCall::AppendRow { cells: 10 },
                SheetCall::AppendRows { rows: 3 },
            ]
        );
        let values = sheets.values(SHEET).unwrap();
        assert_eq!(values.len(), 4);
        assert_eq!(values[0], crm_header());
        assert_eq!(
            values[1],
            row(&["A", "", "", "", "", "4.2", "8", "07/03/2026", "ToContact", ""])
        );
        for data in &values[1..] {
            assert_eq!(data[7], "07/03/2026");
            assert_eq!(data[8], "ToContact");
            assert_eq!(data[9], "");
        }

        let table = SheetTable::from_values(values);
        assert_eq!(table.records.len(), 3);
        assert!(table.records.iter().all(SheetRecord::needs_draft));
    }

    #[tokio::test]
    async fn export_appends_without_header_and_duplicates_on_repeat() {
        let sheets =
            InMemorySheets::new().with_sheet(SHEET, vec![crm_header(), crm_row("A", "4.0", "", "")]);
        let sheet = sheets.open(SHEET).await.unwrap();
        let lead = Lead {
            title: Some("A".into()),
            ..Lead::default()
        };
        let today = NaiveDate::from_ymd_opt(2026, 3, 7).unwrap();

        let outcome = export_leads(sheet.as_ref(), &[lead.clone()], today).await.unwrap();
        assert!(!outcome.header_written);
        export_leads(sheet.as_ref(), &[lead], today).await.unwrap();

        assert_eq!(sheets.values(SHEET).unwrap().len(), 4);
    }

    #[tokio::test]
    async fn export_of_no_leads_makes_no_store_calls() {
        let sheets = InMemorySheets::new().with_sheet(SHEET, Vec::new());
        let sheet = sheets.open(SHEET).await.unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 3, 7).unwrap();

        let outcome = export_leads(sheet.as_ref(), &[], today).await.unwrap();
        assert_eq!(outcome.appended, 0);
        assert!(sheets.calls(SHEET).is_empty());
    }

    #[tokio::test]
    async fn load_distinguishes_empty_table_from_missing_store() {
        let sheets = InMemorySheets::new()
            .with_sheet(SHEET, vec![crm_header()])
            .with_sheet("filled", vec![crm_header(), crm_row("A", "4.0", "", "")]);

        let sheet = sheets.open(SHEET).await.unwrap();
        assert_eq!(load_records(sheet.as_ref()).await.unwrap(), LoadOutcome::Empty);

        let filled = sheets.open("filled").await.unwrap();
        match load_records(filled.as_ref()).await.unwrap() {
            LoadOutcome::Records(table) => assert_eq!(table.records[0].row, 2),
            LoadOutcome::Empty => panic!("expected records"),
        }

        let err = sheets.open("missing").await.err().unwrap();
        assert_eq!(err.kind(), FailureKind::NotFound);
        assert!(err.to_string().contains("sharing permissions"));
    }

    #[tokio::test]
    async fn dashboard_search_validates_and_normalizes() {
        let dir = tempfile::tempdir().unwrap();
        let scrape = FixtureScrapeClient::new().with_dataset(
            "plombier-lyon",
            vec![
                json!({"title": "Plomberie A", "phoneNumber": "0102030405", "website": ""}),
                json!({"title": "Plomberie B", "totalScore": 4.8}),
            ],
        );
        let dash = dashboard(
            dir.path(),
            Ok(Arc::new(scrape)),
            Err(Unavailable::missing_env("crm", "GOOGLE_CREDENTIALS")),
            Err(Unavailable::missing_env("drafts", "GEMINI_API_KEY")),
        );

        let err = dash.search("   ", None).await.unwrap_err();
        assert!(matches!(err, ActionError::InvalidInput(_)));
        assert_eq!(err.kind(), None);

        let batch = dash.search("Plombier Lyon", Some(10)).await.unwrap();
        assert_eq!(batch.leads.len(), 2);
        assert_eq!(batch.leads[0].phone.as_deref(), Some("0102030405"));
        assert_eq!(
            batch.origin,
            ResultsOrigin::Search {
                query: "Plombier Lyon".into()
            }
        );

        let err = dash.load_run("nope", None).await.unwrap_err();
        assert_eq!(err.kind(), Some(FailureKind::NotFound));

        let err = dash.export_to_crm(&batch.leads).await.unwrap_err();
        assert_eq!(err.kind(), Some(FailureKind::NotConfigured));
        assert!(err.to_string().contains("GOOGLE_CREDENTIALS"));
    }

    #[tokio::test]
    async fn dashboard_crm_view_and_drafts() {
        let dir = tempfile::tempdir().unwrap();
        let sheets = InMemorySheets::new().with_sheet(
            SHEET,
            vec![
                crm_header(),
                crm_row("Boulangerie Paul", "4.0", "", ""),
                crm_row("Garage Martin", "n/a", "", "done"),
                row(&["Cafe Z", "", "", "", "", "4.0", "", "", "Signed", "sent"]),
                row(&["Hotel W", "", "", "", "", "4.0", "", "", "Someday", "sent"]),
            ],
        );
        let dash = dashboard(
            dir.path(),
            Err(Unavailable::missing_env("scraping", "APIFY_API_TOKEN")),
            Ok(Arc::new(sheets.clone())),
            Ok(Arc::new(ScriptedGenerator::default())),
        );

        let view = dash.crm_view("GARAGE").await.unwrap();
        assert_eq!(view.summary.total_leads, 4);
        assert!((view.summary.average_rating - 3.0).abs() < f64::EPSILON);
        assert_eq!(view.records.len(), 1);
        assert_eq!(view.statuses.len(), 5);
        assert_eq!(view.status_breakdown.count(LeadStatus::ToContact), 2);
        assert_eq!(view.status_breakdown.count(LeadStatus::Signed), 1);
        assert_eq!(view.status_breakdown.unrecognized, 1);

        let summary = dash.generate_drafts(|_| {}).await.unwrap();
        assert_eq!(summary.drafted(), 1);
        assert_eq!(sheets.values(SHEET).unwrap()[1][9], "draft #1");
    }

    #[tokio::test]
    async fn dashboard_csv_export_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let dash = dashboard(
            dir.path(),
            Err(Unavailable::missing_env("scraping", "APIFY_API_TOKEN")),
            Err(Unavailable::missing_env("crm", "GOOGLE_CREDENTIALS")),
            Err(Unavailable::missing_env("drafts", "GEMINI_API_KEY")),
        );
        let leads = vec![Lead {
            title: Some("A".into()),
            ..Lead::default()
        }];
        let stored = dash.export_csv(&leads, "Plombier Lyon").await.unwrap();
        assert_eq!(stored.rows, 1);
        let text = std::fs::read_to_string(&stored.absolute_path).unwrap();
        assert!(text.starts_with("title,address,phone,email,website,rating,review_count,url"));
    }

    async fn serve_stub(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    /// Answers with the first prompt line echoed back, or 429 when the prompt
    /// names "Garage". Requests without the expected key get 403.
    fn gemini_router() -> axum::Router {
        axum::Router::new().route(
            "/v1beta/models/{call}",
            axum::routing::post(
                |axum::extract::Path(call): axum::extract::Path<String>,
                 headers: axum::http::HeaderMap,
                 axum::Json(body): axum::Json<JsonValue>| async move {
                    use axum::response::IntoResponse;
                    if headers.get("x-goog-api-key").and_then(|v| v.to_str().ok()) != Some("gemini-key") {
                        return (
                            axum::http::StatusCode::FORBIDDEN,
                            axum::Json(json!({"error": {"code": 403, "message": "API key not valid."}})),
                        )
                            .into_response();
                    }
                    let prompt = body["contents"][0]["parts"][0]["text"].as_str().unwrap_or_default();
                    if prompt.contains("\"Garage") {
                        return (
                            axum::http::StatusCode::TOO_MANY_REQUESTS,
                            axum::Json(json!({"error": {"code": 429, "message": "Resource has been exhausted", "status": "RESOURCE_EXHAUSTED"}})),
                        )
                            .into_response();
                    }
                    if prompt.contains("\"Silent") {
                        return axum::Json(json!({"candidates": []})).into_response();
                    }
                    axum::Json(json!({"candidates": [{"content": {"parts": [
                        {"text": format!("Subject: hello from {call}\n")},
                        {"text": "Bonjour !"},
                    ]}}]}))
                    .into_response()
                },
            ),
        )
    }

    #[tokio::test]
    async fn gemini_client_maps_success_and_error_responses() {
        let base = serve_stub(gemini_router()).await;
        let client = GeminiClient::new(reqwest::Client::new(), "gemini-key", DEFAULT_GEMINI_MODEL)
            .with_base_url(format!("{base}/"));

        let text = client.generate("email to \"Cafe X\"").await.unwrap();
        assert_eq!(text, "Subject: hello from gemini-1.5-flash:generateContent\nBonjour !");

        let err = client.generate("email to \"Garage Y\"").await.unwrap_err();
        assert!(matches!(err, GenerateError::Api { status: 429, ref message } if message == "Resource has been exhausted"));
        assert_eq!(err.kind(), FailureKind::Upstream);

        let err = client.generate("email to \"Silent Z\"").await.unwrap_err();
        assert!(matches!(err, GenerateError::Empty));

        let wrong_key = GeminiClient::new(reqwest::Client::new(), "other", DEFAULT_GEMINI_MODEL)
            .with_base_url(base);
        let err = wrong_key.generate("email to \"Cafe X\"").await.unwrap_err();
        assert!(matches!(err, GenerateError::Api { status: 403, .. }));
        assert_eq!(err.kind(), FailureKind::NotConfigured);
    }

    #[tokio::test]
    async fn draft_pass_against_gemini_records_rate_limit_inline() {
        let base = serve_stub(gemini_router()).await;
        let client = GeminiClient::new(reqwest::Client::new(), "gemini-key", DEFAULT_GEMINI_MODEL)
            .with_base_url(base);
        let sheets = InMemorySheets::new().with_sheet(
            SHEET,
            vec![
                crm_header(),
                crm_row("Cafe X", "4.0", "", ""),
                crm_row("Garage Y", "3.0", "", ""),
            ],
        );
        let sheet = sheets.open(SHEET).await.unwrap();

        let summary = run_draft_pass(sheet.as_ref(), &client, |_| {}).await.unwrap();

        assert_eq!(summary.drafted(), 1);
        assert_eq!(summary.failed(), 1);
        let values = sheets.values(SHEET).unwrap();
        assert!(values[1][9].ends_with("Bonjour !"));
        assert_eq!(
            values[2][9],
            "[draft failed] text generation API error 429: Resource has been exhausted"
        );
    }
}
