//! Spreadsheet store collaborators, HTTP client setup and CSV export files for Lead Machine.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use leadm_core::{FailureKind, Lead};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadm-storage";

pub const SHEETS_SCOPES: &str =
    "https://www.googleapis.com/auth/spreadsheets https://www.googleapis.com/auth/drive";
const JWT_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const SPREADSHEET_MIME: &str = "application/vnd.google-apps.spreadsheet";

/// Shared reqwest setup for every collaborator client.
///
/// No request timeout is applied unless one is configured explicitly.
#[derive(Debug, Clone, Default)]
pub struct HttpClientConfig {
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
}

pub fn build_http_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().gzip(true).brotli(true);
    if let Some(timeout) = config.timeout {
        builder = builder.timeout(timeout);
    }
    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    builder.build().context("building reqwest client")
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("spreadsheet store is not configured: {0}")]
    NotConfigured(String),
    #[error("invalid spreadsheet credentials: {0}")]
    Credentials(String),
    #[error("spreadsheet \"{0}\" not found; check the name and sharing permissions")]
    NotFound(String),
    #[error("column \"{0}\" is missing from the sheet header")]
    MissingColumn(String),
    #[error("invalid cell position row={row} col={col}")]
    InvalidCell { row: usize, col: usize },
    #[error("invalid endpoint url: {0}")]
    Endpoint(String),
    #[error("spreadsheet request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("spreadsheet API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("unexpected spreadsheet response: {0}")]
    InvalidResponse(String),
}

impl StoreError {
    pub fn kind(&self) -> FailureKind {
        match self {
            StoreError::NotConfigured(_) | StoreError::Credentials(_) => FailureKind::NotConfigured,
            StoreError::NotFound(_) => FailureKind::NotFound,
            _ => FailureKind::Upstream,
        }
    }
}

/// One worksheet of a spreadsheet. Rows and columns are 1-indexed.
#[async_trait]
pub trait Worksheet: Send + Sync {
    async fn read_all_values(&self) -> Result<Vec<Vec<String>>, StoreError>;

    async fn append_row(&self, row: Vec<String>) -> Result<(), StoreError>;

    async fn append_rows(&self, rows: Vec<Vec<String>>) -> Result<(), StoreError>;

    async fn update_cell(&self, row: usize, col: usize, value: &str) -> Result<(), StoreError>;
}

/// Opens worksheets by human-readable spreadsheet name.
#[async_trait]
pub trait SheetBackend: Send + Sync {
    /// Returns the first worksheet of the named spreadsheet.
    async fn open(&self, name: &str) -> Result<Box<dyn Worksheet>, StoreError>;
}

/// Converts a 1-indexed column number into A1 letters (1 → A, 27 → AA).
pub fn column_letters(col: usize) -> String {
    let mut n = col;
    let mut out = Vec::new();
    while n > 0 {
        let rem = (n - 1) % 26;
        out.push(b'A' + rem as u8);
        n = (n - 1) / 26;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

fn quoted_sheet_title(title: &str) -> String {
    format!("'{}'", title.replace('\'', "''"))
}

pub fn a1_cell(sheet_title: &str, row: usize, col: usize) -> Result<String, StoreError> {
    if row == 0 || col == 0 {
        return Err(StoreError::InvalidCell { row, col });
    }
    Ok(format!(
        "{}!{}{}",
        quoted_sheet_title(sheet_title),
        column_letters(col),
        row
    ))
}

/// Drive `files.list` query matching a spreadsheet by exact name.
pub fn drive_name_query(name: &str) -> String {
    let escaped = name.replace('\\', "\\\\").replace('\'', "\\'");
    format!("name = '{escaped}' and mimeType = '{SPREADSHEET_MIME}' and trashed = false")
}

/// Service-account key as exported from the cloud console.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

impl ServiceAccountKey {
    pub fn from_json(json: &str) -> Result<Self, StoreError> {
        let key: ServiceAccountKey =
            serde_json::from_str(json).map_err(|e| StoreError::Credentials(e.to_string()))?;
        if key.client_email.trim().is_empty() {
            return Err(StoreError::Credentials("client_email is empty".to_string()));
        }
        Ok(key)
    }
}

#[derive(Debug, Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct GoogleEndpoints {
    pub drive: String,
    pub sheets: String,
}

impl Default for GoogleEndpoints {
    fn default() -> Self {
        Self {
            drive: "https://www.googleapis.com".to_string(),
            sheets: "https://sheets.googleapis.com".to_string(),
        }
    }
}

enum TokenSource {
    ServiceAccount {
        key: ServiceAccountKey,
        signing_key: EncodingKey,
    },
    /// Caller-minted OAuth token, sent as is and never refreshed.
    Fixed(String),
}

struct GoogleApi {
    http: reqwest::Client,
    source: TokenSource,
    endpoints: GoogleEndpoints,
    token: Mutex<Option<CachedToken>>,
}

/// Google Sheets backend authenticated with a service account.
#[derive(Clone)]
pub struct GoogleSheets {
    api: Arc<GoogleApi>,
}

impl std::fmt::Debug for GoogleSheets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let client_email = match &self.api.source {
            TokenSource::ServiceAccount { key, .. } => key.client_email.as_str(),
            TokenSource::Fixed(_) => "<access token>",
        };
        f.debug_struct("GoogleSheets")
            .field("client_email", &client_email)
            .field("drive", &self.api.endpoints.drive)
            .field("sheets", &self.api.endpoints.sheets)
            .finish()
    }
}

impl GoogleSheets {
    /// Validates the credential blob up front so a malformed key disables the
    /// feature instead of failing on first use.
    pub fn from_credentials_json(
        json: &str,
        http: reqwest::Client,
        endpoints: GoogleEndpoints,
    ) -> Result<Self, StoreError> {
        let key = ServiceAccountKey::from_json(json)?;
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| StoreError::Credentials(format!("private_key: {e}")))?;
        Ok(Self::with_source(
            TokenSource::ServiceAccount { key, signing_key },
            http,
            endpoints,
        ))
    }

    /// Uses an already-minted OAuth access token, e.g. the output of
    /// `gcloud auth print-access-token`. Requests fail once it expires.
    pub fn with_access_token(
        token: &str,
        http: reqwest::Client,
        endpoints: GoogleEndpoints,
    ) -> Result<Self, StoreError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(StoreError::Credentials("access token is empty".to_string()));
        }
        Ok(Self::with_source(
            TokenSource::Fixed(token.to_string()),
            http,
            endpoints,
        ))
    }

    fn with_source(source: TokenSource, http: reqwest::Client, endpoints: GoogleEndpoints) -> Self {
        Self {
            api: Arc::new(GoogleApi {
                http,
                source,
                endpoints,
                token: Mutex::new(None),
            }),
        }
    }
}

/// Trades a signed JWT assertion for an access token at `token_uri`.
/// 400 and 401 mean the service account itself was rejected.
async fn exchange_assertion(
    http: &reqwest::Client,
    token_uri: &str,
    assertion: &str,
) -> Result<TokenResponse, StoreError> {
    let resp = http
        .post(token_uri)
        .form(&[("grant_type", JWT_GRANT_TYPE), ("assertion", assertion)])
        .send()
        .await?;
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED {
            return Err(StoreError::Credentials(format!(
                "token exchange rejected: {}",
                api_error_message(&body)
            )));
        }
        return Err(StoreError::Api {
            status: status.as_u16(),
            message: api_error_message(&body),
        });
    }
    serde_json::from_str(&body)
        .map_err(|e| StoreError::InvalidResponse(format!("token response: {e}")))
}

impl GoogleApi {
    async fn access_token(&self) -> Result<String, StoreError> {
        let (key, signing_key) = match &self.source {
            TokenSource::Fixed(token) => return Ok(token.clone()),
            TokenSource::ServiceAccount { key, signing_key } => (key, signing_key),
        };
        let mut cached = self.token.lock().await;
        let now = Utc::now();
        if let Some(token) = cached.as_ref() {
            if token.expires_at > now + chrono::Duration::seconds(60) {
                return Ok(token.value.clone());
            }
        }

        let claims = JwtClaims {
            iss: &key.client_email,
            scope: SHEETS_SCOPES,
            aud: &key.token_uri,
            iat: now.timestamp(),
            exp: (now + chrono::Duration::hours(1)).timestamp(),
        };
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, signing_key)
            .map_err(|e| StoreError::Credentials(format!("signing token request: {e}")))?;

        let parsed = exchange_assertion(&self.http, &key.token_uri, &assertion).await?;
        let token = CachedToken {
            value: parsed.access_token,
            expires_at: now + chrono::Duration::seconds(parsed.expires_in),
        };
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    /// Sends an authorized request. 403/404 map to `NotFound(resource)` because
    /// an unshared spreadsheet is indistinguishable from a missing one.
    async fn send_json(
        &self,
        request: reqwest::RequestBuilder,
        resource: &str,
    ) -> Result<JsonValue, StoreError> {
        let token = self.access_token().await?;
        let resp = request.bearer_auth(token).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if status == StatusCode::NOT_FOUND || status == StatusCode::FORBIDDEN {
            return Err(StoreError::NotFound(resource.to_string()));
        }
        if !status.is_success() {
            return Err(StoreError::Api {
                status: status.as_u16(),
                message: api_error_message(&text),
            });
        }
        if text.trim().is_empty() {
            return Ok(JsonValue::Null);
        }
        serde_json::from_str(&text).map_err(|e| StoreError::InvalidResponse(e.to_string()))
    }

    fn sheets_url(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let base = &self.endpoints.sheets;
        let mut url = Url::parse(base).map_err(|e| StoreError::Endpoint(format!("{base}: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| StoreError::Endpoint(base.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

/// Extracts `error.message` from a Google API error body, falling back to the raw text.
pub fn api_error_message(body: &str) -> String {
    serde_json::from_str::<JsonValue>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(e.get("error_description")).or(Some(e)))
                .and_then(|m| m.as_str().map(ToString::to_string))
                .or_else(|| {
                    v.get("error_description")
                        .and_then(|m| m.as_str())
                        .map(ToString::to_string)
                })
        })
        .unwrap_or_else(|| body.chars().take(300).collect())
}

impl GoogleSheets {
    async fn open_worksheet(&self, name: &str) -> Result<GoogleWorksheet, StoreError> {
        let api = &self.api;
        let query = drive_name_query(name);
        let request = api
            .http
            .get(format!("{}/drive/v3/files", api.endpoints.drive))
            .query(&[
                ("q", query.as_str()),
                ("fields", "files(id,name)"),
                ("pageSize", "1"),
                ("supportsAllDrives", "true"),
                ("includeItemsFromAllDrives", "true"),
            ]);
        let files = api.send_json(request, name).await?;
        let spreadsheet_id = files
            .get("files")
            .and_then(|f| f.as_array())
            .and_then(|f| f.first())
            .and_then(|f| f.get("id"))
            .and_then(|id| id.as_str())
            .map(ToString::to_string)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;

        let url = api.sheets_url(&["v4", "spreadsheets", spreadsheet_id.as_str()])?;
        let request = api
            .http
            .get(url)
            .query(&[("fields", "sheets.properties.title")]);
        let meta = api.send_json(request, name).await?;
        let title = meta
            .pointer("/sheets/0/properties/title")
            .and_then(|t| t.as_str())
            .map(ToString::to_string)
            .ok_or_else(|| StoreError::InvalidResponse(format!("spreadsheet {name} has no worksheets")))?;

        debug!(%spreadsheet_id, %title, "opened spreadsheet");
        Ok(GoogleWorksheet {
            api: Arc::clone(api),
            spreadsheet_id,
            title,
            name: name.to_string(),
        })
    }
}

#[async_trait]
impl SheetBackend for GoogleSheets {
    async fn open(&self, name: &str) -> Result<Box<dyn Worksheet>, StoreError> {
        let span = info_span!("sheet_open", sheet = name);
        let worksheet = self.open_worksheet(name).instrument(span).await?;
        Ok(Box::new(worksheet))
    }
}

struct GoogleWorksheet {
    api: Arc<GoogleApi>,
    spreadsheet_id: String,
    title: String,
    name: String,
}

impl GoogleWorksheet {
    fn values_url(&self, range: &str) -> Result<Url, StoreError> {
        self.api
            .sheets_url(&["v4", "spreadsheets", self.spreadsheet_id.as_str(), "values", range])
    }

    async fn append_values(&self, rows: Vec<Vec<String>>) -> Result<(), StoreError> {
        let range = format!("{}:append", quoted_sheet_title(&self.title));
        let url = self.values_url(&range)?;
        let request = self
            .api
            .http
            .post(url)
            .query(&[("valueInputOption", "RAW"), ("insertDataOption", "INSERT_ROWS")])
            .json(&serde_json::json!({ "values": rows }));
        self.api.send_json(request, &self.name).await?;
        Ok(())
    }
}

fn cell_to_string(cell: &JsonValue) -> String {
    match cell {
        JsonValue::String(s) => s.clone(),
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait]
impl Worksheet for GoogleWorksheet {
    async fn read_all_values(&self) -> Result<Vec<Vec<String>>, StoreError> {
        let url = self.values_url(&quoted_sheet_title(&self.title))?;
        let request = self
            .api
            .http
            .get(url)
            .query(&[("majorDimension", "ROWS"), ("valueRenderOption", "FORMATTED_VALUE")]);
        let body = self.api.send_json(request, &self.name).await?;
        let rows = body
            .get("values")
            .and_then(|v| v.as_array())
            .map(|rows| {
                rows.iter()
                    .map(|row| {
                        row.as_array()
                            .map(|cells| cells.iter().map(cell_to_string).collect())
                            .unwrap_or_default()
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(rows)
    }

    async fn append_row(&self, row: Vec<String>) -> Result<(), StoreError> {
        self.append_values(vec![row]).await
    }

    async fn append_rows(&self, rows: Vec<Vec<String>>) -> Result<(), StoreError> {
        self.append_values(rows).await
    }

    async fn update_cell(&self, row: usize, col: usize, value: &str) -> Result<(), StoreError> {
        let cell = a1_cell(&self.title, row, col)?;
        let url = self.values_url(&cell)?;
        let request = self
            .api
            .http
            .put(url)
            .query(&[("valueInputOption", "RAW")])
            .json(&serde_json::json!({ "values": [[value]] }));
        self.api.send_json(request, &self.name).await?;
        Ok(())
    }
}

/// Store call as recorded by [`InMemorySheets`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SheetCall {
    ReadAll,
    AppendRow { cells: usize },
    AppendRows { rows: usize },
    UpdateCell { row: usize, col: usize },
}

#[derive(Debug, Default)]
struct MemorySheet {
    values: Vec<Vec<String>>,
    calls: Vec<SheetCall>,
}

fn lock<T>(mutex: &Arc<StdMutex<T>>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Process-local spreadsheet backend; every opened handle shares the same cells.
#[derive(Debug, Clone, Default)]
pub struct InMemorySheets {
    sheets: Arc<StdMutex<HashMap<String, Arc<StdMutex<MemorySheet>>>>>,
}

impl InMemorySheets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sheet(self, name: &str, values: Vec<Vec<String>>) -> Self {
        lock(&self.sheets).insert(
            name.to_string(),
            Arc::new(StdMutex::new(MemorySheet {
                values,
                calls: Vec::new(),
            })),
        );
        self
    }

    pub fn values(&self, name: &str) -> Option<Vec<Vec<String>>> {
        let sheets = lock(&self.sheets);
        sheets.get(name).map(|s| lock(s).values.clone())
    }

    pub fn calls(&self, name: &str) -> Vec<SheetCall> {
        let sheets = lock(&self.sheets);
        sheets
            .get(name)
            .map(|s| lock(s).calls.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SheetBackend for InMemorySheets {
    async fn open(&self, name: &str) -> Result<Box<dyn Worksheet>, StoreError> {
        let sheet = lock(&self.sheets)
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        Ok(Box::new(MemoryWorksheet { sheet }))
    }
}

struct MemoryWorksheet {
    sheet: Arc<StdMutex<MemorySheet>>,
}

#[async_trait]
impl Worksheet for MemoryWorksheet {
    async fn read_all_values(&self) -> Result<Vec<Vec<String>>, StoreError> {
        let mut sheet = lock(&self.sheet);
        sheet.calls.push(SheetCall::ReadAll);
        Ok(sheet.values.clone())
    }

    async fn append_row(&self, row: Vec<String>) -> Result<(), StoreError> {
        let mut sheet = lock(&self.sheet);
        sheet.calls.push(SheetCall::AppendRow { cells: row.len() });
        sheet.values.push(row);
        Ok(())
    }

    async fn append_rows(&self, rows: Vec<Vec<String>>) -> Result<(), StoreError> {
        let mut sheet = lock(&self.sheet);
        sheet.calls.push(SheetCall::AppendRows { rows: rows.len() });
        sheet.values.extend(rows);
        Ok(())
    }

    async fn update_cell(&self, row: usize, col: usize, value: &str) -> Result<(), StoreError> {
        if row == 0 || col == 0 {
            return Err(StoreError::InvalidCell { row, col });
        }
        let mut sheet = lock(&self.sheet);
        sheet.calls.push(SheetCall::UpdateCell { row, col });
        if sheet.values.len() < row {
            sheet.values.resize_with(row, Vec::new);
        }
        let cells = &mut sheet.values[row - 1];
        if cells.len() < col {
            cells.resize(col, String::new());
        }
        cells[col - 1] = value.to_string();
        Ok(())
    }
}

pub const CSV_HEADER: [&str; 8] = [
    "title",
    "address",
    "phone",
    "email",
    "website",
    "rating",
    "review_count",
    "url",
];

pub fn write_leads_csv<W: Write>(writer: W, leads: &[Lead]) -> anyhow::Result<()> {
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(CSV_HEADER).context("writing csv header")?;
    for lead in leads {
        csv.write_record([
            lead.title.clone().unwrap_or_default(),
            lead.address.clone().unwrap_or_default(),
            lead.phone.clone().unwrap_or_default(),
            lead.email.clone().unwrap_or_default(),
            lead.website.clone().unwrap_or_default(),
            lead.rating.map(|r| r.to_string()).unwrap_or_default(),
            lead.review_count.map(|c| c.to_string()).unwrap_or_default(),
            lead.source_url.clone().unwrap_or_default(),
        ])
        .context("writing csv row")?;
    }
    csv.flush().context("flushing csv writer")?;
    Ok(())
}

pub fn leads_to_csv(leads: &[Lead]) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_leads_csv(&mut buf, leads)?;
    Ok(buf)
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredExport {
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub rows: usize,
    pub byte_size: usize,
}

/// Directory of CSV exports written with an atomic temp-file rename.
#[derive(Debug, Clone)]
pub struct ExportStore {
    root: PathBuf,
}

impl ExportStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn export_relative_path(&self, exported_at: DateTime<Utc>, label: &str) -> PathBuf {
        let stamp = exported_at.format("%Y%m%d_%H%M%S");
        let slug = slugify(label);
        let slug = if slug.is_empty() { "leads".to_string() } else { slug };
        PathBuf::from(format!("{slug}_{stamp}.csv"))
    }

    pub async fn write_csv(
        &self,
        exported_at: DateTime<Utc>,
        label: &str,
        leads: &[Lead],
    ) -> anyhow::Result<StoredExport> {
        let bytes = leads_to_csv(leads)?;
        let relative_path = self.export_relative_path(exported_at, label);
        let absolute_path = self.root.join(&relative_path);
        self.write_atomically(&absolute_path, &bytes).await?;
        Ok(StoredExport {
            relative_path,
            absolute_path,
            rows: leads.len(),
            byte_size: bytes.len(),
        })
    }

    /// Writes `bytes` to `path` through a sibling temp file and rename.
    pub async fn write_atomically(&self, path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
        let parent = path.parent().unwrap_or(self.root.as_path()).to_path_buf();
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating export directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp export file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp export file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp export file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "renaming temp export {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }
        Ok(())
    }
}

fn slugify(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}
