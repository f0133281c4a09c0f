//! Core domain model for Lead Machine: leads, CRM rows, filters and session state.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "leadm-core";

/// Column order of the CRM sheet. Written once as the header row of an empty sheet.
pub const CRM_COLUMNS: [&str; 10] = [
    COL_NAME,
    COL_ADDRESS,
    COL_PHONE,
    COL_EMAIL,
    COL_WEBSITE,
    COL_RATING,
    COL_REVIEW_COUNT,
    COL_DATE_ADDED,
    COL_STATUS,
    COL_DRAFT_EMAIL,
];

pub const COL_NAME: &str = "Name";
pub const COL_ADDRESS: &str = "Address";
pub const COL_PHONE: &str = "Phone";
pub const COL_EMAIL: &str = "Email";
pub const COL_WEBSITE: &str = "Website";
pub const COL_RATING: &str = "Rating";
pub const COL_REVIEW_COUNT: &str = "ReviewCount";
pub const COL_DATE_ADDED: &str = "DateAdded";
pub const COL_STATUS: &str = "Status";
pub const COL_DRAFT_EMAIL: &str = "DraftEmail";

/// Format of the `DateAdded` cell.
pub const DATE_ADDED_FORMAT: &str = "%d/%m/%Y";

/// Ratings strictly below this value pass the "low rating" filter.
pub const LOW_RATING_THRESHOLD: f64 = 4.5;

/// Coarse classification shared by every collaborator error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NotConfigured,
    NotFound,
    Upstream,
}

/// A feature whose collaborator could not be built from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{feature} is disabled: {reason}")]
pub struct Unavailable {
    pub feature: &'static str,
    pub reason: String,
}

impl Unavailable {
    pub fn new(feature: &'static str, reason: impl Into<String>) -> Self {
        Self {
            feature,
            reason: reason.into(),
        }
    }

    pub fn missing_env(feature: &'static str, key: &str) -> Self {
        Self::new(feature, format!("{key} is not set"))
    }
}

/// Canonical business record produced by normalizing one scrape item.
///
/// Absent values are always `None`; normalization never yields `Some("")`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Lead {
    pub title: Option<String>,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub website: Option<String>,
    pub rating: Option<f64>,
    pub review_count: Option<u64>,
    pub source_url: Option<String>,
}

impl Lead {
    pub fn has_website(&self) -> bool {
        self.website
            .as_deref()
            .is_some_and(|w| !w.trim().is_empty())
    }

    pub fn is_low_rated(&self) -> bool {
        self.rating.is_some_and(|r| r < LOW_RATING_THRESHOLD)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum LeadStatus {
    #[default]
    ToContact,
    Contacted,
    MeetingScheduled,
    Signed,
    NotInterested,
}

impl LeadStatus {
    pub const ALL: [LeadStatus; 5] = [
        LeadStatus::ToContact,
        LeadStatus::Contacted,
        LeadStatus::MeetingScheduled,
        LeadStatus::Signed,
        LeadStatus::NotInterested,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LeadStatus::ToContact => "ToContact",
            LeadStatus::Contacted => "Contacted",
            LeadStatus::MeetingScheduled => "MeetingScheduled",
            LeadStatus::Signed => "Signed",
            LeadStatus::NotInterested => "NotInterested",
        }
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown lead status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for LeadStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        LeadStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| UnknownStatus(trimmed.to_string()))
    }
}

/// In-memory filters over the current scrape results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LeadFilter {
    #[serde(default)]
    pub no_website: bool,
    #[serde(default)]
    pub low_rating: bool,
}

impl LeadFilter {
    pub fn matches(&self, lead: &Lead) -> bool {
        if self.no_website && lead.has_website() {
            return false;
        }
        if self.low_rating && !lead.is_low_rated() {
            return false;
        }
        true
    }

    pub fn apply(&self, leads: &[Lead]) -> Vec<Lead> {
        leads.iter().filter(|l| self.matches(l)).cloned().collect()
    }
}

/// One data row of the CRM sheet, keyed by header name.
///
/// `row` is the 1-indexed sheet row the values were read from (the header is row 1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetRecord {
    pub row: usize,
    pub values: BTreeMap<String, String>,
}

impl SheetRecord {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.values
            .get(column)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    /// Case-insensitive substring match against every cell.
    pub fn contains_text(&self, needle: &str) -> bool {
        let needle = needle.trim().to_lowercase();
        if needle.is_empty() {
            return true;
        }
        self.values
            .values()
            .any(|v| v.to_lowercase().contains(&needle))
    }

    pub fn needs_draft(&self) -> bool {
        self.get(COL_DRAFT_EMAIL).is_none()
    }

    pub fn rating(&self) -> Option<f64> {
        self.get(COL_RATING)
            .and_then(|v| v.trim().replace(',', ".").parse::<f64>().ok())
    }

    pub fn status(&self) -> Option<LeadStatus> {
        self.get(COL_STATUS).and_then(|v| v.parse().ok())
    }
}

/// Header row plus records of the CRM sheet.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SheetTable {
    pub header: Vec<String>,
    pub records: Vec<SheetRecord>,
}

impl SheetTable {
    /// Builds a table from raw cell values; row 1 is the header, short rows pad with "".
    ///
    /// Rows whose cells are all blank are skipped; the remaining records keep
    /// the sheet row they were read from.
    pub fn from_values(values: Vec<Vec<String>>) -> Self {
        let mut rows = values.into_iter();
        let Some(header) = rows.next() else {
            return Self::default();
        };
        let header: Vec<String> = header.into_iter().map(|h| h.trim().to_string()).collect();
        let records = rows
            .enumerate()
            .filter(|(_, cells)| cells.iter().any(|c| !c.trim().is_empty()))
            .map(|(idx, cells)| {
                let mut values = BTreeMap::new();
                for (col, name) in header.iter().enumerate() {
                    if name.is_empty() {
                        continue;
                    }
                    let cell = cells.get(col).cloned().unwrap_or_default();
                    values.insert(name.clone(), cell);
                }
                SheetRecord {
                    row: idx + 2,
                    values,
                }
            })
            .collect();
        Self { header, records }
    }

    /// 1-indexed position of `column` in the header row.
    pub fn column_position(&self, column: &str) -> Option<usize> {
        self.header
            .iter()
            .position(|h| h == column)
            .map(|idx| idx + 1)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Headline figures shown above the CRM table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrmSummary {
    pub total_leads: usize,
    pub average_rating: f64,
    pub refreshed_at: DateTime<Utc>,
}

impl CrmSummary {
    /// Unparseable or missing ratings count as 0 in the average.
    pub fn from_records(records: &[SheetRecord], refreshed_at: DateTime<Utc>) -> Self {
        let total_leads = records.len();
        let sum: f64 = records.iter().map(|r| r.rating().unwrap_or(0.0)).sum();
        let average_rating = if total_leads == 0 {
            0.0
        } else {
            sum / total_leads as f64
        };
        Self {
            total_leads,
            average_rating,
            refreshed_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusCount {
    pub status: LeadStatus,
    pub count: usize,
}

/// Records per pipeline status, in [`LeadStatus::ALL`] order. Rows whose
/// status cell is blank or not one of the known values land in `unrecognized`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StatusBreakdown {
    pub counts: Vec<StatusCount>,
    pub unrecognized: usize,
}

impl StatusBreakdown {
    pub fn from_records(records: &[SheetRecord]) -> Self {
        let mut counts: Vec<StatusCount> = LeadStatus::ALL
            .iter()
            .map(|&status| StatusCount { status, count: 0 })
            .collect();
        let mut unrecognized = 0;
        for record in records {
            match record.status() {
                Some(status) => {
                    if let Some(slot) = counts.iter_mut().find(|c| c.status == status) {
                        slot.count += 1;
                    }
                }
                None => unrecognized += 1,
            }
        }
        Self {
            counts,
            unrecognized,
        }
    }

    pub fn count(&self, status: LeadStatus) -> usize {
        self.counts
            .iter()
            .find(|c| c.status == status)
            .map_or(0, |c| c.count)
    }
}

pub fn search_records(records: &[SheetRecord], needle: &str) -> Vec<SheetRecord> {
    records
        .iter()
        .filter(|r| r.contains_text(needle))
        .cloned()
        .collect()
}

/// Where the current result set came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultsOrigin {
    Search { query: String },
    History { dataset_id: String, label: Option<String> },
}

impl ResultsOrigin {
    /// Human-readable name of the result set: the search text, else the
    /// history label, else the dataset id.
    pub fn label(&self) -> &str {
        match self {
            ResultsOrigin::Search { query } => query,
            ResultsOrigin::History { dataset_id, label } => {
                label.as_deref().unwrap_or(dataset_id)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadBatch {
    pub origin: ResultsOrigin,
    pub leads: Vec<Lead>,
    pub loaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ResultsLoaded(LeadBatch),
    ResultsCleared,
}

/// Immutable snapshot of one user's dashboard session.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Session {
    results: Option<LeadBatch>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the session that follows `event`. A batch with no leads keeps the
    /// previous results, matching how an empty scrape only produces a warning.
    pub fn transition(self, event: SessionEvent) -> Self {
        match event {
            SessionEvent::ResultsLoaded(batch) if batch.leads.is_empty() => self,
            SessionEvent::ResultsLoaded(batch) => Self {
                results: Some(batch),
            },
            SessionEvent::ResultsCleared => Self { results: None },
        }
    }

    pub fn results(&self) -> Option<&LeadBatch> {
        self.results.as_ref()
    }

    pub fn visible_leads(&self, filter: &LeadFilter) -> Option<Vec<Lead>> {
        self.results.as_ref().map(|b| filter.apply(&b.leads))
    }
}
