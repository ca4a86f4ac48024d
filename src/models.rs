use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Path segment that precedes the numeric lot id in listing URLs.
const LOT_MARKER: &str = "lot";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LotIdError {
    #[error("invalid listing url: {0}")]
    InvalidUrl(String),
    #[error("listing url has no lot segment: {0}")]
    MissingSegment(String),
    #[error("lot segment is not numeric: {0}")]
    NotNumeric(String),
}

/// Platform-assigned listing identifier, always ASCII digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct LotId(String);

impl LotId {
    pub fn from_url(url: &str) -> Result<Self, LotIdError> {
        let parsed = Url::parse(url.trim()).map_err(|_| LotIdError::InvalidUrl(url.to_string()))?;
        let mut segments = parsed
            .path_segments()
            .ok_or_else(|| LotIdError::MissingSegment(url.to_string()))?;
        segments
            .by_ref()
            .find(|segment| segment.eq_ignore_ascii_case(LOT_MARKER))
            .ok_or_else(|| LotIdError::MissingSegment(url.to_string()))?;
        let candidate = segments
            .next()
            .filter(|segment| !segment.is_empty())
            .ok_or_else(|| LotIdError::MissingSegment(url.to_string()))?;
        Self::parse(candidate)
    }

    /// Recovers the id from a lot directory name such as `81642565_2023_RAM_2500`.
    pub fn from_folder(name: &str) -> Option<Self> {
        let digits: String = name
            .chars()
            .skip_while(|ch| !ch.is_ascii_digit())
            .take_while(|ch| ch.is_ascii_digit())
            .collect();
        if digits.is_empty() {
            None
        } else {
            Some(Self(digits))
        }
    }

    pub fn parse(raw: &str) -> Result<Self, LotIdError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || !trimmed.chars().all(|ch| ch.is_ascii_digit()) {
            return Err(LotIdError::NotNumeric(raw.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Optional listing details used for folder names and the appraisal prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotHints {
    pub year: Option<String>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub mileage: Option<String>,
}

/// Filesystem-safe directory name for a lot.
///
/// Spaces become underscores one-for-one so hints that differ only in
/// whitespace never collapse onto the same directory.
pub fn lot_folder_name(id: &LotId, hints: &LotHints) -> String {
    let parts = [
        Some(id.as_str()),
        hints.year.as_deref(),
        hints.make.as_deref(),
        hints.model.as_deref(),
    ];
    let joined = parts
        .into_iter()
        .flatten()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    joined
        .trim()
        .chars()
        .filter(|ch| ch.is_alphanumeric() || matches!(ch, '_' | '-' | ' '))
        .map(|ch| if ch == ' ' { '_' } else { ch })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum EstimateVariant {
    /// Repair cost plus a low/high/average resale range.
    #[default]
    Resale,
    /// Repair cost plus a qualitative flip-worthiness evaluation.
    Flip,
}

impl EstimateVariant {
    pub fn from_str(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "resale" | "range" => Some(Self::Resale),
            "flip" | "evaluation" => Some(Self::Flip),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResaleOutlook {
    Range {
        low: f64,
        high: f64,
        average: f64,
        details: String,
    },
    Evaluation {
        score: f64,
        details: String,
    },
}

impl ResaleOutlook {
    pub fn details(&self) -> &str {
        match self {
            ResaleOutlook::Range { details, .. } | ResaleOutlook::Evaluation { details, .. } => {
                details
            }
        }
    }

    /// Resale value to persist in the store, when the variant produces one.
    pub fn resale_value(&self) -> Option<f64> {
        match self {
            ResaleOutlook::Range { average, .. } => Some(*average),
            ResaleOutlook::Evaluation { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EstimateRecord {
    pub repair_cost: f64,
    pub repair_detail: String,
    pub outlook: ResaleOutlook,
}

/// Row of the shared listing table as the pipeline reads it.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct StoreRow {
    #[serde(default, deserialize_with = "loose_string")]
    pub lot_inv_num: Option<String>,
    pub lot_url: String,
    #[serde(default, deserialize_with = "loose_string")]
    pub year: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub make: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub model: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub odometer: Option<String>,
}

impl StoreRow {
    pub fn hints(&self) -> LotHints {
        LotHints {
            year: self.year.clone(),
            make: self.make.clone(),
            model: self.model.clone(),
            mileage: self.odometer.clone(),
        }
    }
}

// Ingested spreadsheets leave numbers, floats and strings mixed in the same column.
fn loose_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Some(Value::Number(n)) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 => Some(format!("{}", f as i64)),
            _ => Some(n.to_string()),
        },
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Acquire,
    Analyze,
    Full,
    Sync,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Acquire => "acquire",
            Stage::Analyze => "analyze",
            Stage::Full => "full",
            Stage::Sync => "sync",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LotOutcome {
    Done,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub stage: Stage,
    pub total: usize,
    pub done: usize,
    pub skipped: usize,
    pub failed: usize,
    pub elapsed_ms: u128,
    pub started_at: DateTime<Utc>,
}

impl RunReport {
    pub fn new(stage: Stage) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            stage,
            total: 0,
            done: 0,
            skipped: 0,
            failed: 0,
            elapsed_ms: 0,
            started_at: Utc::now(),
        }
    }

    pub fn record(&mut self, outcome: LotOutcome) {
        self.total += 1;
        match outcome {
            LotOutcome::Done => self.done += 1,
            LotOutcome::Skipped => self.skipped += 1,
            LotOutcome::Failed => self.failed += 1,
        }
    }
}
