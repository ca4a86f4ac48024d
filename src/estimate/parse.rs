//! Recovering the appraisal object from free-form model output.
//!
//! Two stages, both pure text transforms: the fence-stripped reply is parsed
//! directly, then the span between its first `{` and last `}` is tried.
//! Each candidate is tried verbatim before single quotes are swapped for
//! double quotes.

use crate::models::{EstimateRecord, EstimateVariant, ResaleOutlook};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("malformed model response: {}", preview(raw))]
    Malformed { raw: String },
}

fn preview(raw: &str) -> String {
    const LIMIT: usize = 240;
    if raw.chars().count() <= LIMIT {
        raw.to_string()
    } else {
        format!("{}…", raw.chars().take(LIMIT).collect::<String>())
    }
}

pub fn parse_response(raw: &str) -> Result<Map<String, Value>, ParseError> {
    let stripped = strip_fence(raw);
    if let Some(object) = parse_candidate(stripped) {
        return Ok(object);
    }
    if let Some(object) = embedded_object(stripped).and_then(parse_candidate) {
        return Ok(object);
    }
    Err(ParseError::Malformed {
        raw: raw.to_string(),
    })
}

/// Removes a leading ```` ``` ```` (with optional language tag) and a trailing fence.
fn strip_fence(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        let rest = rest.trim_start_matches('`');
        let tag_len = rest
            .find(|ch: char| !ch.is_ascii_alphanumeric())
            .unwrap_or(rest.len());
        text = rest[tag_len..].trim_start();
    }
    text = text.trim_end();
    if let Some(rest) = text.strip_suffix("```") {
        text = rest.trim_end_matches('`').trim_end();
    }
    text
}

fn embedded_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn parse_candidate(candidate: &str) -> Option<Map<String, Value>> {
    parse_object(candidate).or_else(|| parse_object(&candidate.replace('\'', "\"")))
}

fn parse_object(text: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Builds the record, tolerating missing or oddly typed fields.
pub fn extract_record(object: &Map<String, Value>, variant: EstimateVariant) -> EstimateRecord {
    let repair = section(object, "repair");
    let outlook = match variant {
        EstimateVariant::Resale => {
            let resale = section(object, "resale");
            ResaleOutlook::Range {
                low: number(resale, "low"),
                high: number(resale, "high"),
                average: number(resale, "average"),
                details: text(resale, "details"),
            }
        }
        EstimateVariant::Flip => {
            let evaluation = section(object, "evaluation");
            ResaleOutlook::Evaluation {
                score: number(evaluation, "score"),
                details: text(evaluation, "details"),
            }
        }
    };
    EstimateRecord {
        repair_cost: number(repair, "estimate").max(0.0),
        repair_detail: text(repair, "details"),
        outlook,
    }
}

fn section<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a Map<String, Value>> {
    object.get(key).and_then(Value::as_object)
}

fn number(section: Option<&Map<String, Value>>, key: &str) -> f64 {
    let value = section.and_then(|s| s.get(key));
    let parsed = match value {
        Some(Value::Number(n)) => n.as_f64(),
        // Models sometimes answer "$1,250" instead of 1250.
        Some(Value::String(s)) => s
            .chars()
            .filter(|ch| ch.is_ascii_digit() || matches!(ch, '.' | '-'))
            .collect::<String>()
            .parse::<f64>()
            .ok(),
        _ => None,
    };
    parsed.filter(|n| n.is_finite()).unwrap_or(0.0)
}

fn text(section: Option<&Map<String, Value>>, key: &str) -> String {
    match section.and_then(|s| s.get(key)) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}
