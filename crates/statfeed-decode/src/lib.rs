//! Strict payload decoding, validation and content fingerprints.
//!
//! A payload is accepted whole or rejected whole: one bad element fails the
//! entire decode so a short write never happens against corrupted input.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use statfeed_core::{
    ConflictPolicy, Counters, FeedConfig, FeedShape, Fingerprint, NaturalKey, Record,
    COUNTER_COLUMNS,
};
use thiserror::Error;

pub const CRATE_NAME: &str = "statfeed-decode";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("expected a JSON {expected}, found {found}")]
    UnexpectedShape {
        expected: &'static str,
        found: &'static str,
    },
    #[error("element {index}: {source}")]
    InvalidElement {
        index: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("element {index}: missing region identifier")]
    MissingRegion { index: usize },
    #[error("element {index}: missing fingerprint")]
    MissingFingerprint { index: usize },
    #[error("element {index}: missing observation date")]
    MissingDate { index: usize },
    #[error("element {index}: invalid observation date {value}")]
    InvalidDate { index: usize, value: String },
    #[error("element {index}: counter {field} is negative ({value})")]
    NegativeCounter {
        index: usize,
        field: &'static str,
        value: i64,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireDate {
    Compact(u32),
    Iso(NaiveDate),
}

/// Upstream element layout. Unknown keys are ignored; absent counters stay `None`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireRecord {
    state: Option<String>,
    region: Option<String>,
    date: Option<WireDate>,
    positive: Option<i64>,
    negative: Option<i64>,
    pending: Option<i64>,
    hospitalized_currently: Option<i64>,
    hospitalized_cumulative: Option<i64>,
    in_icu_currently: Option<i64>,
    in_icu_cumulative: Option<i64>,
    on_ventilator_currently: Option<i64>,
    on_ventilator_cumulative: Option<i64>,
    recovered: Option<i64>,
    death: Option<i64>,
    hospitalized: Option<i64>,
    total_test_results: Option<i64>,
    positive_increase: Option<i64>,
    negative_increase: Option<i64>,
    death_increase: Option<i64>,
    hospitalized_increase: Option<i64>,
    total_test_results_increase: Option<i64>,
    hash: Option<String>,
    fingerprint: Option<String>,
    last_modified: Option<DateTime<Utc>>,
    date_modified: Option<DateTime<Utc>>,
    date_checked: Option<DateTime<Utc>>,
}

impl WireRecord {
    fn counters(&self) -> Counters {
        Counters {
            positive: self.positive,
            negative: self.negative,
            pending: self.pending,
            hospitalized_currently: self.hospitalized_currently,
            hospitalized_cumulative: self.hospitalized_cumulative,
            in_icu_currently: self.in_icu_currently,
            in_icu_cumulative: self.in_icu_cumulative,
            on_ventilator_currently: self.on_ventilator_currently,
            on_ventilator_cumulative: self.on_ventilator_cumulative,
            recovered: self.recovered,
            death: self.death,
            hospitalized: self.hospitalized,
            total_test_results: self.total_test_results,
            positive_increase: self.positive_increase,
            negative_increase: self.negative_increase,
            death_increase: self.death_increase,
            hospitalized_increase: self.hospitalized_increase,
            total_test_results_increase: self.total_test_results_increase,
        }
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_date(index: usize, raw: WireDate) -> Result<NaiveDate, DecodeError> {
    match raw {
        WireDate::Iso(date) => Ok(date),
        WireDate::Compact(value) => {
            let (year, month, day) = (value / 10_000, (value / 100) % 100, value % 100);
            NaiveDate::from_ymd_opt(year as i32, month, day).ok_or(DecodeError::InvalidDate {
                index,
                value: value.to_string(),
            })
        }
    }
}

/// Stable fingerprint over (region, date, counter values); `None` hashes differently from 0.
pub fn content_fingerprint(region: &str, date: Option<NaiveDate>, counters: &Counters) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(region.as_bytes());
    hasher.update(b"|");
    match date {
        Some(date) => hasher.update(date.format("%Y%m%d").to_string().as_bytes()),
        None => hasher.update(b"current"),
    }
    for (column, value) in COUNTER_COLUMNS.iter().zip(counters.values()) {
        hasher.update(b"|");
        hasher.update(column.column.as_bytes());
        hasher.update(b"=");
        match value {
            Some(v) => hasher.update(v.to_string().as_bytes()),
            None => hasher.update(b"null"),
        }
    }
    let digest = hex::encode(hasher.finalize());
    Fingerprint::new(digest).unwrap_or_else(|| unreachable!("sha256 hex digest is never empty"))
}

fn validate(index: usize, wire: WireRecord, feed: &FeedConfig) -> Result<Record, DecodeError> {
    let counters = wire.counters();
    for (column, value) in COUNTER_COLUMNS.iter().zip(counters.values()) {
        if let Some(value) = value {
            if value < 0 && !column.delta {
                return Err(DecodeError::NegativeCounter {
                    index,
                    field: column.json_key,
                    value,
                });
            }
        }
    }

    let region = non_blank(wire.state).or_else(|| non_blank(wire.region));
    let region = match (&feed.policy, region) {
        (_, Some(region)) => region,
        (ConflictPolicy::UpsertByNaturalKey(NaturalKey::Singleton(label)), None) => label.clone(),
        (_, None) => return Err(DecodeError::MissingRegion { index }),
    };

    let date = wire.date.map(|d| parse_date(index, d)).transpose()?;
    if feed.policy.is_historical() && date.is_none() {
        return Err(DecodeError::MissingDate { index });
    }

    let supplied = non_blank(wire.hash)
        .or_else(|| non_blank(wire.fingerprint))
        .and_then(Fingerprint::new);
    let fingerprint = match supplied {
        Some(fp) => fp,
        None if feed.policy.is_historical() => {
            return Err(DecodeError::MissingFingerprint { index })
        }
        None => content_fingerprint(&region, date, &counters),
    };

    Ok(Record {
        region,
        date,
        counters,
        fingerprint,
        last_modified: wire.last_modified.or(wire.date_modified),
        date_checked: wire.date_checked,
    })
}

/// Decode a raw payload into records for `feed`, rejecting the whole payload on any error.
pub fn decode(bytes: &[u8], feed: &FeedConfig) -> Result<Vec<Record>, DecodeError> {
    let root: JsonValue = serde_json::from_slice(bytes).map_err(DecodeError::InvalidJson)?;

    let elements = match (feed.shape, root) {
        (FeedShape::Array, JsonValue::Array(items)) => items,
        (FeedShape::Object, value @ JsonValue::Object(_)) => vec![value],
        // The national endpoint serves its single object wrapped in a one-element array.
        (FeedShape::Object, JsonValue::Array(items)) if items.len() == 1 => items,
        (FeedShape::Array, other) => {
            return Err(DecodeError::UnexpectedShape {
                expected: "array",
                found: json_kind(&other),
            })
        }
        (FeedShape::Object, other) => {
            return Err(DecodeError::UnexpectedShape {
                expected: "object",
                found: json_kind(&other),
            })
        }
    };

    elements
        .into_iter()
        .enumerate()
        .map(|(index, element)| {
            if !element.is_object() {
                return Err(DecodeError::UnexpectedShape {
                    expected: "object",
                    found: json_kind(&element),
                });
            }
            let wire: WireRecord = serde_json::from_value(element)
                .map_err(|source| DecodeError::InvalidElement { index, source })?;
            validate(index, wire, feed)
        })
        .collect()
}
