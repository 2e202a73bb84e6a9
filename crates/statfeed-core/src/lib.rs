//! Core record model and feed configuration types for statfeed.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "statfeed-core";

/// Content fingerprint identifying one (region, date, value-set) observation.
///
/// Always non-empty; a [`Record`] cannot exist without one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value).ok_or_else(|| "fingerprint must not be empty".to_string())
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Column metadata for one counter, in [`Counters::values`] order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterColumn {
    pub column: &'static str,
    pub json_key: &'static str,
    /// Day-over-day deltas may legitimately be negative.
    pub delta: bool,
}

const fn level(column: &'static str, json_key: &'static str) -> CounterColumn {
    CounterColumn {
        column,
        json_key,
        delta: false,
    }
}

const fn delta(column: &'static str, json_key: &'static str) -> CounterColumn {
    CounterColumn {
        column,
        json_key,
        delta: true,
    }
}

pub const COUNTER_COLUMNS: [CounterColumn; 18] = [
    level("positive", "positive"),
    level("negative", "negative"),
    level("pending", "pending"),
    level("hospitalizedcurrently", "hospitalizedCurrently"),
    level("hospitalizedcumulative", "hospitalizedCumulative"),
    level("inicucurrently", "inIcuCurrently"),
    level("inicucumulative", "inIcuCumulative"),
    level("onventilatorcurrently", "onVentilatorCurrently"),
    level("onventilatorcumulative", "onVentilatorCumulative"),
    level("recovered", "recovered"),
    level("death", "death"),
    level("hospitalized", "hospitalized"),
    level("totaltestresults", "totalTestResults"),
    delta("positiveincrease", "positiveIncrease"),
    delta("negativeincrease", "negativeIncrease"),
    delta("deathincrease", "deathIncrease"),
    delta("hospitalizedincrease", "hospitalizedIncrease"),
    delta("totaltestresultsincrease", "totalTestResultsIncrease"),
];

/// Fixed counter set. `None` means the source omitted the value (stored as NULL).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub positive: Option<i64>,
    pub negative: Option<i64>,
    pub pending: Option<i64>,
    pub hospitalized_currently: Option<i64>,
    pub hospitalized_cumulative: Option<i64>,
    pub in_icu_currently: Option<i64>,
    pub in_icu_cumulative: Option<i64>,
    pub on_ventilator_currently: Option<i64>,
    pub on_ventilator_cumulative: Option<i64>,
    pub recovered: Option<i64>,
    pub death: Option<i64>,
    pub hospitalized: Option<i64>,
    pub total_test_results: Option<i64>,
    pub positive_increase: Option<i64>,
    pub negative_increase: Option<i64>,
    pub death_increase: Option<i64>,
    pub hospitalized_increase: Option<i64>,
    pub total_test_results_increase: Option<i64>,
}

impl Counters {
    /// Values in [`COUNTER_COLUMNS`] order.
    pub fn values(&self) -> [Option<i64>; 18] {
        [
            self.positive,
            self.negative,
            self.pending,
            self.hospitalized_currently,
            self.hospitalized_cumulative,
            self.in_icu_currently,
            self.in_icu_cumulative,
            self.on_ventilator_currently,
            self.on_ventilator_cumulative,
            self.recovered,
            self.death,
            self.hospitalized,
            self.total_test_results,
            self.positive_increase,
            self.negative_increase,
            self.death_increase,
            self.hospitalized_increase,
            self.total_test_results_increase,
        ]
    }
}

/// One statistics observation, immutable once decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub region: String,
    pub date: Option<NaiveDate>,
    pub counters: Counters,
    pub fingerprint: Fingerprint,
    pub last_modified: Option<DateTime<Utc>>,
    pub date_checked: Option<DateTime<Utc>>,
}

impl Record {
    pub fn new(region: impl Into<String>, fingerprint: Fingerprint) -> Self {
        Self {
            region: region.into(),
            date: None,
            counters: Counters::default(),
            fingerprint,
            last_modified: None,
            date_checked: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedShape {
    Object,
    Array,
}

/// Conflict target for mutable feeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NaturalKey {
    Region,
    /// Every record maps onto one fixed row, e.g. national aggregates under `US`.
    Singleton(String),
}

impl NaturalKey {
    pub fn key_for<'a>(&'a self, record: &'a Record) -> &'a str {
        match self {
            Self::Region => &record.region,
            Self::Singleton(label) => label,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictPolicy {
    AppendIfNewHash,
    UpsertByNaturalKey(NaturalKey),
}

impl ConflictPolicy {
    pub fn label(&self) -> &'static str {
        match self {
            Self::AppendIfNewHash => "append_if_new_hash",
            Self::UpsertByNaturalKey(_) => "upsert_by_natural_key",
        }
    }

    pub fn is_historical(&self) -> bool {
        matches!(self, Self::AppendIfNewHash)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cadence {
    Every(Duration),
    Cron(String),
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Every(interval) => write!(f, "every {}s", interval.as_secs()),
            Self::Cron(expr) => write!(f, "cron '{expr}'"),
        }
    }
}

/// Static, process-wide description of one feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedConfig {
    pub name: String,
    pub url: String,
    pub table: String,
    pub shape: FeedShape,
    pub policy: ConflictPolicy,
    pub cadence: Cadence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedState {
    Idle,
    Fetching,
    Decoding,
    Writing,
    Failed,
}

/// Outcome of one scheduler-triggered run, forwarded to logging only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: Uuid,
    pub feed: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub received: usize,
    pub written: u64,
    pub error_kind: Option<String>,
    pub error: Option<String>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}
