//! Conflict-resolving batch writes for decoded feed records.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions};
use sqlx::query::Query;
use sqlx::Postgres;
use statfeed_core::{ConflictPolicy, FeedConfig, Record, COUNTER_COLUMNS};
use thiserror::Error;
use tracing::{debug, error, warn};

pub const CRATE_NAME: &str = "statfeed-store";

const REGION_COLUMN: &str = "state";
const DATE_COLUMN: &str = "date";
const HASH_COLUMN: &str = "hash";
const LAST_MODIFIED_COLUMN: &str = "lastmodified";
const DATE_CHECKED_COLUMN: &str = "datechecked";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Int(Option<i64>),
    Text(Option<String>),
    Date(Option<NaiveDate>),
    Timestamp(Option<DateTime<Utc>>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        match self {
            Self::Int(v) => v.is_none(),
            Self::Text(v) => v.is_none(),
            Self::Date(v) => v.is_none(),
            Self::Timestamp(v) => v.is_none(),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => *v,
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => v.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnConflict {
    DoNothing,
    DoUpdate,
}

pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && name.len() <= 63
}

/// The single parameterized statement shared by every record of one feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlTemplate {
    pub table: String,
    pub columns: Vec<&'static str>,
    pub conflict_column: &'static str,
    pub on_conflict: OnConflict,
    pub policy: ConflictPolicy,
    pub sql: String,
}

impl SqlTemplate {
    pub fn for_feed(feed: &FeedConfig) -> Result<Self, WriteError> {
        if !is_valid_identifier(&feed.table) {
            return Err(WriteError::InvalidTable {
                table: feed.table.clone(),
            });
        }

        let mut columns = Vec::with_capacity(COUNTER_COLUMNS.len() + 5);
        if feed.policy.is_historical() {
            columns.push(DATE_COLUMN);
        }
        columns.push(REGION_COLUMN);
        columns.extend(COUNTER_COLUMNS.iter().map(|c| c.column));
        columns.extend([LAST_MODIFIED_COLUMN, DATE_CHECKED_COLUMN, HASH_COLUMN]);

        let (conflict_column, on_conflict) = match feed.policy {
            ConflictPolicy::AppendIfNewHash => (HASH_COLUMN, OnConflict::DoNothing),
            ConflictPolicy::UpsertByNaturalKey(_) => (REGION_COLUMN, OnConflict::DoUpdate),
        };

        let placeholders = (1..=columns.len())
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let action = match on_conflict {
            OnConflict::DoNothing => "DO NOTHING".to_string(),
            OnConflict::DoUpdate => format!(
                "DO UPDATE SET {}",
                columns
                    .iter()
                    .filter(|c| **c != conflict_column)
                    .map(|c| format!("{c} = EXCLUDED.{c}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        };
        let sql = format!(
            "INSERT INTO {table} ({cols}) VALUES ({placeholders}) ON CONFLICT ({conflict_column}) {action}",
            table = feed.table,
            cols = columns.join(", "),
        );

        Ok(Self {
            table: feed.table.clone(),
            columns,
            conflict_column,
            on_conflict,
            policy: feed.policy.clone(),
            sql,
        })
    }

    /// Project one record onto this template's parameters, in column order.
    pub fn params_for(&self, record: &Record) -> Vec<SqlValue> {
        let region = match &self.policy {
            ConflictPolicy::UpsertByNaturalKey(key) => key.key_for(record),
            ConflictPolicy::AppendIfNewHash => &record.region,
        };

        let mut params = Vec::with_capacity(self.columns.len());
        if self.policy.is_historical() {
            params.push(SqlValue::Date(record.date));
        }
        params.push(SqlValue::Text(Some(region.to_string())));
        params.extend(record.counters.values().into_iter().map(SqlValue::Int));
        params.push(SqlValue::Timestamp(record.last_modified));
        params.push(SqlValue::Timestamp(record.date_checked));
        params.push(SqlValue::Text(Some(record.fingerprint.as_str().to_string())));
        params
    }
}

#[derive(Debug, Clone)]
pub struct Statement {
    pub template: Arc<SqlTemplate>,
    pub params: Vec<SqlValue>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("statement {index} failed after {statements_succeeded} succeeded: {reason}")]
    StatementFailed {
        index: usize,
        statements_succeeded: usize,
        reason: String,
    },
    #[error("commit failed after {statements} statements: {reason}")]
    CommitFailed { statements: usize, reason: String },
}

/// Transactional batch-execute capability.
///
/// Statements run in submission order; the return value is the summed rows affected.
#[async_trait]
pub trait BatchStore: Send + Sync {
    async fn execute_batch(&self, batch: Vec<Statement>) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgStoreConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PgBatchStore {
    pool: PgPool,
}

impl PgBatchStore {
    pub async fn connect(config: &PgStoreConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("pinging postgres")?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &'q SqlValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        SqlValue::Int(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.as_deref()),
        SqlValue::Date(v) => query.bind(*v),
        SqlValue::Timestamp(v) => query.bind(*v),
    }
}

#[async_trait]
impl BatchStore for PgBatchStore {
    async fn execute_batch(&self, batch: Vec<Statement>) -> Result<u64, StoreError> {
        // The transaction holds one pooled connection; dropping it on any early
        // return rolls back and releases the connection.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| StoreError::Unavailable {
                reason: err.to_string(),
            })?;

        let mut rows_affected = 0u64;
        for (index, statement) in batch.iter().enumerate() {
            let query = statement
                .params
                .iter()
                .fold(sqlx::query(&statement.template.sql), bind_value);
            match query.execute(&mut *tx).await {
                Ok(result) => rows_affected += result.rows_affected(),
                Err(err) => {
                    if let Err(rollback_err) = tx.rollback().await {
                        warn!(error = %rollback_err, "rollback after failed statement also failed");
                    }
                    return Err(StoreError::StatementFailed {
                        index,
                        statements_succeeded: index,
                        reason: err.to_string(),
                    });
                }
            }
        }

        tx.commit().await.map_err(|err| StoreError::CommitFailed {
            statements: batch.len(),
            reason: err.to_string(),
        })?;
        Ok(rows_affected)
    }
}

pub type MemoryRow = BTreeMap<&'static str, SqlValue>;

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, Vec<MemoryRow>>,
    unavailable: bool,
    fail_at: Option<usize>,
    fail_commit: bool,
}

/// In-process store applying the same ON CONFLICT rules as the SQL templates.
///
/// Batches apply to a working copy that replaces the tables only on success.
#[derive(Debug, Default)]
pub struct MemoryBatchStore {
    state: Mutex<MemoryState>,
}

impl MemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Make the statement at `index` of the next batches fail.
    pub fn fail_statement_at(&self, index: Option<usize>) {
        self.lock().fail_at = index;
    }

    pub fn fail_commit(&self, fail: bool) {
        self.lock().fail_commit = fail;
    }

    pub fn rows(&self, table: &str) -> Vec<MemoryRow> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map(Vec::len).unwrap_or(0)
    }

    pub fn find(&self, table: &str, column: &str, value: &str) -> Vec<MemoryRow> {
        self.rows(table)
            .into_iter()
            .filter(|row| row.get(column).and_then(SqlValue::as_text) == Some(value))
            .collect()
    }

    fn apply(tables: &mut BTreeMap<String, Vec<MemoryRow>>, statement: &Statement) -> u64 {
        let template = &statement.template;
        let row: MemoryRow = template
            .columns
            .iter()
            .copied()
            .zip(statement.params.iter().cloned())
            .collect();
        let key = row.get(template.conflict_column).cloned();
        let rows = tables.entry(template.table.clone()).or_default();

        let existing = key.as_ref().filter(|k| !k.is_null()).and_then(|key| {
            rows.iter()
                .position(|r| r.get(template.conflict_column) == Some(key))
        });
        match (existing, template.on_conflict) {
            (Some(_), OnConflict::DoNothing) => 0,
            (Some(pos), OnConflict::DoUpdate) => {
                rows[pos] = row;
                1
            }
            (None, _) => {
                rows.push(row);
                1
            }
        }
    }
}

#[async_trait]
impl BatchStore for MemoryBatchStore {
    async fn execute_batch(&self, batch: Vec<Statement>) -> Result<u64, StoreError> {
        let mut state = self.lock();
        if state.unavailable {
            return Err(StoreError::Unavailable {
                reason: "memory store marked unavailable".into(),
            });
        }

        let mut working = state.tables.clone();
        let mut rows_affected = 0u64;
        for (index, statement) in batch.iter().enumerate() {
            if state.fail_at == Some(index) {
                return Err(StoreError::StatementFailed {
                    index,
                    statements_succeeded: index,
                    reason: "injected statement failure".into(),
                });
            }
            rows_affected += Self::apply(&mut working, statement);
        }

        if state.fail_commit {
            return Err(StoreError::CommitFailed {
                statements: batch.len(),
                reason: "injected commit failure".into(),
            });
        }
        state.tables = working;
        Ok(rows_affected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    pub statements: usize,
    pub rows_affected: u64,
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("empty batch for feed {feed}")]
    EmptyBatch { feed: String },
    #[error("table name {table:?} is not a plain SQL identifier")]
    InvalidTable { table: String },
    #[error("store unavailable: {reason}")]
    StoreUnavailable { reason: String },
    #[error("batch aborted after {statements_succeeded} statements (committed: {committed}): {reason}")]
    PartialBatchFailure {
        statements_succeeded: usize,
        committed: bool,
        reason: String,
    },
}

impl From<StoreError> for WriteError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable { reason } => Self::StoreUnavailable { reason },
            StoreError::StatementFailed {
                index,
                statements_succeeded,
                reason,
            } => Self::PartialBatchFailure {
                statements_succeeded,
                committed: false,
                reason: format!("statement {index}: {reason}"),
            },
            StoreError::CommitFailed { statements, reason } => Self::PartialBatchFailure {
                statements_succeeded: statements,
                committed: false,
                reason: format!("commit: {reason}"),
            },
        }
    }
}

/// Applies one feed's records as a single batch through a [`BatchStore`].
#[derive(Clone)]
pub struct BatchWriter {
    store: Arc<dyn BatchStore>,
}

impl BatchWriter {
    pub fn new(store: Arc<dyn BatchStore>) -> Self {
        Self { store }
    }

    pub fn build_batch(feed: &FeedConfig, records: &[Record]) -> Result<Vec<Statement>, WriteError> {
        let template = Arc::new(SqlTemplate::for_feed(feed)?);
        Ok(records
            .iter()
            .map(|record| Statement {
                template: Arc::clone(&template),
                params: template.params_for(record),
            })
            .collect())
    }

    pub async fn write(&self, feed: &FeedConfig, records: &[Record]) -> Result<WriteResult, WriteError> {
        if records.is_empty() {
            error!(feed = %feed.name, "batch writer called with an empty batch");
            return Err(WriteError::EmptyBatch {
                feed: feed.name.clone(),
            });
        }

        let batch = Self::build_batch(feed, records)?;
        let statements = batch.len();
        let rows_affected = self.store.execute_batch(batch).await?;
        debug!(
            feed = %feed.name,
            table = %feed.table,
            statements,
            rows_affected,
            "batch committed"
        );
        Ok(WriteResult {
            statements,
            rows_affected,
        })
    }
}
