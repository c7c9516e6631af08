// Load Strategies Module
// Stage, dimension and fact loads, each run inside one storage transaction per attempt

pub mod dimension;
pub mod fact;
pub mod stage;
pub mod time;

pub use dimension::DimensionLoad;
pub use fact::{FactLoad, Lookup};
pub use stage::{reset_landing, StageLoad};
pub use time::{TimeError, TimePart};

use crate::config::models::Action;
use crate::error::TaskError;
use crate::execution::context::ExecutionContext;
use crate::quality::GateOutcome;
use crate::record::{Record, Value};
use crate::storage::Storage;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What a successful task produced
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskOutput {
    Load(LoadOutcome),
    Gate(GateOutcome),
    Barrier,
}

impl TaskOutput {
    /// One-line digest for the run summary
    pub fn describe(&self) -> String {
        match self {
            TaskOutput::Load(outcome) => outcome.describe(),
            TaskOutput::Gate(outcome) => format!(
                "{}/{} checks passed",
                outcome.results.len() - outcome.failed_count(),
                outcome.results.len()
            ),
            TaskOutput::Barrier => String::new(),
        }
    }
}

/// Row accounting for one load attempt
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadOutcome {
    pub relation: String,
    pub rows_read: u64,
    pub rows_written: u64,
    /// Rows dropped by the load's filter
    pub rows_filtered: u64,
    /// Rows collapsed into a later row with the same natural key
    pub rows_deduplicated: u64,
    /// Rows without a usable natural key
    pub rows_rejected: u64,
    /// Lookup misses written as unknown references
    pub unresolved_references: u64,
    /// Rows removed before loading (replace-all)
    pub truncated: u64,
}

impl LoadOutcome {
    pub fn new(relation: impl Into<String>) -> Self {
        Self {
            relation: relation.into(),
            ..Default::default()
        }
    }

    pub fn describe(&self) -> String {
        let mut text = format!(
            "{}: read {}, wrote {}",
            self.relation, self.rows_read, self.rows_written
        );
        for (label, count) in [
            ("filtered", self.rows_filtered),
            ("deduplicated", self.rows_deduplicated),
            ("rejected", self.rows_rejected),
            ("unresolved", self.unresolved_references),
        ] {
            if count > 0 {
                text.push_str(&format!(", {} {}", label, count));
            }
        }
        text
    }
}

/// A load that runs against an open storage session
///
/// Implementations must be idempotent: every attempt starts from the
/// state left by the last committed attempt.
pub trait LoadStrategy: Send + Sync {
    fn target(&self) -> &str;

    fn load(
        &self,
        storage: &mut dyn Storage,
        ctx: &ExecutionContext,
    ) -> Result<LoadOutcome, TaskError>;
}

/// Run a load in its own transaction on the blocking pool
///
/// An attempt abandoned by its caller (timeout) rolls back instead of
/// committing. The worker is tracked in `ctx.workers` so the caller can
/// wait for that rollback before starting another attempt.
pub async fn execute<S>(strategy: &S, ctx: &ExecutionContext) -> Result<LoadOutcome, TaskError>
where
    S: LoadStrategy + Clone + 'static,
{
    let strategy = strategy.clone();
    let worker_ctx = ctx.clone();
    let abandoned = CancellationToken::new();
    let guard = abandoned.clone().drop_guard();

    let result = ctx
        .workers
        .spawn_blocking(move || run_in_transaction(&strategy, &worker_ctx, &abandoned))
        .await
        .map_err(|e| TaskError::permanent(format!("load worker failed: {}", e)))?;

    guard.disarm();
    result
}

fn run_in_transaction<S: LoadStrategy>(
    strategy: &S,
    ctx: &ExecutionContext,
    abandoned: &CancellationToken,
) -> Result<LoadOutcome, TaskError> {
    let mut storage = ctx.storage.connect()?;
    storage.begin()?;

    match strategy.load(storage.as_mut(), ctx) {
        Ok(outcome) if !abandoned.is_cancelled() => {
            storage.commit()?;
            debug!(relation = %strategy.target(), written = outcome.rows_written, "load committed");
            Ok(outcome)
        }
        Ok(_) => {
            storage.rollback()?;
            Err(TaskError::transient("attempt abandoned before commit"))
        }
        Err(err) => {
            if let Err(rollback) = storage.rollback() {
                warn!(relation = %strategy.target(), error = %rollback, "rollback failed");
            }
            Err(err)
        }
    }
}

impl Action {
    /// Perform one attempt of this action
    pub async fn execute(&self, ctx: &ExecutionContext) -> Result<TaskOutput, TaskError> {
        match self {
            Action::StageLoad(load) => execute(load, ctx).await.map(TaskOutput::Load),
            Action::DimensionLoad(load) => execute(load, ctx).await.map(TaskOutput::Load),
            Action::FactLoad(load) => execute(load, ctx).await.map(TaskOutput::Load),
            Action::QualityCheck(gate) => gate.execute(ctx).await.map(TaskOutput::Gate),
            Action::Barrier => Ok(TaskOutput::Barrier),
        }
    }
}

/// Where a dimension or fact load reads from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Input {
    /// A staging relation in storage
    Relation(String),
    /// A source locator read directly
    Path(String),
}

/// Conflict handling for keyed loads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Keep rows already present
    Ignore,
    /// Overwrite rows already present
    #[default]
    Upsert,
    /// Truncate, then insert
    ReplaceAll,
}

/// Target relation, natural key and conflict policy of a keyed load
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadSpec {
    pub target: String,
    #[serde(default)]
    pub key: Vec<String>,
    #[serde(default)]
    pub policy: ConflictPolicy,
}

/// Coercion applied to a mapped column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cast {
    Int,
    Float,
    Text,
}

/// One output column of a load
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    /// Source field, defaults to `name`
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub derive: Option<TimePart>,
    #[serde(default)]
    pub cast: Option<Cast>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field: None,
            derive: None,
            cast: None,
        }
    }

    pub fn from_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn derived(mut self, part: TimePart) -> Self {
        self.derive = Some(part);
        self
    }

    pub fn cast(mut self, cast: Cast) -> Self {
        self.cast = Some(cast);
        self
    }

    pub fn source_field(&self) -> &str {
        self.field.as_deref().unwrap_or(&self.name)
    }

    /// Compute this column's value from a source record
    pub fn extract(&self, record: &Record) -> Result<Value, TaskError> {
        let raw = record
            .get(self.source_field())
            .cloned()
            .unwrap_or_default();

        let value = match self.cast {
            Some(cast) => apply_cast(raw, cast)
                .map_err(|msg| TaskError::permanent(format!("column '{}': {}", self.name, msg)))?,
            None => raw,
        };

        match self.derive {
            Some(part) => time::derive(&value, part)
                .map_err(|e| TaskError::permanent(format!("column '{}': {}", self.name, e))),
            None => Ok(value),
        }
    }
}

fn apply_cast(value: Value, cast: Cast) -> Result<Value, String> {
    match (cast, value) {
        (_, Value::Null) => Ok(Value::Null),
        (Cast::Text, v @ Value::Text(_)) => Ok(v),
        (Cast::Text, v) => Ok(Value::Text(v.to_string())),
        // Blank text stands for a missing value in landing files
        (Cast::Int | Cast::Float, Value::Text(s)) if s.trim().is_empty() => Ok(Value::Null),
        (Cast::Int, Value::Text(s)) => s
            .trim()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| format!("cannot cast '{}' to int", s)),
        (Cast::Int, Value::Float(f)) if f.fract() == 0.0 => Ok(Value::Int(f as i64)),
        (Cast::Int, v @ Value::Int(_)) => Ok(v),
        (Cast::Float, Value::Text(s)) => s
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| format!("cannot cast '{}' to float", s)),
        (Cast::Float, Value::Int(i)) => Ok(Value::Float(i as f64)),
        (Cast::Float, v @ Value::Float(_)) => Ok(v),
        (cast, v) => Err(format!("cannot cast {} to {:?}", v, cast)),
    }
}

/// Keep only records whose field equals a value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: String,
    pub equals: Value,
}

impl FieldFilter {
    pub fn matches(&self, record: &Record) -> bool {
        record.get(&self.field) == Some(&self.equals)
    }
}

/// Read every input record, inside the attempt's session for relations
pub(crate) fn read_input(
    input: &Input,
    storage: &mut dyn Storage,
    ctx: &ExecutionContext,
) -> Result<Vec<Record>, TaskError> {
    match input {
        Input::Relation(relation) => Ok(storage.scan(relation)?),
        Input::Path(locator) => {
            let records = ctx.reader.open(locator)?;
            Ok(records.collect::<Result<Vec<_>, _>>()?)
        }
    }
}

/// Apply the filter and column mapping; returns the projected rows and the filtered count
pub(crate) fn project(
    records: &[Record],
    columns: &[ColumnDef],
    filter: Option<&FieldFilter>,
) -> Result<(Vec<Record>, u64), TaskError> {
    let mut rows = Vec::with_capacity(records.len());
    let mut filtered = 0;

    for record in records {
        if filter.is_some_and(|f| !f.matches(record)) {
            filtered += 1;
            continue;
        }
        let mut row = Record::new();
        for column in columns {
            row.insert(column.name.clone(), column.extract(record)?);
        }
        rows.push(row);
    }

    Ok((rows, filtered))
}

/// Natural key values of a row, `None` when any part is null
pub(crate) fn key_of(row: &Record, key: &[String]) -> Option<Vec<Value>> {
    key.iter()
        .map(|column| row.get(column).filter(|v| !v.is_null()).cloned())
        .collect()
}

pub(crate) fn column_names(columns: &[ColumnDef]) -> Vec<String> {
    columns.iter().map(|c| c.name.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::record;

    #[test]
    fn test_column_mapping_with_rename_cast_and_derive() {
        let source = record([
            ("userId", Value::from("10")),
            ("ts", Value::Int(1541105830796)),
        ]);

        let user = ColumnDef::new("user_id").from_field("userId").cast(Cast::Int);
        assert_eq!(user.extract(&source).unwrap(), Value::Int(10));

        let hour = ColumnDef::new("hour").from_field("ts").derived(TimePart::Hour);
        assert_eq!(hour.extract(&source).unwrap(), Value::Int(20));

        let missing = ColumnDef::new("level");
        assert!(missing.extract(&source).unwrap().is_null());
    }

    #[test]
    fn test_blank_text_casts_to_null() {
        let source = record([("userId", Value::from(""))]);
        let user = ColumnDef::new("user_id").from_field("userId").cast(Cast::Int);
        assert!(user.extract(&source).unwrap().is_null());

        let bad = record([("userId", Value::from("abc"))]);
        let err = user.extract(&bad).unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("user_id"));
    }

    #[test]
    fn test_project_applies_filter() {
        let records = vec![
            record([("page", Value::from("NextSong")), ("song", "A".into())]),
            record([("page", Value::from("Home")), ("song", Value::Null)]),
        ];
        let filter = FieldFilter {
            field: "page".into(),
            equals: "NextSong".into(),
        };

        let (rows, filtered) =
            project(&records, &[ColumnDef::new("title").from_field("song")], Some(&filter)).unwrap();
        assert_eq!(filtered, 1);
        assert_eq!(rows, vec![record([("title", "A")])]);
    }

    #[test]
    fn test_key_of_rejects_nulls() {
        let key = vec!["a".to_string(), "b".to_string()];
        assert_eq!(
            key_of(&record([("a", Value::Int(1)), ("b", Value::Int(2))]), &key),
            Some(vec![Value::Int(1), Value::Int(2)])
        );
        assert_eq!(key_of(&record([("a", Value::Int(1)), ("b", Value::Null)]), &key), None);
        assert_eq!(key_of(&record([("a", Value::Int(1))]), &key), None);
    }

    #[test]
    fn test_outcome_describe() {
        let outcome = LoadOutcome {
            rows_read: 10,
            rows_written: 7,
            unresolved_references: 2,
            ..LoadOutcome::new("songplays")
        };
        assert_eq!(outcome.describe(), "songplays: read 10, wrote 7, unresolved 2");
    }
}
