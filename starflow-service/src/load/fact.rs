// Fact load
// Resolves foreign keys against loaded relations and inserts, ignoring existing rows

use crate::error::TaskError;
use crate::execution::context::ExecutionContext;
use crate::load::{
    column_names, key_of, read_input, ColumnDef, ConflictPolicy, FieldFilter, Input, LoadOutcome,
    LoadSpec, LoadStrategy,
};
use crate::record::{Record, Value};
use crate::storage::{OnConflict, Statement, Storage};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

/// Foreign key resolution against another relation
///
/// `on` maps relation columns to source fields; `resolve` maps fact
/// columns to the relation columns they are copied from. A source record
/// with no match gets null in every resolved column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lookup {
    pub relation: String,
    pub on: BTreeMap<String, String>,
    pub resolve: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactLoad {
    pub from: Input,
    pub target: String,
    pub key: Vec<String>,
    pub columns: Vec<ColumnDef>,

    #[serde(default)]
    pub lookups: Vec<Lookup>,

    #[serde(default)]
    pub filter: Option<FieldFilter>,
}

impl FactLoad {
    pub fn new(
        from: Input,
        target: impl Into<String>,
        key: Vec<String>,
        columns: Vec<ColumnDef>,
    ) -> Self {
        Self {
            from,
            target: target.into(),
            key,
            columns,
            lookups: Vec::new(),
            filter: None,
        }
    }

    pub fn with_lookup(mut self, lookup: Lookup) -> Self {
        self.lookups.push(lookup);
        self
    }

    pub fn with_filter(mut self, filter: FieldFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Facts are append-only: existing rows are never overwritten
    pub fn load_spec(&self) -> LoadSpec {
        LoadSpec {
            target: self.target.clone(),
            key: self.key.clone(),
            policy: ConflictPolicy::Ignore,
        }
    }

    /// Every column written to the target, mapped columns first
    pub fn output_columns(&self) -> Vec<String> {
        let mut columns = column_names(&self.columns);
        for lookup in &self.lookups {
            for column in lookup.resolve.keys() {
                if !columns.contains(column) {
                    columns.push(column.clone());
                }
            }
        }
        columns
    }
}

/// Match values compare as one numeric domain
fn normalize(value: &Value) -> Value {
    match value {
        Value::Int(i) => Value::Float(*i as f64),
        other => other.clone(),
    }
}

/// In-memory index over one lookup relation
struct LookupIndex<'a> {
    lookup: &'a Lookup,
    rows: HashMap<Vec<Value>, Record>,
}

impl<'a> LookupIndex<'a> {
    fn build(lookup: &'a Lookup, storage: &mut dyn Storage) -> Result<Self, TaskError> {
        let mut rows = HashMap::new();
        for row in storage.scan(&lookup.relation)? {
            let Some(key) = Self::match_key(lookup.on.keys(), &row) else {
                continue;
            };
            // First matching row wins
            rows.entry(key).or_insert(row);
        }
        debug!(relation = %lookup.relation, entries = rows.len(), "lookup index built");
        Ok(Self { lookup, rows })
    }

    fn match_key<'k>(fields: impl Iterator<Item = &'k String>, record: &Record) -> Option<Vec<Value>> {
        fields
            .map(|field| record.get(field).filter(|v| !v.is_null()).map(normalize))
            .collect()
    }

    /// Copy resolved columns into `row`; returns false on a miss
    fn resolve(&self, source: &Record, row: &mut Record) -> bool {
        let matched = Self::match_key(self.lookup.on.values(), source)
            .and_then(|key| self.rows.get(&key));

        for (column, relation_column) in &self.lookup.resolve {
            let value = matched
                .and_then(|found| found.get(relation_column).cloned())
                .unwrap_or_default();
            row.insert(column.clone(), value);
        }
        matched.is_some()
    }
}

impl LoadStrategy for FactLoad {
    fn target(&self) -> &str {
        &self.target
    }

    fn load(
        &self,
        storage: &mut dyn Storage,
        ctx: &ExecutionContext,
    ) -> Result<LoadOutcome, TaskError> {
        let target = self.target.as_str();
        let key = self.key.as_slice();

        if let Some(column) = self
            .lookups
            .iter()
            .flat_map(|l| l.resolve.keys())
            .find(|c| key.contains(*c))
        {
            return Err(TaskError::permanent(format!(
                "key column '{}' of {} is filled by a lookup and may be null",
                column, target
            )));
        }

        let records = read_input(&self.from, storage, ctx)?;
        let mut outcome = LoadOutcome::new(target);
        outcome.rows_read = records.len() as u64;

        let mut indexes = Vec::with_capacity(self.lookups.len());
        for lookup in &self.lookups {
            indexes.push(LookupIndex::build(lookup, storage)?);
        }

        let mut rows = Vec::with_capacity(records.len());
        for record in &records {
            if self.filter.as_ref().is_some_and(|f| !f.matches(record)) {
                outcome.rows_filtered += 1;
                continue;
            }

            let mut row = Record::new();
            for column in &self.columns {
                row.insert(column.name.clone(), column.extract(record)?);
            }
            for index in &indexes {
                if !index.resolve(record, &mut row) {
                    outcome.unresolved_references += 1;
                }
            }

            if key_of(&row, key).is_none() {
                outcome.rows_rejected += 1;
                continue;
            }
            rows.push(row);
        }

        let columns = self.output_columns();
        storage.execute(&Statement::CreateRelation {
            relation: target,
            columns: &columns,
            key: Some(key),
        })?;

        for row in &rows {
            outcome.rows_written += storage.execute(&Statement::Insert {
                relation: target,
                record: row,
                on_conflict: OnConflict::DoNothing(key),
            })?;
        }

        info!(
            relation = %target,
            read = outcome.rows_read,
            written = outcome.rows_written,
            unresolved = outcome.unresolved_references,
            rejected = outcome.rows_rejected,
            "fact loaded"
        );
        Ok(outcome)
    }
}
