// Dimension load
// Deduplicates by natural key (last observed wins) and applies the conflict policy

use crate::error::TaskError;
use crate::execution::context::ExecutionContext;
use crate::load::{
    column_names, key_of, project, read_input, ColumnDef, ConflictPolicy, FieldFilter, Input,
    LoadOutcome, LoadSpec, LoadStrategy,
};
use crate::record::{Record, Value};
use crate::storage::{OnConflict, Statement, Storage};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DimensionLoad {
    pub from: Input,

    #[serde(flatten)]
    pub spec: LoadSpec,

    pub columns: Vec<ColumnDef>,

    #[serde(default)]
    pub filter: Option<FieldFilter>,
}

impl DimensionLoad {
    pub fn new(from: Input, spec: LoadSpec, columns: Vec<ColumnDef>) -> Self {
        Self {
            from,
            spec,
            columns,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: FieldFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// Collapse rows sharing a natural key
///
/// Each key keeps the position of its first occurrence and the values of
/// its last. Rows with a null key part are rejected. Returns the surviving
/// rows, the deduplicated count and the rejected count.
pub(crate) fn deduplicate(rows: Vec<Record>, key: &[String]) -> (Vec<Record>, u64, u64) {
    let mut positions: HashMap<Vec<Value>, usize> = HashMap::new();
    let mut unique: Vec<Record> = Vec::new();
    let mut duplicates = 0;
    let mut rejected = 0;

    for row in rows {
        let Some(natural_key) = key_of(&row, key) else {
            rejected += 1;
            continue;
        };
        match positions.get(&natural_key) {
            Some(&index) => {
                unique[index] = row;
                duplicates += 1;
            }
            None => {
                positions.insert(natural_key, unique.len());
                unique.push(row);
            }
        }
    }

    (unique, duplicates, rejected)
}

impl LoadStrategy for DimensionLoad {
    fn target(&self) -> &str {
        &self.spec.target
    }

    fn load(
        &self,
        storage: &mut dyn Storage,
        ctx: &ExecutionContext,
    ) -> Result<LoadOutcome, TaskError> {
        let target = self.spec.target.as_str();
        let key = self.spec.key.as_slice();

        let records = read_input(&self.from, storage, ctx)?;
        let mut outcome = LoadOutcome::new(target);
        outcome.rows_read = records.len() as u64;

        let (rows, filtered) = project(&records, &self.columns, self.filter.as_ref())?;
        outcome.rows_filtered = filtered;

        let (rows, duplicates, rejected) = deduplicate(rows, key);
        outcome.rows_deduplicated = duplicates;
        outcome.rows_rejected = rejected;

        let columns = column_names(&self.columns);
        storage.execute(&Statement::CreateRelation {
            relation: target,
            columns: &columns,
            key: Some(key),
        })?;

        if self.spec.policy == ConflictPolicy::ReplaceAll {
            outcome.truncated = storage.execute(&Statement::Truncate { relation: target })?;
            debug!(relation = %target, rows = outcome.truncated, "truncated for replace-all");
        }

        let on_conflict = match self.spec.policy {
            ConflictPolicy::Ignore => OnConflict::DoNothing(key),
            ConflictPolicy::Upsert | ConflictPolicy::ReplaceAll => OnConflict::Update(key),
        };
        for row in &rows {
            outcome.rows_written += storage.execute(&Statement::Insert {
                relation: target,
                record: row,
                on_conflict,
            })?;
        }

        info!(
            relation = %target,
            read = outcome.rows_read,
            written = outcome.rows_written,
            deduplicated = outcome.rows_deduplicated,
            rejected = outcome.rows_rejected,
            "dimension loaded"
        );
        Ok(outcome)
    }
}
