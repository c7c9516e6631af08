// Stage load
// Copies raw source records into a key-less landing relation

use crate::error::TaskError;
use crate::execution::context::ExecutionContext;
use crate::load::{LoadOutcome, LoadStrategy};
use crate::storage::{OnConflict, Statement, Storage, StorageConnector, StorageError};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageLoad {
    /// File, directory or glob locator
    pub source: String,
    /// Landing relation
    pub target: String,
}

impl StageLoad {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

impl LoadStrategy for StageLoad {
    fn target(&self) -> &str {
        &self.target
    }

    /// Additive: rows are appended to whatever the relation holds
    fn load(
        &self,
        storage: &mut dyn Storage,
        ctx: &ExecutionContext,
    ) -> Result<LoadOutcome, TaskError> {
        let records = ctx
            .reader
            .open(&self.source)?
            .collect::<Result<Vec<_>, _>>()?;

        let columns: Vec<String> = records
            .iter()
            .flat_map(|r| r.keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut outcome = LoadOutcome::new(&self.target);
        outcome.rows_read = records.len() as u64;

        if columns.is_empty() {
            info!(source = %self.source, relation = %self.target, "source is empty, nothing staged");
            return Ok(outcome);
        }

        storage.execute(&Statement::CreateRelation {
            relation: &self.target,
            columns: &columns,
            key: None,
        })?;

        for record in &records {
            outcome.rows_written += storage.execute(&Statement::Insert {
                relation: &self.target,
                record,
                on_conflict: OnConflict::Append,
            })?;
        }

        info!(
            source = %self.source,
            relation = %self.target,
            rows = outcome.rows_written,
            "staged records"
        );
        Ok(outcome)
    }
}

/// Empty landing relations before a run so stage loads start clean
///
/// Relations that do not exist yet are skipped. Returns the rows removed.
pub fn reset_landing(
    connector: &dyn StorageConnector,
    relations: &[String],
) -> Result<u64, StorageError> {
    let mut storage = connector.connect()?;
    storage.begin()?;

    let mut removed = 0;
    for relation in relations {
        match storage.execute(&Statement::Truncate { relation }) {
            Ok(n) => removed += n,
            Err(StorageError::UnknownRelation(_)) => {}
            Err(err) => {
                let _ = storage.rollback();
                return Err(err);
            }
        }
    }

    storage.commit()?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::execute;
    use crate::record::Value;
    use crate::source::JsonLinesReader;
    use crate::storage::MemoryStorage;

    use std::sync::Arc;

    fn setup() -> (tempfile::TempDir, MemoryStorage, ExecutionContext) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("events.json"),
            "{\"userId\": \"10\", \"page\": \"NextSong\"}\n{\"userId\": \"11\", \"level\": \"paid\"}\n",
        )
        .unwrap();

        let storage = MemoryStorage::new();
        let ctx = ExecutionContext::new(
            "stage-test",
            Arc::new(storage.clone()),
            Arc::new(JsonLinesReader::new(dir.path())),
        );
        (dir, storage, ctx)
    }

    #[tokio::test]
    async fn test_stage_unions_columns() {
        let (_dir, storage, ctx) = setup();
        let load = StageLoad::new("events.json", "staging_events");

        let outcome = execute(&load, &ctx).await.unwrap();
        assert_eq!(outcome.rows_read, 2);
        assert_eq!(outcome.rows_written, 2);

        assert_eq!(
            storage.columns("staging_events").unwrap(),
            vec!["level", "page", "userId"]
        );
        let rows = storage.rows("staging_events").unwrap();
        assert!(rows[0]["level"].is_null());
        assert_eq!(rows[1]["level"], Value::from("paid"));
    }

    #[tokio::test]
    async fn test_stage_is_additive_until_reset() {
        let (_dir, storage, ctx) = setup();
        let load = StageLoad::new("events.json", "staging_events");

        execute(&load, &ctx).await.unwrap();
        execute(&load, &ctx).await.unwrap();
        assert_eq!(storage.rows("staging_events").unwrap().len(), 4);

        let removed = reset_landing(
            &storage,
            &["staging_events".to_string(), "staging_songs".to_string()],
        )
        .unwrap();
        assert_eq!(removed, 4);
        assert!(storage.rows("staging_events").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_source_is_permanent() {
        let (_dir, storage, ctx) = setup();
        let load = StageLoad::new("song_data", "staging_songs");

        let err = execute(&load, &ctx).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(storage.rows("staging_songs").is_none());
    }
}
