// In-memory storage back end
// Relations live behind a shared mutex; transactions keep per-relation undo snapshots
// and hold a write lock on every relation they touch until commit or rollback

use crate::record::{Record, Value};
use crate::storage::{OnConflict, Probe, Statement, Storage, StorageConnector, StorageError};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

#[derive(Debug, Clone, Default)]
struct Relation {
    columns: Vec<String>,
    key: Option<Vec<String>>,
    rows: Vec<Record>,
}

impl Relation {
    fn position(&self, key: &[String], record: &Record) -> Option<usize> {
        self.rows.iter().position(|row| {
            key.iter()
                .all(|column| row.get(column) == record.get(column))
        })
    }
}

#[derive(Debug, Default)]
struct Database {
    relations: BTreeMap<String, Relation>,
    /// Relation name to the session whose open transaction wrote it
    locks: HashMap<String, u64>,
    next_session: u64,
}

/// Process-local storage, mainly for tests and dry runs
///
/// Clones share the same relations.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    db: Arc<Mutex<Database>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a relation's rows
    pub fn rows(&self, relation: &str) -> Option<Vec<Record>> {
        let db = self.db.lock().ok()?;
        db.relations.get(relation).map(|r| r.rows.clone())
    }

    pub fn relation_names(&self) -> Vec<String> {
        self.db
            .lock()
            .map(|db| db.relations.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn columns(&self, relation: &str) -> Option<Vec<String>> {
        let db = self.db.lock().ok()?;
        db.relations.get(relation).map(|r| r.columns.clone())
    }
}

impl StorageConnector for MemoryStorage {
    fn connect(&self) -> Result<Box<dyn Storage>, StorageError> {
        let id = {
            let mut db = self
                .db
                .lock()
                .map_err(|_| StorageError::Backend("memory storage lock poisoned".to_string()))?;
            db.next_session += 1;
            db.next_session
        };
        Ok(Box::new(MemorySession {
            id,
            db: Arc::clone(&self.db),
            undo: None,
        }))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

struct MemorySession {
    id: u64,
    db: Arc<Mutex<Database>>,
    /// Relation state before the first write in the open transaction
    undo: Option<HashMap<String, Option<Relation>>>,
}

impl MemorySession {
    fn lock(&self) -> Result<MutexGuard<'_, Database>, StorageError> {
        self.db
            .lock()
            .map_err(|_| StorageError::Backend("memory storage lock poisoned".to_string()))
    }

    fn write<T>(
        &mut self,
        relation: &str,
        f: impl FnOnce(&mut BTreeMap<String, Relation>) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let db = Arc::clone(&self.db);
        let mut guard = db
            .lock()
            .map_err(|_| StorageError::Backend("memory storage lock poisoned".to_string()))?;

        if let Some(owner) = guard.locks.get(relation) {
            if *owner != self.id {
                return Err(StorageError::Busy(format!(
                    "relation '{}' is locked by an open transaction",
                    relation
                )));
            }
        }

        if let Some(undo) = self.undo.as_mut() {
            guard.locks.insert(relation.to_string(), self.id);
            undo.entry(relation.to_string())
                .or_insert_with(|| guard.relations.get(relation).cloned());
        }
        f(&mut guard.relations)
    }

    fn restore(&mut self) -> Result<(), StorageError> {
        let Some(undo) = self.undo.take() else {
            return Ok(());
        };
        let id = self.id;
        let mut db = self.lock()?;
        db.locks.retain(|_, owner| *owner != id);
        for (name, snapshot) in undo {
            match snapshot {
                Some(relation) => {
                    db.relations.insert(name, relation);
                }
                None => {
                    db.relations.remove(&name);
                }
            }
        }
        Ok(())
    }
}

fn existing<'a>(
    relations: &'a mut BTreeMap<String, Relation>,
    name: &str,
) -> Result<&'a mut Relation, StorageError> {
    relations
        .get_mut(name)
        .ok_or_else(|| StorageError::UnknownRelation(name.to_string()))
}

fn insert(
    relation_name: &str,
    relation: &mut Relation,
    record: &Record,
    on_conflict: OnConflict<'_>,
) -> Result<u64, StorageError> {
    if let Some(column) = record.keys().find(|c| !relation.columns.contains(*c)) {
        return Err(StorageError::UnknownColumn {
            relation: relation_name.to_string(),
            column: column.clone(),
        });
    }

    let conflict_key = match on_conflict {
        OnConflict::Append => None,
        OnConflict::DoNothing(key) | OnConflict::Update(key) => {
            if relation.key.as_deref() != Some(key) {
                return Err(StorageError::Constraint(format!(
                    "conflict target ({}) does not match the key of '{}'",
                    key.join(", "),
                    relation_name
                )));
            }
            Some(key)
        }
    };

    let mut row: Record = relation
        .columns
        .iter()
        .map(|c| (c.clone(), Value::Null))
        .collect();
    row.extend(record.iter().map(|(k, v)| (k.clone(), v.clone())));

    let existing = relation
        .key
        .clone()
        .and_then(|key| relation.position(&key, &row));

    match (existing, on_conflict) {
        (None, _) => {
            relation.rows.push(row);
            Ok(1)
        }
        (Some(_), OnConflict::DoNothing(_)) => Ok(0),
        (Some(index), OnConflict::Update(_)) => {
            let target = &mut relation.rows[index];
            for (column, value) in record {
                target.insert(column.clone(), value.clone());
            }
            Ok(1)
        }
        (Some(_), OnConflict::Append) => Err(StorageError::Constraint(format!(
            "duplicate key in '{}' ({})",
            relation_name,
            conflict_key
                .or(relation.key.as_deref())
                .map(|k| k.join(", "))
                .unwrap_or_default()
        ))),
    }
}

impl Storage for MemorySession {
    fn execute(&mut self, statement: &Statement<'_>) -> Result<u64, StorageError> {
        match *statement {
            Statement::CreateRelation {
                relation,
                columns,
                key,
            } => self.write(relation, |relations| {
                let entry = relations.entry(relation.to_string()).or_insert_with(|| Relation {
                    columns: Vec::new(),
                    key: key.map(<[String]>::to_vec),
                    rows: Vec::new(),
                });
                for column in columns {
                    if !entry.columns.contains(column) {
                        entry.columns.push(column.clone());
                        for row in &mut entry.rows {
                            row.insert(column.clone(), Value::Null);
                        }
                    }
                }
                Ok(0)
            }),
            Statement::Truncate { relation } => self.write(relation, |relations| {
                let target = existing(relations, relation)?;
                let removed = target.rows.len() as u64;
                target.rows.clear();
                Ok(removed)
            }),
            Statement::Insert {
                relation,
                record,
                on_conflict,
            } => self.write(relation, |relations| {
                let target = existing(relations, relation)?;
                insert(relation, target, record, on_conflict)
            }),
        }
    }

    fn scan(&mut self, relation: &str) -> Result<Vec<Record>, StorageError> {
        let db = self.lock()?;
        db.relations
            .get(relation)
            .map(|r| r.rows.clone())
            .ok_or_else(|| StorageError::UnknownRelation(relation.to_string()))
    }

    fn probe(&mut self, probe: &Probe) -> Result<Value, StorageError> {
        let db = self.lock()?;
        let get = |name: &str| {
            db.relations
                .get(name)
                .ok_or_else(|| StorageError::UnknownRelation(name.to_string()))
        };
        let check_column = |relation: &Relation, name: &str, column: &str| {
            if relation.columns.iter().any(|c| c == column) {
                Ok(())
            } else {
                Err(StorageError::UnknownColumn {
                    relation: name.to_string(),
                    column: column.to_string(),
                })
            }
        };

        let count = match probe {
            Probe::RowCount { relation } => get(relation)?.rows.len(),
            Probe::NullCount { relation, column } => {
                let target = get(relation)?;
                check_column(target, relation, column)?;
                target
                    .rows
                    .iter()
                    .filter(|row| row.get(column).map_or(true, Value::is_null))
                    .count()
            }
            Probe::DuplicateCount { relation, columns } => {
                let target = get(relation)?;
                for column in columns {
                    check_column(target, relation, column)?;
                }
                let mut groups: HashMap<Vec<Value>, usize> = HashMap::new();
                for row in &target.rows {
                    let key: Vec<Value> = columns
                        .iter()
                        .map(|c| row.get(c).cloned().unwrap_or_default())
                        .collect();
                    *groups.entry(key).or_insert(0) += 1;
                }
                groups.values().map(|n| n - 1).sum()
            }
            Probe::Sql { .. } => {
                return Err(StorageError::Unsupported(
                    "sql probes need a SQL back end".to_string(),
                ))
            }
        };

        Ok(Value::Int(count as i64))
    }

    fn begin(&mut self) -> Result<(), StorageError> {
        if self.undo.is_some() {
            return Err(StorageError::Transaction(
                "transaction already open".to_string(),
            ));
        }
        self.undo = Some(HashMap::new());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        if self.undo.take().is_none() {
            return Err(StorageError::Transaction("no open transaction".to_string()));
        }
        let id = self.id;
        self.lock()?.locks.retain(|_, owner| *owner != id);
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StorageError> {
        if self.undo.is_none() {
            return Err(StorageError::Transaction("no open transaction".to_string()));
        }
        self.restore()
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if let Err(err) = self.restore() {
            warn!(error = %err, "rollback of dropped memory session failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::record;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn keyed(storage: &MemoryStorage) -> Box<dyn Storage> {
        let mut session = storage.connect().unwrap();
        let columns = cols(&["user_id", "level"]);
        let key = cols(&["user_id"]);
        session
            .execute(&Statement::CreateRelation {
                relation: "users",
                columns: &columns,
                key: Some(&key),
            })
            .unwrap();
        session
    }

    #[test]
    fn test_conflict_policies() {
        let storage = MemoryStorage::new();
        let mut session = keyed(&storage);
        let key = cols(&["user_id"]);

        let free = record([("user_id", Value::Int(1)), ("level", "free".into())]);
        let paid = record([("user_id", Value::Int(1)), ("level", "paid".into())]);

        let ignore = Statement::Insert {
            relation: "users",
            record: &free,
            on_conflict: OnConflict::DoNothing(&key),
        };
        assert_eq!(session.execute(&ignore).unwrap(), 1);
        assert_eq!(session.execute(&ignore).unwrap(), 0);

        let append = Statement::Insert {
            relation: "users",
            record: &free,
            on_conflict: OnConflict::Append,
        };
        assert!(matches!(
            session.execute(&append),
            Err(StorageError::Constraint(_))
        ));

        session
            .execute(&Statement::Insert {
                relation: "users",
                record: &paid,
                on_conflict: OnConflict::Update(&key),
            })
            .unwrap();

        let rows = storage.rows("users").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["level"], Value::from("paid"));
    }

    #[test]
    fn test_rollback_restores_snapshot() {
        let storage = MemoryStorage::new();
        let mut session = keyed(&storage);
        let row = record([("user_id", Value::Int(7))]);

        session.begin().unwrap();
        session
            .execute(&Statement::Insert {
                relation: "users",
                record: &row,
                on_conflict: OnConflict::Append,
            })
            .unwrap();
        session
            .execute(&Statement::CreateRelation {
                relation: "scratch",
                columns: &cols(&["x"]),
                key: None,
            })
            .unwrap();
        assert_eq!(storage.rows("users").unwrap().len(), 1);
        session.rollback().unwrap();

        assert!(storage.rows("users").unwrap().is_empty());
        assert!(storage.rows("scratch").is_none());
    }

    #[test]
    fn test_drop_rolls_back_open_transaction() {
        let storage = MemoryStorage::new();
        let mut session = keyed(&storage);
        session.begin().unwrap();
        session
            .execute(&Statement::Truncate { relation: "users" })
            .unwrap();
        session
            .execute(&Statement::Insert {
                relation: "users",
                record: &record([("user_id", Value::Int(1))]),
                on_conflict: OnConflict::Append,
            })
            .unwrap();
        drop(session);

        assert!(storage.rows("users").unwrap().is_empty());
    }

    #[test]
    fn test_drop_with_poisoned_lock_is_logged_not_raised() {
        let storage = MemoryStorage::new();
        let mut session = keyed(&storage);
        session.begin().unwrap();
        session
            .execute(&Statement::Truncate { relation: "users" })
            .unwrap();

        let db = Arc::clone(&storage.db);
        let poisoner = std::thread::spawn(move || {
            let _guard = db.lock().unwrap();
            panic!("writer crashed");
        });
        assert!(poisoner.join().is_err());

        drop(session);
        assert!(storage.rows("users").is_none());
    }

    #[test]
    fn test_open_transaction_locks_written_relations() {
        let storage = MemoryStorage::new();
        let mut first = keyed(&storage);
        let mut second = storage.connect().unwrap();
        let row = |id| record([("user_id", Value::Int(id))]);

        first.begin().unwrap();
        first
            .execute(&Statement::Insert {
                relation: "users",
                record: &row(1),
                on_conflict: OnConflict::Append,
            })
            .unwrap();

        // A second writer must wait until the first transaction settles
        second.begin().unwrap();
        let err = second
            .execute(&Statement::Insert {
                relation: "users",
                record: &row(2),
                on_conflict: OnConflict::Append,
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::Busy(_)));
        assert!(err.is_transient());

        first.rollback().unwrap();
        second
            .execute(&Statement::Insert {
                relation: "users",
                record: &row(2),
                on_conflict: OnConflict::Append,
            })
            .unwrap();
        second.commit().unwrap();

        // The lock is released on commit, and the rolled-back snapshot stays gone
        drop(first);
        drop(second);
        let mut third = storage.connect().unwrap();
        third
            .execute(&Statement::Insert {
                relation: "users",
                record: &row(3),
                on_conflict: OnConflict::Append,
            })
            .unwrap();
        let ids: Vec<Value> = storage
            .rows("users")
            .unwrap()
            .iter()
            .map(|r| r["user_id"].clone())
            .collect();
        assert_eq!(ids, vec![Value::Int(2), Value::Int(3)]);
    }

    #[test]
    fn test_unknown_relation_and_column() {
        let storage = MemoryStorage::new();
        let mut session = keyed(&storage);

        let err = session.scan("songs").unwrap_err();
        assert!(matches!(err, StorageError::UnknownRelation(_)));

        let err = session
            .execute(&Statement::Insert {
                relation: "users",
                record: &record([("user_id", Value::Int(1)), ("gender", "F".into())]),
                on_conflict: OnConflict::Append,
            })
            .unwrap_err();
        assert!(matches!(err, StorageError::UnknownColumn { .. }));
    }

    #[test]
    fn test_probes() {
        let storage = MemoryStorage::new();
        let mut session = storage.connect().unwrap();
        let columns = cols(&["song_id", "artist_id"]);
        session
            .execute(&Statement::CreateRelation {
                relation: "songs",
                columns: &columns,
                key: None,
            })
            .unwrap();
        for (song, artist) in [("s1", Value::from("a1")), ("s1", Value::Null), ("s2", Value::Null)] {
            session
                .execute(&Statement::Insert {
                    relation: "songs",
                    record: &record([("song_id", Value::from(song)), ("artist_id", artist)]),
                    on_conflict: OnConflict::Append,
                })
                .unwrap();
        }

        let rows = session
            .probe(&Probe::RowCount { relation: "songs".into() })
            .unwrap();
        assert_eq!(rows, Value::Int(3));

        let nulls = session
            .probe(&Probe::NullCount {
                relation: "songs".into(),
                column: "artist_id".into(),
            })
            .unwrap();
        assert_eq!(nulls, Value::Int(2));

        let dups = session
            .probe(&Probe::DuplicateCount {
                relation: "songs".into(),
                columns: cols(&["song_id"]),
            })
            .unwrap();
        assert_eq!(dups, Value::Int(1));

        assert!(matches!(
            session.probe(&Probe::Sql { query: "SELECT 1".into() }),
            Err(StorageError::Unsupported(_))
        ));
        assert!(matches!(
            session.probe(&Probe::NullCount {
                relation: "songs".into(),
                column: "missing".into()
            }),
            Err(StorageError::UnknownColumn { .. })
        ));
    }
}
