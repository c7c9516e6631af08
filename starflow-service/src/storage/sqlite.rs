// SQLite storage back end
// One connection per session; conflict handling maps onto INSERT ... ON CONFLICT

use crate::record::{Record, Value, TIMESTAMP_FORMAT};
use crate::storage::{OnConflict, Probe, Statement, Storage, StorageConnector, StorageError};

use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// File-backed SQLite database
///
/// Each `connect()` opens its own connection so concurrent tasks never
/// share a transaction. Lock contention surfaces as a transient error.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageConnector for SqliteStorage {
    fn connect(&self) -> Result<Box<dyn Storage>, StorageError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Connection(format!("{}: {}", parent.display(), e)))?;
        }

        let conn = Connection::open(&self.path).map_err(classify)?;
        conn.busy_timeout(self.busy_timeout).map_err(classify)?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .map_err(classify)?;

        Ok(Box::new(SqliteSession {
            conn,
            in_transaction: false,
        }))
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }
}

struct SqliteSession {
    conn: Connection,
    in_transaction: bool,
}

impl SqliteSession {
    fn table_columns(&self, relation: &str) -> Result<Vec<String>, StorageError> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", quote(relation)))
            .map_err(classify)?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(classify)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(classify)?;
        Ok(names)
    }

    fn create_relation(
        &self,
        relation: &str,
        columns: &[String],
        key: Option<&[String]>,
    ) -> Result<u64, StorageError> {
        let existing = self.table_columns(relation)?;

        if existing.is_empty() {
            if columns.is_empty() {
                return Err(StorageError::Unsupported(format!(
                    "cannot create relation '{}' without columns",
                    relation
                )));
            }

            let mut parts: Vec<String> = columns.iter().map(|c| quote(c)).collect();
            if let Some(key) = key.filter(|k| !k.is_empty()) {
                parts.push(format!("UNIQUE ({})", quote_list(key)));
            }
            let sql = format!(
                "CREATE TABLE IF NOT EXISTS {} ({})",
                quote(relation),
                parts.join(", ")
            );
            debug!(relation, sql = %sql, "creating relation");
            self.conn.execute_batch(&sql).map_err(classify)?;
            return Ok(0);
        }

        for column in columns.iter().filter(|c| !existing.contains(*c)) {
            let sql = format!("ALTER TABLE {} ADD COLUMN {}", quote(relation), quote(column));
            self.conn.execute_batch(&sql).map_err(classify)?;
        }
        Ok(0)
    }

    fn insert(
        &self,
        relation: &str,
        record: &Record,
        on_conflict: OnConflict<'_>,
    ) -> Result<u64, StorageError> {
        let columns: Vec<&String> = record.keys().collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();

        let mut sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(relation),
            columns.iter().map(|c| quote(c)).collect::<Vec<_>>().join(", "),
            placeholders.join(", ")
        );

        match on_conflict {
            OnConflict::Append => {}
            OnConflict::DoNothing(key) => {
                sql.push_str(&format!(" ON CONFLICT ({}) DO NOTHING", quote_list(key)));
            }
            OnConflict::Update(key) => {
                let updates: Vec<String> = columns
                    .iter()
                    .filter(|c| !key.contains(**c))
                    .map(|c| format!("{col} = excluded.{col}", col = quote(c)))
                    .collect();
                if updates.is_empty() {
                    sql.push_str(&format!(" ON CONFLICT ({}) DO NOTHING", quote_list(key)));
                } else {
                    sql.push_str(&format!(
                        " ON CONFLICT ({}) DO UPDATE SET {}",
                        quote_list(key),
                        updates.join(", ")
                    ));
                }
            }
        }

        let changed = self
            .conn
            .execute(&sql, params_from_iter(record.values()))
            .map_err(|e| classify_in(relation, e))?;
        Ok(changed as u64)
    }

    /// Unknown double-quoted identifiers would otherwise read as string literals
    fn require_columns(&self, relation: &str, columns: &[String]) -> Result<(), StorageError> {
        let existing = self.table_columns(relation)?;
        if existing.is_empty() {
            return Err(StorageError::UnknownRelation(relation.to_string()));
        }
        match columns.iter().find(|c| !existing.contains(*c)) {
            Some(column) => Err(StorageError::UnknownColumn {
                relation: relation.to_string(),
                column: column.clone(),
            }),
            None => Ok(()),
        }
    }

    fn count(&self, relation: &str, sql: &str) -> Result<Value, StorageError> {
        self.conn
            .query_row(sql, [], |row| row.get::<_, i64>(0))
            .map(Value::Int)
            .map_err(|e| classify_in(relation, e))
    }
}

impl Storage for SqliteSession {
    fn execute(&mut self, statement: &Statement<'_>) -> Result<u64, StorageError> {
        match *statement {
            Statement::CreateRelation {
                relation,
                columns,
                key,
            } => self.create_relation(relation, columns, key),
            Statement::Truncate { relation } => {
                let sql = format!("DELETE FROM {}", quote(relation));
                let removed = self
                    .conn
                    .execute(&sql, [])
                    .map_err(|e| classify_in(relation, e))?;
                Ok(removed as u64)
            }
            Statement::Insert {
                relation,
                record,
                on_conflict,
            } => self.insert(relation, record, on_conflict),
        }
    }

    fn scan(&mut self, relation: &str) -> Result<Vec<Record>, StorageError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT * FROM {}", quote(relation)))
            .map_err(|e| classify_in(relation, e))?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

        let mut rows = stmt.query([]).map_err(classify)?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().map_err(classify)? {
            let mut record = Record::new();
            for (i, name) in names.iter().enumerate() {
                let value = row.get_ref(i).map_err(classify)?;
                record.insert(name.clone(), from_sql(value));
            }
            records.push(record);
        }
        Ok(records)
    }

    fn probe(&mut self, probe: &Probe) -> Result<Value, StorageError> {
        match probe {
            Probe::RowCount { relation } => {
                self.count(relation, &format!("SELECT COUNT(*) FROM {}", quote(relation)))
            }
            Probe::NullCount { relation, column } => {
                self.require_columns(relation, std::slice::from_ref(column))?;
                self.count(
                    relation,
                    &format!(
                        "SELECT COUNT(*) FROM {} WHERE {} IS NULL",
                        quote(relation),
                        quote(column)
                    ),
                )
            }
            Probe::DuplicateCount { relation, columns } => {
                self.require_columns(relation, columns)?;
                self.count(
                    relation,
                    &format!(
                        "SELECT COALESCE(SUM(n - 1), 0) FROM (SELECT COUNT(*) AS n FROM {} GROUP BY {})",
                        quote(relation),
                        quote_list(columns)
                    ),
                )
            }
            Probe::Sql { query } => self
                .conn
                .query_row(query, [], |row| row.get_ref(0).map(from_sql))
                .map_err(classify),
        }
    }

    fn begin(&mut self) -> Result<(), StorageError> {
        if self.in_transaction {
            return Err(StorageError::Transaction("transaction already open".to_string()));
        }
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(classify)?;
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        if !self.in_transaction {
            return Err(StorageError::Transaction("no open transaction".to_string()));
        }
        self.conn.execute_batch("COMMIT").map_err(classify)?;
        self.in_transaction = false;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StorageError> {
        if !self.in_transaction {
            return Err(StorageError::Transaction("no open transaction".to_string()));
        }
        self.in_transaction = false;
        self.conn.execute_batch("ROLLBACK").map_err(classify)
    }
}

impl Drop for SqliteSession {
    fn drop(&mut self) {
        if self.in_transaction {
            let _ = self.conn.execute_batch("ROLLBACK");
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Bool(b) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(i64::from(*b))),
            Value::Int(i) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(*i)),
            Value::Float(f) => ToSqlOutput::Owned(rusqlite::types::Value::Real(*f)),
            Value::Timestamp(t) => ToSqlOutput::Owned(rusqlite::types::Value::Text(
                t.format(TIMESTAMP_FORMAT).to_string(),
            )),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Int(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Value::Text(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

fn quote_list(identifiers: &[String]) -> String {
    identifiers
        .iter()
        .map(|c| quote(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Map a SQLite error onto the storage taxonomy
fn classify(err: rusqlite::Error) -> StorageError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, message) => {
            let text = message.clone().unwrap_or_else(|| err.to_string());
            match failure.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => StorageError::Busy(text),
                ErrorCode::CannotOpen | ErrorCode::NotADatabase => StorageError::Connection(text),
                ErrorCode::ConstraintViolation => StorageError::Constraint(text),
                _ => match text.strip_prefix("no such table: ") {
                    Some(table) => StorageError::UnknownRelation(table.to_string()),
                    None => StorageError::Backend(text),
                },
            }
        }
        _ => StorageError::Backend(err.to_string()),
    }
}

/// Like [`classify`], resolving unknown-column messages against `relation`
fn classify_in(relation: &str, err: rusqlite::Error) -> StorageError {
    match classify(err) {
        StorageError::Backend(text) => {
            let column = text
                .strip_prefix("no such column: ")
                .or_else(|| text.split(" has no column named ").nth(1));
            match column {
                Some(column) => StorageError::UnknownColumn {
                    relation: relation.to_string(),
                    column: column.to_string(),
                },
                None => StorageError::Backend(text),
            }
        }
        other => other,
    }
}
