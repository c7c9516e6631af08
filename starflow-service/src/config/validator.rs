// Pipeline semantic validation
// Collects every problem in a definition instead of stopping at the first

use crate::config::error::ValidationError;
use crate::config::models::{Action, PipelineDef, TaskDef};
use crate::load::{ColumnDef, ConflictPolicy, Input};
use crate::storage::Probe;

use std::collections::{HashMap, HashSet};

pub struct PipelineValidator;

impl PipelineValidator {
    /// Validate a parsed pipeline definition
    ///
    /// Dependency resolution and cycles are left to the task graph, which
    /// reports the full cycle path.
    pub fn validate(def: &PipelineDef) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if def.name.trim().is_empty() {
            errors.push(ValidationError::new("name", "pipeline name must not be empty"));
        }
        if def.tasks.is_empty() {
            errors.push(ValidationError::new("tasks", "pipeline has no tasks"));
        }

        let retry = &def.settings.retry;
        if retry.backoff_ms > retry.max_backoff_ms {
            errors.push(ValidationError::new(
                "settings.retry",
                format!(
                    "backoff_ms ({}) exceeds max_backoff_ms ({})",
                    retry.backoff_ms, retry.max_backoff_ms
                ),
            ));
        }

        for (index, task) in def.tasks.iter().enumerate() {
            let path = if task.id.trim().is_empty() {
                errors.push(ValidationError::new(
                    format!("tasks[{}].id", index),
                    "task id must not be empty",
                ));
                format!("tasks[{}]", index)
            } else {
                format!("tasks[{}]", task.id)
            };
            Self::validate_task(task, &path, &mut errors);
        }

        Self::validate_gate_coverage(def, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_task(task: &TaskDef, path: &str, errors: &mut Vec<ValidationError>) {
        if let Some(retry) = &task.retry {
            if retry.backoff_ms > retry.max_backoff_ms {
                errors.push(ValidationError::new(
                    format!("{}.retry", path),
                    "backoff_ms exceeds max_backoff_ms",
                ));
            }
        }
        if task.timeout_secs == Some(0) {
            errors.push(ValidationError::new(
                format!("{}.timeout_secs", path),
                "timeout must be at least one second",
            ));
        }

        match &task.action {
            Action::StageLoad(load) => {
                check_locator(&load.source, &format!("{}.source", path), errors);
                check_name(&load.target, &format!("{}.target", path), errors);
            }
            Action::DimensionLoad(load) => {
                check_input(&load.from, path, errors);
                check_name(&load.spec.target, &format!("{}.target", path), errors);
                check_columns(&load.columns, path, errors);
                if load.spec.key.is_empty() {
                    let message = match load.spec.policy {
                        ConflictPolicy::ReplaceAll => "dimension load needs a natural key",
                        _ => "ignore and upsert policies need a natural key",
                    };
                    errors.push(ValidationError::new(format!("{}.key", path), message));
                }
                let names: HashSet<&str> = load.columns.iter().map(|c| c.name.as_str()).collect();
                check_key(&load.spec.key, &names, path, errors);
            }
            Action::FactLoad(load) => {
                check_input(&load.from, path, errors);
                check_name(&load.target, &format!("{}.target", path), errors);
                check_columns(&load.columns, path, errors);
                if load.key.is_empty() {
                    errors.push(ValidationError::new(
                        format!("{}.key", path),
                        "fact load needs a natural key for ignore-on-conflict",
                    ));
                }

                let mut names: HashSet<&str> =
                    load.columns.iter().map(|c| c.name.as_str()).collect();
                for (i, lookup) in load.lookups.iter().enumerate() {
                    let lookup_path = format!("{}.lookups[{}]", path, i);
                    check_name(&lookup.relation, &format!("{}.relation", lookup_path), errors);
                    if lookup.on.is_empty() {
                        errors.push(ValidationError::new(
                            format!("{}.on", lookup_path),
                            "lookup needs at least one match column",
                        ));
                    }
                    if lookup.resolve.is_empty() {
                        errors.push(ValidationError::new(
                            format!("{}.resolve", lookup_path),
                            "lookup resolves no columns",
                        ));
                    }
                    // A join miss nulls resolved columns, so they cannot be part of the key
                    for column in lookup.resolve.keys() {
                        if load.key.contains(column) {
                            errors.push(ValidationError::new(
                                format!("{}.key", path),
                                format!(
                                    "key column '{}' is resolved by lookup on '{}' and may be null",
                                    column, lookup.relation
                                ),
                            ));
                        }
                    }
                    names.extend(lookup.resolve.keys().map(String::as_str));
                }
                check_key(&load.key, &names, path, errors);
            }
            Action::QualityCheck(gate) => {
                if gate.checks.is_empty() {
                    errors.push(ValidationError::new(
                        format!("{}.checks", path),
                        "quality gate has no checks",
                    ));
                }
                for (i, check) in gate.checks.iter().enumerate() {
                    check_probe(&check.probe, &format!("{}.checks[{}]", path, i), errors);
                }
            }
            Action::Barrier => {}
        }
    }

    /// Every quality gate must run after every dimension and fact load
    fn validate_gate_coverage(def: &PipelineDef, errors: &mut Vec<ValidationError>) {
        let deps: HashMap<&str, &[String]> = def
            .tasks
            .iter()
            .map(|t| (t.id.as_str(), t.depends_on.as_slice()))
            .collect();

        let star_loads: Vec<&str> = def
            .tasks
            .iter()
            .filter(|t| t.action.is_star_load())
            .map(|t| t.id.as_str())
            .collect();

        for gate in def
            .tasks
            .iter()
            .filter(|t| matches!(t.action, Action::QualityCheck(_)))
        {
            let upstream = collect_upstream(&gate.id, &deps);
            let missing: Vec<&str> = star_loads
                .iter()
                .copied()
                .filter(|id| !upstream.contains(id))
                .collect();

            if !missing.is_empty() {
                errors.push(ValidationError::new(
                    format!("tasks[{}].depends_on", gate.id),
                    format!(
                        "quality gate does not cover load task(s): {}",
                        missing.join(", ")
                    ),
                ));
            }
        }
    }
}

fn collect_upstream<'a>(id: &str, deps: &HashMap<&'a str, &'a [String]>) -> HashSet<&'a str> {
    let mut seen = HashSet::new();
    let mut stack: Vec<&str> = deps
        .get(id)
        .map(|d| d.iter().map(String::as_str).collect())
        .unwrap_or_default();

    while let Some(current) = stack.pop() {
        if !seen.insert(current) {
            continue;
        }
        if let Some(next) = deps.get(current) {
            stack.extend(next.iter().map(String::as_str));
        }
    }
    seen
}

fn check_name(name: &str, path: &str, errors: &mut Vec<ValidationError>) {
    if name.trim().is_empty() {
        errors.push(ValidationError::new(path, "relation name must not be empty"));
    }
}

fn check_locator(locator: &str, path: &str, errors: &mut Vec<ValidationError>) {
    if locator.trim().is_empty() {
        errors.push(ValidationError::new(path, "source locator must not be empty"));
    } else if locator.contains("://") {
        errors.push(ValidationError::new(
            path,
            format!("remote locator '{}' is not supported, use a local path", locator),
        ));
    }
}

fn check_input(input: &Input, path: &str, errors: &mut Vec<ValidationError>) {
    match input {
        Input::Relation(name) => check_name(name, &format!("{}.from.relation", path), errors),
        Input::Path(locator) => check_locator(locator, &format!("{}.from.path", path), errors),
    }
}

fn check_columns(columns: &[ColumnDef], path: &str, errors: &mut Vec<ValidationError>) {
    if columns.is_empty() {
        errors.push(ValidationError::new(
            format!("{}.columns", path),
            "load maps no columns",
        ));
    }

    let mut seen = HashSet::new();
    for column in columns {
        if column.name.trim().is_empty() {
            errors.push(ValidationError::new(
                format!("{}.columns", path),
                "column name must not be empty",
            ));
        } else if !seen.insert(column.name.as_str()) {
            errors.push(ValidationError::new(
                format!("{}.columns", path),
                format!("column '{}' is mapped twice", column.name),
            ));
        }
    }
}

fn check_key(
    key: &[String],
    columns: &HashSet<&str>,
    path: &str,
    errors: &mut Vec<ValidationError>,
) {
    for column in key {
        if !columns.contains(column.as_str()) {
            errors.push(ValidationError::new(
                format!("{}.key", path),
                format!("key column '{}' is not produced by the load", column),
            ));
        }
    }
}

fn check_probe(probe: &Probe, path: &str, errors: &mut Vec<ValidationError>) {
    match probe {
        Probe::RowCount { relation } => check_name(relation, &format!("{}.relation", path), errors),
        Probe::NullCount { relation, column } => {
            check_name(relation, &format!("{}.relation", path), errors);
            if column.trim().is_empty() {
                errors.push(ValidationError::new(
                    format!("{}.column", path),
                    "null_count needs a column",
                ));
            }
        }
        Probe::DuplicateCount { relation, columns } => {
            check_name(relation, &format!("{}.relation", path), errors);
            if columns.is_empty() {
                errors.push(ValidationError::new(
                    format!("{}.columns", path),
                    "duplicate_count needs at least one column",
                ));
            }
        }
        Probe::Sql { query } => {
            if query.trim().is_empty() {
                errors.push(ValidationError::new(
                    format!("{}.query", path),
                    "sql probe needs a query",
                ));
            }
        }
    }
}
