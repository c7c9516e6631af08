// Quality Checks
// A single assertion: run a probe and compare the observed value with an expectation

use crate::record::Value;
use crate::storage::{Probe, Storage};

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

// =============================================================================
// Comparison
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    #[default]
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Comparison {
    /// Compare `observed` against `expected`
    ///
    /// Values that cannot be ordered against each other only satisfy `ne`.
    pub fn evaluate(self, observed: &Value, expected: &Value) -> bool {
        let Some(ordering) = observed.compare(expected) else {
            return self == Comparison::Ne;
        };
        match self {
            Comparison::Eq => ordering == Ordering::Equal,
            Comparison::Ne => ordering != Ordering::Equal,
            Comparison::Gt => ordering == Ordering::Greater,
            Comparison::Ge => ordering != Ordering::Less,
            Comparison::Lt => ordering == Ordering::Less,
            Comparison::Le => ordering != Ordering::Greater,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Comparison::Eq => "==",
            Comparison::Ne => "!=",
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Lt => "<",
            Comparison::Le => "<=",
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

// =============================================================================
// Check definition and result
// =============================================================================

/// A data-quality assertion against loaded state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityCheck {
    /// Display name, defaults to the probe description
    #[serde(default)]
    pub name: Option<String>,

    pub probe: Probe,

    pub expected: Value,

    #[serde(default)]
    pub comparison: Comparison,
}

impl QualityCheck {
    pub fn new(probe: Probe, comparison: Comparison, expected: impl Into<Value>) -> Self {
        Self {
            name: None,
            probe,
            expected: expected.into(),
            comparison,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.probe.describe())
    }

    /// Run the probe and compare; probe errors become failed results
    pub fn run(&self, storage: &mut dyn Storage) -> CheckResult {
        match storage.probe(&self.probe) {
            Ok(observed) => {
                let passed = self.comparison.evaluate(&observed, &self.expected);
                CheckResult {
                    check: self.label(),
                    passed,
                    observed: Some(observed),
                    expected: self.expected.clone(),
                    comparison: self.comparison,
                    error: None,
                }
            }
            Err(err) => CheckResult {
                check: self.label(),
                passed: false,
                observed: None,
                expected: self.expected.clone(),
                comparison: self.comparison,
                error: Some(err.to_string()),
            },
        }
    }
}

/// Outcome of one check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub check: String,
    pub passed: bool,
    /// Probe value; absent when the probe itself failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed: Option<Value>,
    pub expected: Value,
    pub comparison: Comparison,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CheckResult {
    /// `observed` vs `expected` in one line
    pub fn describe(&self) -> String {
        match (&self.observed, &self.error) {
            (_, Some(error)) => format!("{}: probe failed: {}", self.check, error),
            (Some(observed), None) => format!(
                "{}: observed {}, expected {} {}",
                self.check, observed, self.comparison, self.expected
            ),
            (None, None) => format!("{}: no value observed", self.check),
        }
    }
}
