// Quality Gate Module
// Data-quality assertions evaluated against loaded relations

pub mod check;
pub mod gate;

pub use check::{CheckResult, Comparison, QualityCheck};
pub use gate::{GateOutcome, QualityGate};
