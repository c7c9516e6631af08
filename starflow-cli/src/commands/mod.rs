// CLI commands
// Shared exit codes and configuration error reporting

pub mod run;
pub mod validate;

use crate::output;

use std::process::ExitCode;

use starflow_service::{ConfigError, ParseError, PipelineOutcome, ValidationError};

/// Exit code for a configuration error: nothing ran
pub const EXIT_CONFIG: u8 = 2;

pub fn outcome_code(outcome: PipelineOutcome) -> ExitCode {
    match outcome {
        PipelineOutcome::Success => ExitCode::SUCCESS,
        PipelineOutcome::Failure => ExitCode::FAILURE,
    }
}

pub fn config_error_code() -> ExitCode {
    ExitCode::from(EXIT_CONFIG)
}

pub fn print_parse_error(err: &ParseError) {
    if err.line > 0 {
        output::error(&format!(
            "{} (line {}, column {})",
            err.message, err.line, err.column
        ));
    } else {
        output::error(&err.message);
    }
    if !err.context.is_empty() {
        output::dim(err.context.trim_end());
    }
    if let Some(suggestion) = &err.suggestion {
        output::info(&format!("Suggestion: {}", suggestion));
    }
}

pub fn print_validation_errors(errors: &[ValidationError]) {
    output::error(&format!("{} validation error(s):", errors.len()));
    for error in errors {
        output::error(&format!("  - [{}] {}", error.path, error.message));
    }
}

pub fn print_config_error(err: &ConfigError) {
    match err {
        ConfigError::Parse(err) => print_parse_error(err),
        ConfigError::Invalid(errors) => print_validation_errors(errors),
        ConfigError::Graph(err) => output::error(&err.to_string()),
    }
}
