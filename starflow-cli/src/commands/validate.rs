use crate::commands::{config_error_code, print_parse_error, print_validation_errors};
use crate::output;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Args;
use color_eyre::Result;

use starflow_service::{PipelineParser, PipelineValidator, TaskGraph};

/// Validate a pipeline YAML file
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,
}

pub fn execute(args: ValidateArgs) -> Result<ExitCode> {
    let pipeline_path = &args.pipeline;
    output::status("Validating", &pipeline_path.display().to_string());

    // Step 1: Parse YAML into the pipeline model
    let definition = match PipelineParser::parse_file(pipeline_path) {
        Ok(def) => def,
        Err(err) => {
            print_parse_error(&err);
            return Ok(config_error_code());
        }
    };
    output::check(&format!(
        "Parsed '{}': {} tasks",
        definition.name,
        definition.tasks.len()
    ));

    // Step 2: Semantic validation
    if let Err(errors) = PipelineValidator::validate(&definition) {
        print_validation_errors(&errors);
        return Ok(config_error_code());
    }
    output::check("Semantic validation passed");

    // Step 3: Dependency graph
    let graph = match TaskGraph::build(definition.tasks) {
        Ok(graph) => graph,
        Err(err) => {
            output::error(&err.to_string());
            return Ok(config_error_code());
        }
    };
    output::check("Dependency graph is acyclic");

    for (index, batch) in graph.topological_batches().iter().enumerate() {
        println!("batch {}: {}", index + 1, batch.join(", "));
    }

    Ok(ExitCode::SUCCESS)
}
