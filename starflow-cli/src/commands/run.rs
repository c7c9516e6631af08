use crate::commands::{config_error_code, outcome_code, print_config_error};
use crate::output;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Args;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use tokio_util::sync::CancellationToken;

use starflow_service::execution::events::progress_channel;
use starflow_service::load::reset_landing;
use starflow_service::{
    ExecutionEvent, MemoryStorage, Pipeline, PipelineExecutor, PipelineOutcome, SqliteStorage,
    StorageConnector, TaskState,
};

/// Run a pipeline and report its outcome
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,

    /// SQLite database file; relations are kept in memory when omitted
    #[arg(long, short = 'd', value_name = "FILE")]
    pub database: Option<PathBuf>,

    /// Override the pipeline's max_concurrency (0 = unbounded)
    #[arg(long, value_name = "N")]
    pub max_concurrency: Option<usize>,

    /// Write the full run report as JSON
    #[arg(long, value_name = "FILE")]
    pub report_json: Option<PathBuf>,

    /// Do not empty landing relations before the run
    #[arg(long)]
    pub keep_staging: bool,
}

pub async fn execute(args: RunArgs) -> Result<ExitCode> {
    output::status("Loading", &args.pipeline.display().to_string());
    let pipeline = match Pipeline::from_file(&args.pipeline) {
        Ok(pipeline) => Arc::new(pipeline),
        Err(err) => {
            print_config_error(&err);
            return Ok(config_error_code());
        }
    };

    let storage: Arc<dyn StorageConnector> = match &args.database {
        Some(path) => Arc::new(SqliteStorage::new(path)),
        None => Arc::new(MemoryStorage::new()),
    };
    output::info(&format!("Storage: {}", storage.describe()));

    if !args.keep_staging {
        let landing = pipeline.landing_relations();
        let connector = Arc::clone(&storage);
        let removed = tokio::task::spawn_blocking(move || reset_landing(connector.as_ref(), &landing))
            .await?
            .wrap_err("failed to reset landing relations")?;
        if removed > 0 {
            output::info(&format!("Cleared {} staged rows from an earlier run", removed));
        }
    }

    let mut config = pipeline.executor_config();
    if let Some(limit) = args.max_concurrency {
        config.max_concurrency = limit;
    }

    let cancel = CancellationToken::new();
    let ctx = pipeline.context(storage).with_cancellation(cancel.clone());

    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                output::warning("Interrupted: finishing in-flight tasks, no new work will start");
                cancel.cancel();
            }
        })
    };

    let (tx, mut rx) = progress_channel();
    let executor = PipelineExecutor::new(config).with_progress(tx);

    // The executor owns the sender; the event loop ends when the run does
    let run_pipeline = Arc::clone(&pipeline);
    let exec_handle = tokio::spawn(async move { executor.run(&run_pipeline.graph, ctx).await });

    while let Some(event) = rx.recv().await {
        print_event(&event);
    }

    let report = exec_handle.await?;
    interrupt.abort();

    if let Some(path) = &args.report_json {
        let json = report.to_json()?;
        std::fs::write(path, json)
            .wrap_err_with(|| format!("failed to write report to {}", path.display()))?;
        output::info(&format!("Report written to {}", path.display()));
    }

    println!();
    print!("{}", report.summarize());

    Ok(outcome_code(report.outcome()))
}

fn print_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::PipelineStarted {
            pipeline_name,
            total_tasks,
            total_batches,
        } => {
            eprintln!();
            output::header(&format!(
                "Pipeline '{}' ({} tasks in {} batches)",
                pipeline_name, total_tasks, total_batches
            ));
        }

        ExecutionEvent::BatchStarted { index, tasks } => {
            output::batch_header(*index, tasks);
        }

        ExecutionEvent::TaskStarted { task, attempt } => {
            if *attempt > 1 {
                output::status("Retrying", &format!("{} (attempt {})", task, attempt));
            } else {
                output::status("Running", task);
            }
        }

        ExecutionEvent::AttemptFailed {
            task,
            attempt,
            error,
            retry_in,
        } => match retry_in {
            Some(delay) => output::warning(&format!(
                "{} attempt {} failed: {} (retry in {:.1}s)",
                task,
                attempt,
                error,
                delay.as_secs_f64()
            )),
            None => output::dim(&format!("    {} attempt {} failed: {}", task, attempt, error)),
        },

        ExecutionEvent::TaskCompleted {
            task,
            state,
            attempts,
            duration,
        } => {
            let tries = if *attempts > 1 {
                format!(", {} attempts", attempts)
            } else {
                String::new()
            };
            let message = format!("{} ({:.2}s{})", task, duration.as_secs_f64(), tries);
            if *state == TaskState::Succeeded {
                output::success(&message);
            } else {
                output::failure(&message);
            }
        }

        ExecutionEvent::TaskSkipped { task, reason } => {
            output::warning(&format!("{} skipped: {}", task, reason));
        }

        ExecutionEvent::PipelineCompleted {
            outcome, duration, ..
        } => {
            eprintln!();
            match outcome {
                PipelineOutcome::Success => output::success(&format!(
                    "Pipeline completed successfully in {:.2}s",
                    duration.as_secs_f64()
                )),
                PipelineOutcome::Failure => output::failure(&format!(
                    "Pipeline failed after {:.2}s",
                    duration.as_secs_f64()
                )),
            }
        }
    }
}
