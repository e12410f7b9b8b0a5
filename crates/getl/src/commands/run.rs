//! `getl run` - extract, transform and merge datasets

use std::str::FromStr;

use clap::Args;
use tracing::{info, warn};

use crate::error::CliError;
use getl_core::cancel::CancellationFlag;
use getl_core::catalog::{DatasetCatalog, DatasetConfig, DatasetFilter};
use getl_core::extract::ExtractorRegistry;
use getl_core::pipeline::{Phase, PipelineRunner, RunMode, RunOptions};
use getl_core::progress::PipelineProgress;
use getl_core::settings::Settings;
use getl_core::sink::{LogSink, RunLog, stdout_sink, tee};

/// Arguments for the `run` command
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Dataset ids to run (default: every enabled dataset)
    #[arg(long = "dataset", short = 'd')]
    pub datasets: Vec<String>,

    /// Only datasets of this type
    #[arg(long = "type")]
    pub typ: Option<String>,

    /// Only datasets of this pipeline group
    #[arg(long)]
    pub pipeline: Option<String>,

    /// Extract snapshots without transforming
    #[arg(long, conflicts_with = "transform_only")]
    pub extract_only: bool,

    /// Transform existing snapshots without extracting
    #[arg(long)]
    pub transform_only: bool,

    /// Template phases to run: staging, staging2, mart (default: all)
    #[arg(long = "phase")]
    pub phases: Vec<String>,

    /// Re-apply templates and start from clean temp databases
    #[arg(long)]
    pub force: bool,

    /// Concurrent extractions
    #[arg(long)]
    pub max_extracts: Option<usize>,

    /// Concurrent SQL transforms
    #[arg(long = "max-sql")]
    pub max_sql: Option<usize>,

    /// Plain log lines instead of progress bars
    #[arg(long)]
    pub no_progress: bool,

    /// Do not write a log file to the logs directory
    #[arg(long)]
    pub no_log_file: bool,
}

impl RunArgs {
    fn mode(&self) -> RunMode {
        if self.extract_only {
            RunMode::ExtractOnly
        } else if self.transform_only {
            RunMode::TransformOnly
        } else {
            RunMode::Full
        }
    }

    fn options(&self, cancel: CancellationFlag) -> Result<RunOptions, CliError> {
        let phases = self
            .phases
            .iter()
            .map(|p| Phase::from_str(p).map_err(CliError::InvalidArgument))
            .collect::<Result<Vec<_>, _>>()?;

        let mut options = RunOptions::new()
            .with_mode(self.mode())
            .with_phases(&phases)
            .with_force(self.force)
            .with_cancellation(cancel);
        if let Some(n) = self.max_extracts {
            options = options.with_max_extracts(n);
        }
        if let Some(n) = self.max_sql {
            options = options.with_max_transforms(n);
        }
        options.validate().map_err(CliError::InvalidArgument)?;
        Ok(options)
    }
}

/// Select datasets from the catalog
fn select_datasets(catalog: &DatasetCatalog, args: &RunArgs) -> Result<Vec<DatasetConfig>, CliError> {
    for id in &args.datasets {
        catalog.get(id)?;
    }

    let mut filter = DatasetFilter::new().with_ids(args.datasets.clone());
    if let Some(typ) = &args.typ {
        filter = filter.with_typ(typ);
    }
    // explicitly named datasets run even when disabled
    filter.include_disabled = !args.datasets.is_empty();

    let selected: Vec<DatasetConfig> = catalog
        .select(&filter)
        .into_iter()
        .filter(|d| match &args.pipeline {
            Some(pipeline) => d.pipeline() == Some(pipeline.as_str()),
            None => true,
        })
        .collect();

    if selected.is_empty() {
        return Err(CliError::InvalidArgument(
            "No datasets match the selection".to_string(),
        ));
    }
    Ok(selected)
}

/// Handle the `run` command
pub async fn handle_run(args: &RunArgs, settings: Settings) -> Result<(), CliError> {
    let cancel = CancellationFlag::new();
    let options = args.options(cancel.clone())?;
    let catalog = DatasetCatalog::load(&settings.datasets_file)?;
    let datasets = select_datasets(&catalog, args)?;

    let mut sinks: Vec<LogSink> = Vec::new();
    let run_log = if args.no_log_file {
        None
    } else {
        let log = RunLog::start(
            &settings.logs_dir,
            "pipeline",
            "getl pipeline log",
            settings.max_log_files,
        )?;
        info!(path = %log.path().display(), "Writing run log");
        sinks.push(log.sink());
        Some(log)
    };

    let progress = (!args.no_progress).then(PipelineProgress::new);
    if progress.is_none() {
        sinks.push(stdout_sink());
    }
    let sink = (!sinks.is_empty()).then(|| tee(sinks));

    let mut runner = PipelineRunner::new(settings, ExtractorRegistry::with_builtin())?;
    if let Some(progress) = &progress {
        runner = runner.with_events(progress.event_sink());
    }

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing running datasets");
            cancel.cancel();
        }
    });

    let report = runner.run(&datasets, &options, sink).await?;

    if let Some(progress) = &progress {
        progress.finish();
        report.print_summary();
    }
    drop(run_log);

    if report.is_success() {
        Ok(())
    } else {
        Err(CliError::PipelineFailed {
            failed: report.datasets_failed,
        })
    }
}
