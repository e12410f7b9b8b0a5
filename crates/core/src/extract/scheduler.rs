//! Bounded-concurrency extraction
//!
//! One task per dataset, at most `max_concurrency` extractor calls in flight.
//! Failures stay per dataset; a failed extraction never cancels its siblings.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::error::ExtractError;
use super::extractor::ExtractContext;
use super::registry::ExtractorRegistry;
use crate::cancel::CancellationFlag;
use crate::catalog::DatasetConfig;
use crate::event::{EventSink, PipelineEvent, emit};

const PHASE: &str = "extract";

/// Aggregate outcome of an extraction phase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelExtractResult {
    /// True when no dataset failed
    pub success: bool,
    /// `(dataset id, snapshot path)` in input order
    pub succeeded: Vec<(String, PathBuf)>,
    /// `(dataset id, error text)` in input order, cancelled datasets included
    pub failed: Vec<(String, String)>,
    /// Datasets never started because the run was cancelled
    pub skipped: Vec<String>,
    /// Rows extracted across all succeeded datasets
    pub total_rows: u64,
}

impl ParallelExtractResult {
    /// Number of datasets accounted for
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    fn sort_by_input(&mut self, datasets: &[DatasetConfig]) {
        let position: HashMap<&str, usize> = datasets
            .iter()
            .enumerate()
            .map(|(i, d)| (d.id.as_str(), i))
            .collect();
        let key = |id: &String| position.get(id.as_str()).copied().unwrap_or(usize::MAX);
        self.succeeded.sort_by_key(|(id, _)| key(id));
        self.failed.sort_by_key(|(id, _)| key(id));
        self.skipped.sort_by_key(key);
    }
}

/// Runs extractors for many datasets under a concurrency bound
pub struct ExtractScheduler {
    registry: ExtractorRegistry,
    ctx: ExtractContext,
    output_dir: PathBuf,
    cancel: CancellationFlag,
    events: Option<EventSink>,
}

impl ExtractScheduler {
    /// Create a scheduler writing snapshots into `output_dir`
    pub fn new(registry: ExtractorRegistry, ctx: ExtractContext, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            ctx,
            output_dir: output_dir.into(),
            cancel: CancellationFlag::new(),
            events: None,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Subscribe to extraction events, including download progress
    pub fn with_events(mut self, events: Option<EventSink>) -> Self {
        self.ctx.events = events.clone();
        self.events = events;
        self
    }

    pub fn context(&self) -> &ExtractContext {
        &self.ctx
    }

    /// Extract every dataset, at most `max_concurrency` at a time
    ///
    /// Always returns once every started task has finished. The download
    /// cache is cleared before returning.
    pub async fn run_parallel_extract(
        &self,
        datasets: &[DatasetConfig],
        max_concurrency: usize,
    ) -> ParallelExtractResult {
        let limit = max_concurrency.max(1);
        let total = datasets.len();
        let semaphore = Arc::new(Semaphore::new(limit));
        let finished = Arc::new(AtomicUsize::new(0));
        let mut join_set = JoinSet::new();
        let mut outstanding: HashSet<String> = HashSet::new();
        let mut result = ParallelExtractResult::default();

        info!(datasets = total, max_concurrency = limit, "Starting extraction");
        self.ctx.log(format!(
            "Extracting {total} dataset(s), up to {limit} at a time"
        ));
        emit(
            self.events.as_ref(),
            PipelineEvent::started(PHASE, format!("Extracting {total} datasets")).with_progress(0.0),
        );

        for (index, dataset) in datasets.iter().enumerate() {
            // Permit first, then the cancellation check: a task that has to
            // wait for a slot still observes a cancel issued while it waited.
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!(error = %e, "Extraction semaphore closed");
                    break;
                }
            };

            if self.cancel.is_cancelled() {
                for skipped in &datasets[index..] {
                    self.record_skipped(&mut result, &skipped.id);
                }
                warn!(skipped = total - index, "Extraction cancelled");
                break;
            }

            let extractor = match self.registry.get(&dataset.plugin) {
                Ok(extractor) => extractor,
                Err(e) => {
                    drop(permit);
                    let done = finished.fetch_add(1, Ordering::SeqCst) + 1;
                    self.record_failure(&mut result, &dataset.id, &e, done, total);
                    continue;
                }
            };

            let dataset = dataset.clone();
            let ctx = self.ctx.clone();
            let output_dir = self.output_dir.clone();
            let events = self.events.clone();
            let finished = finished.clone();
            outstanding.insert(dataset.id.clone());

            join_set.spawn(async move {
                let _permit = permit;
                let id = dataset.id.clone();
                emit(
                    events.as_ref(),
                    PipelineEvent::started(PHASE, format!("Extracting {id}")).for_dataset(&id),
                );
                debug!(dataset = %id, plugin = %dataset.plugin, "Extraction task started");

                let timeout = ctx.timeout;
                let timed_out = ExtractError::Timeout {
                    dataset: id.clone(),
                    seconds: timeout.as_secs(),
                };
                // Inner spawn isolates panics in connector code.
                let work = tokio::spawn(async move {
                    tokio::time::timeout(
                        timeout,
                        extractor.extract_to_snapshot(&dataset, &ctx, &output_dir),
                    )
                    .await
                });
                let outcome = match work.await {
                    Ok(Ok(Ok(extract))) if extract.success => match extract.snapshot_path {
                        Some(path) => Ok((extract.rows, path)),
                        None => Err(format!("no snapshot produced: {}", extract.message)),
                    },
                    Ok(Ok(Ok(extract))) => Err(extract.message),
                    Ok(Ok(Err(e))) => Err(e.to_string()),
                    Ok(Err(_elapsed)) => Err(timed_out.to_string()),
                    Err(join_err) => Err(ExtractError::Task(join_err.to_string()).to_string()),
                };

                let done = finished.fetch_add(1, Ordering::SeqCst) + 1;
                let fraction = done as f64 / total.max(1) as f64;
                let event = match &outcome {
                    Ok((rows, _)) => PipelineEvent::completed(PHASE, format!("Extracted {id}"))
                        .with_rows(*rows),
                    Err(message) => PipelineEvent::failed(PHASE, message.clone()),
                };
                emit(events.as_ref(), event.for_dataset(&id).with_progress(fraction));

                (id, outcome)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((id, Ok((rows, path)))) => {
                    outstanding.remove(&id);
                    info!(dataset = %id, rows, "Extraction complete");
                    self.ctx.log(format!("  ✓ {id}: {rows} rows"));
                    result.total_rows += rows;
                    result.succeeded.push((id, path));
                }
                Ok((id, Err(message))) => {
                    outstanding.remove(&id);
                    warn!(dataset = %id, error = %message, "Extraction failed");
                    self.ctx.log(format!("  ✗ {id}: {message}"));
                    result.failed.push((id, message));
                }
                Err(e) => {
                    error!(error = %e, "Extraction task aborted");
                }
            }
        }

        for id in outstanding {
            result.failed.push((id, "extraction task aborted".to_string()));
        }

        let removed = self.ctx.cache.clear();
        debug!(removed, "Download cache cleared");

        result.sort_by_input(datasets);
        result.success = result.failed.is_empty();

        info!(
            succeeded = result.succeeded.len(),
            failed = result.failed.len(),
            skipped = result.skipped.len(),
            rows = result.total_rows,
            "Extraction finished"
        );
        self.ctx.log(format!(
            "Extracted {}/{} dataset(s), {} failed",
            result.succeeded.len(),
            total,
            result.failed.len()
        ));
        let summary = PipelineEvent::completed(
            PHASE,
            format!(
                "Extracted {} of {} datasets",
                result.succeeded.len(),
                total
            ),
        )
        .with_rows(result.total_rows)
        .with_progress(1.0);
        emit(self.events.as_ref(), summary);

        result
    }

    fn record_failure(
        &self,
        result: &mut ParallelExtractResult,
        id: &str,
        err: &ExtractError,
        done: usize,
        total: usize,
    ) {
        warn!(dataset = %id, error = %err, "Extraction failed");
        self.ctx.log(format!("  ✗ {id}: {err}"));
        emit(
            self.events.as_ref(),
            PipelineEvent::failed(PHASE, err.to_string())
                .for_dataset(id)
                .with_progress(done as f64 / total.max(1) as f64),
        );
        result.failed.push((id.to_string(), err.to_string()));
    }

    fn record_skipped(&self, result: &mut ParallelExtractResult, id: &str) {
        let message = ExtractError::Cancelled.to_string();
        self.ctx.log(format!("  - {id}: {message}"));
        emit(
            self.events.as_ref(),
            PipelineEvent::failed(PHASE, message.clone()).for_dataset(id),
        );
        result.skipped.push(id.to_string());
        result.failed.push((id.to_string(), message));
    }
}
