//! Pipeline orchestration
//!
//! [`PipelineRunner`] drives one run end to end. Callers observe progress
//! through an [`EventSink`](crate::event::EventSink) and human-readable lines
//! through a [`LogSink`](crate::sink::LogSink), and get a
//! [`PipelineReport`] back when the run completes.
//!
//! # Example
//!
//! ```rust,ignore
//! use getl_core::pipeline::{PipelineRunner, RunOptions};
//!
//! let runner = PipelineRunner::new(settings, ExtractorRegistry::with_builtin())?;
//! let report = runner.run(&datasets, &RunOptions::new(), None).await?;
//! report.print_summary();
//! ```

mod config;
mod error;
mod report;
mod runner;

pub use config::{RunMode, RunOptions};
pub use error::{PipelineError, PipelineResult};
pub use report::{DatasetFailure, PipelineReport};
pub use runner::PipelineRunner;

pub use crate::transform::{Phase, Phases};
