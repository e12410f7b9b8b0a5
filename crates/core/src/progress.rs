//! Terminal progress bars driven by pipeline events
//!
//! One bar per phase, created on the phase's first event and advanced by the
//! completion fraction the phase reports. Dataset failures are printed above
//! the bars.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::event::{EventKind, EventSink, PipelineEvent};

const BAR_LENGTH: u64 = 1000;

/// Progress display for a pipeline run
#[derive(Clone)]
pub struct PipelineProgress {
    multi: MultiProgress,
    bars: Arc<Mutex<HashMap<String, ProgressBar>>>,
}

impl Default for PipelineProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// An event sink feeding this display
    pub fn event_sink(&self) -> EventSink {
        let progress = self.clone();
        Arc::new(move |event: PipelineEvent| progress.handle(&event))
    }

    /// Apply one event
    pub fn handle(&self, event: &PipelineEvent) {
        let bar = self.bar_for(&event.phase);

        match (&event.dataset, event.kind) {
            (Some(dataset), EventKind::Failed) => {
                bar.println(format!("  ✗ {}: {}", dataset, event.message));
            }
            (Some(dataset), EventKind::Completed) => {
                bar.set_message(format!("{} ✓", dataset));
            }
            (Some(dataset), _) => {
                bar.set_message(format!("{}: {}", dataset, event.message));
            }
            (None, EventKind::Completed) => {
                bar.set_position(BAR_LENGTH);
                bar.finish_with_message(format!("✓ {}", event.message));
            }
            (None, EventKind::Failed) => {
                bar.abandon_with_message(format!("✗ {}", event.message));
            }
            (None, _) => bar.set_message(event.message.clone()),
        }

        if let Some(fraction) = event.progress {
            if !bar.is_finished() {
                bar.set_position((fraction * BAR_LENGTH as f64).round() as u64);
            }
        }
    }

    /// Stop every bar that has not finished
    pub fn finish(&self) {
        if let Ok(bars) = self.bars.lock() {
            for bar in bars.values().filter(|b| !b.is_finished()) {
                bar.finish_and_clear();
            }
        }
    }

    fn bar_for(&self, phase: &str) -> ProgressBar {
        let Ok(mut bars) = self.bars.lock() else {
            return ProgressBar::hidden();
        };
        bars.entry(phase.to_string())
            .or_insert_with(|| {
                let bar = self.multi.add(ProgressBar::new(BAR_LENGTH));
                bar.set_style(phase_style());
                bar.set_prefix(phase.to_string());
                bar.enable_steady_tick(Duration::from_millis(100));
                bar
            })
            .clone()
    }
}

fn phase_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{spinner:.green} {prefix:>10} [{elapsed_precise}] {bar:30.cyan/blue} {percent:>3}% {msg}",
    )
    .map(|style| style.progress_chars("█▓▒░  "))
    .unwrap_or_else(|_| ProgressStyle::default_bar())
}

/// Format a number with thousand separators
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}
