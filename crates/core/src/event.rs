//! Pipeline events
//!
//! Every phase reports through one [`EventSink`]; front ends (CLI progress
//! bars, a TUI, a web socket) subscribe by passing their own callback.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Started,
    Progress,
    Completed,
    Failed,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Started => "started",
            EventKind::Progress => "progress",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One event from a running pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub kind: EventKind,
    /// Phase emitting the event (`extract`, `transform`, `merge`, `post_merge`)
    pub phase: String,
    /// Dataset the event concerns, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset: Option<String>,
    pub message: String,
    /// Fraction of the phase completed, 0.0 to 1.0
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u64>,
    /// 1-based step within the dataset (e.g. template index)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<usize>,
}

impl PipelineEvent {
    /// Create an event without dataset details
    pub fn new(kind: EventKind, phase: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            phase: phase.into(),
            dataset: None,
            message: message.into(),
            progress: None,
            rows: None,
            step: None,
            total_steps: None,
        }
    }

    pub fn started(phase: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventKind::Started, phase, message)
    }

    pub fn progress(phase: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventKind::Progress, phase, message)
    }

    pub fn completed(phase: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventKind::Completed, phase, message)
    }

    pub fn failed(phase: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventKind::Failed, phase, message)
    }

    /// Attach the dataset id
    pub fn for_dataset(mut self, dataset: impl Into<String>) -> Self {
        self.dataset = Some(dataset.into());
        self
    }

    /// Attach a completion fraction, clamped to 0.0..=1.0
    pub fn with_progress(mut self, fraction: f64) -> Self {
        self.progress = Some(fraction.clamp(0.0, 1.0));
        self
    }

    pub fn with_rows(mut self, rows: u64) -> Self {
        self.rows = Some(rows);
        self
    }

    pub fn with_step(mut self, step: usize, total: usize) -> Self {
        self.step = Some(step);
        self.total_steps = Some(total);
        self
    }
}

/// Subscriber for pipeline events
pub type EventSink = Arc<dyn Fn(PipelineEvent) + Send + Sync>;

/// Send an event to an optional sink
pub(crate) fn emit(sink: Option<&EventSink>, event: PipelineEvent) {
    if let Some(sink) = sink {
        sink(event);
    }
}

/// A sink that collects events into a shared vector
pub fn collecting_events() -> (EventSink, Arc<std::sync::Mutex<Vec<PipelineEvent>>>) {
    let events = Arc::new(std::sync::Mutex::new(Vec::new()));
    let captured = events.clone();
    let sink: EventSink = Arc::new(move |event| {
        if let Ok(mut events) = captured.lock() {
            events.push(event);
        }
    });
    (sink, events)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder() {
        let event = PipelineEvent::progress("extract", "Fetching roads")
            .for_dataset("roads")
            .with_progress(1.7)
            .with_rows(42)
            .with_step(2, 5);
        assert_eq!(event.kind, EventKind::Progress);
        assert_eq!(event.dataset.as_deref(), Some("roads"));
        assert_eq!(event.progress, Some(1.0));
        assert_eq!(event.rows, Some(42));
        assert_eq!(event.total_steps, Some(5));
    }

    #[test]
    fn test_event_serializes_compactly() {
        let event = PipelineEvent::completed("merge", "done");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "completed");
        assert!(json.get("dataset").is_none());
    }

    #[test]
    fn test_collecting_events() {
        let (sink, events) = collecting_events();
        emit(Some(&sink), PipelineEvent::started("extract", "go"));
        emit(None, PipelineEvent::started("extract", "dropped"));
        assert_eq!(events.lock().unwrap().len(), 1);
    }
}
