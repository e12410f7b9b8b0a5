//! Cooperative run cancellation

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Run-level cancellation flag
///
/// Checked before each dataset task starts. Tasks already running finish
/// normally; tasks not yet started are reported as skipped.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
