//! Human-readable log sink shared by every phase

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

/// Callback receiving progress lines meant for people
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Send a line to an optional sink
pub(crate) fn log_line(sink: Option<&LogSink>, line: impl AsRef<str>) {
    if let Some(sink) = sink {
        sink(line.as_ref());
    }
}

/// A sink that collects lines into a shared vector
pub fn collecting_sink() -> (LogSink, Arc<Mutex<Vec<String>>>) {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let captured = lines.clone();
    let sink: LogSink = Arc::new(move |line: &str| {
        if let Ok(mut lines) = captured.lock() {
            lines.push(line.to_string());
        }
    });
    (sink, lines)
}

/// A sink that prints every line to stdout
pub fn stdout_sink() -> LogSink {
    Arc::new(|line: &str| println!("{line}"))
}

const RULE_WIDTH: usize = 58;

/// A timestamped log file for one run
///
/// `start` writes a header naming the run and prunes older logs with the same
/// prefix. Dropping the log writes the footer.
#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl RunLog {
    /// Create `{logs_dir}/{prefix}_{YYYY-mm-dd_HHMMSS}.log`
    ///
    /// With `max_files` set, only the newest `max_files` logs matching
    /// `{prefix}_*.log` are kept, the new one included.
    pub fn start(
        logs_dir: &Path,
        prefix: &str,
        title: &str,
        max_files: Option<usize>,
    ) -> std::io::Result<Self> {
        std::fs::create_dir_all(logs_dir)?;
        let now = chrono::Local::now();
        let path = logs_dir.join(format!("{prefix}_{}.log", now.format("%Y-%m-%d_%H%M%S")));

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        writeln!(file, "# {title}")?;
        writeln!(file, "# Started: {}", now.to_rfc3339())?;
        writeln!(file, "# {}\n", "=".repeat(RULE_WIDTH))?;
        file.flush()?;

        if let Some(keep) = max_files {
            let removed = prune_logs(logs_dir, prefix, keep)?;
            if removed > 0 {
                debug!(removed, keep, "Pruned old log files");
            }
        }

        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A sink appending `[HH:MM:SS] line` to this log
    pub fn sink(&self) -> LogSink {
        let file = self.file.clone();
        Arc::new(move |line: &str| {
            if let Ok(mut file) = file.lock() {
                let stamp = chrono::Local::now().format("%H:%M:%S");
                let _ = writeln!(file, "[{stamp}] {line}");
            }
        })
    }
}

impl Drop for RunLog {
    fn drop(&mut self) {
        if let Ok(mut file) = self.file.lock() {
            let footer = format!(
                "\n# {}\n# Finished: {}\n",
                "=".repeat(RULE_WIDTH),
                chrono::Local::now().to_rfc3339()
            );
            let written = file.write_all(footer.as_bytes());
            if let Err(e) = written.and_then(|()| file.flush()) {
                warn!(path = %self.path.display(), error = %e, "Failed to finish run log");
            }
        }
    }
}

/// Delete all but the newest `keep` files matching `{prefix}_*.log`
///
/// Newest is by modification time, then by name. Files that cannot be
/// removed are skipped. Returns the number of files deleted.
pub fn prune_logs(logs_dir: &Path, prefix: &str, keep: usize) -> std::io::Result<usize> {
    let pattern = format!(
        "{}/{}_*.log",
        glob::Pattern::escape(&logs_dir.to_string_lossy()),
        glob::Pattern::escape(prefix)
    );
    let paths = glob::glob(&pattern)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    let mut logs: Vec<(std::time::SystemTime, PathBuf)> = paths
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .map(|p| {
            let modified = p
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::UNIX_EPOCH);
            (modified, p)
        })
        .collect();
    logs.sort_by(|a, b| b.cmp(a));

    let mut removed = 0;
    for (_, old) in logs.into_iter().skip(keep) {
        match std::fs::remove_file(&old) {
            Ok(()) => removed += 1,
            Err(e) => debug!(path = %old.display(), error = %e, "Could not remove old log"),
        }
    }
    Ok(removed)
}

/// A sink forwarding every line to each of `sinks`
pub fn tee(sinks: Vec<LogSink>) -> LogSink {
    Arc::new(move |line: &str| {
        for sink in &sinks {
            sink(line);
        }
    })
}
