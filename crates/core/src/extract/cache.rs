//! Shared download cache
//!
//! Concurrent extraction tasks asking for the same URL wait on one entry
//! lock, so each URL is fetched at most once per extraction phase.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use super::error::ExtractError;

type Slot = Arc<AsyncMutex<Option<PathBuf>>>;

/// Download progress callback: bytes written so far and the total size if known
pub type DownloadProgress = Arc<dyn Fn(u64, Option<u64>) + Send + Sync>;

/// URL to local file cache
#[derive(Debug)]
pub struct DownloadCache {
    dir: PathBuf,
    entries: std::sync::Mutex<HashMap<String, Slot>>,
}

impl DownloadCache {
    /// Create a cache storing files under `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            entries: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Local file a URL is cached under
    ///
    /// A short hash of the URL keeps different URLs with the same basename apart.
    pub fn path_for(&self, url: &str) -> PathBuf {
        let digest = Sha256::digest(url.as_bytes());
        let hash: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
        let base = url
            .split(['?', '#'])
            .next()
            .and_then(|u| u.rsplit('/').next())
            .filter(|b| !b.is_empty())
            .unwrap_or("download");
        self.dir.join(format!("{hash}_{base}"))
    }

    fn slot(&self, url: &str) -> Result<Slot, ExtractError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| ExtractError::Source("download cache lock poisoned".to_string()))?;
        Ok(entries.entry(url.to_string()).or_default().clone())
    }

    /// Return the cached file for `url`, running `fetch` once if absent
    ///
    /// `fetch` receives the target path and must leave the file there on
    /// success. A failed fetch leaves the entry empty so a later caller retries.
    pub async fn get_or_fetch<F, Fut>(&self, url: &str, fetch: F) -> Result<PathBuf, ExtractError>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = Result<(), ExtractError>>,
    {
        let slot = self.slot(url)?;
        let mut cached = slot.lock().await;
        if let Some(path) = cached.as_ref() {
            if path.exists() {
                debug!(url, path = %path.display(), "Download cache hit");
                return Ok(path.clone());
            }
        }

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ExtractError::io(&self.dir, e))?;
        let target = self.path_for(url);
        fetch(target.clone()).await?;
        *cached = Some(target.clone());
        Ok(target)
    }

    /// Download `url` over HTTP(S) into the cache
    ///
    /// The body is streamed to a `.partial` file that is renamed on
    /// completion. `progress` is called as bytes arrive.
    #[cfg(feature = "http")]
    pub async fn download(
        &self,
        url: &str,
        progress: Option<DownloadProgress>,
    ) -> Result<PathBuf, ExtractError> {
        self.get_or_fetch(url, |target| fetch_url(url.to_string(), target, progress))
            .await
    }

    #[cfg(not(feature = "http"))]
    pub async fn download(
        &self,
        url: &str,
        _progress: Option<DownloadProgress>,
    ) -> Result<PathBuf, ExtractError> {
        Err(ExtractError::Download {
            url: url.to_string(),
            message: "built without the `http` feature".to_string(),
        })
    }

    /// Number of URLs with a cache entry
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry and delete the cached files
    ///
    /// Entries still locked by an in-flight fetch are dropped from the map
    /// but their files are left alone. Returns the number of files removed.
    pub fn clear(&self) -> usize {
        let drained: Vec<(String, Slot)> = match self.entries.lock() {
            Ok(mut entries) => entries.drain().collect(),
            Err(_) => return 0,
        };

        let mut removed = 0;
        for (url, slot) in drained {
            let Ok(cached) = slot.try_lock() else {
                continue;
            };
            if let Some(path) = cached.as_ref() {
                match std::fs::remove_file(path) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!(url, path = %path.display(), error = %e, "Failed to remove cached download"),
                }
            }
        }
        removed
    }
}

#[cfg(feature = "http")]
async fn fetch_url(
    url: String,
    target: PathBuf,
    progress: Option<DownloadProgress>,
) -> Result<(), ExtractError> {
    use tokio::io::AsyncWriteExt;

    let download_err = |message: String| ExtractError::Download {
        url: url.clone(),
        message,
    };

    let mut response = reqwest::get(&url)
        .await
        .map_err(|e| download_err(e.to_string()))?
        .error_for_status()
        .map_err(|e| download_err(e.to_string()))?;
    let total = response.content_length();

    let partial = target.with_extension("partial");
    let mut file = tokio::fs::File::create(&partial)
        .await
        .map_err(|e| ExtractError::io(&partial, e))?;

    let mut reporter = ProgressThrottle::new(progress, total);
    let mut written: u64 = 0;
    loop {
        let chunk = match response.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                drop(file);
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(download_err(e.to_string()));
            }
        };
        file.write_all(&chunk)
            .await
            .map_err(|e| ExtractError::io(&partial, e))?;
        written += chunk.len() as u64;
        reporter.update(written);
    }
    file.flush()
        .await
        .map_err(|e| ExtractError::io(&partial, e))?;
    drop(file);
    reporter.finish(written);

    tokio::fs::rename(&partial, &target)
        .await
        .map_err(|e| ExtractError::io(&target, e))?;
    debug!(url = %url, bytes = written, "Downloaded");
    Ok(())
}

#[cfg(feature = "http")]
/// Rate-limits download progress callbacks
///
/// Reports on every whole percent when the size is known, otherwise every
/// [`UNSIZED_REPORT_BYTES`].
struct ProgressThrottle {
    progress: Option<DownloadProgress>,
    total: Option<u64>,
    last: u64,
}

#[cfg(feature = "http")]
const UNSIZED_REPORT_BYTES: u64 = 8 * 1024 * 1024;

#[cfg(feature = "http")]
impl ProgressThrottle {
    fn new(progress: Option<DownloadProgress>, total: Option<u64>) -> Self {
        Self {
            progress,
            total: total.filter(|t| *t > 0),
            last: 0,
        }
    }

    fn mark(&self, written: u64) -> u64 {
        match self.total {
            Some(total) => written.saturating_mul(100) / total,
            None => written / UNSIZED_REPORT_BYTES,
        }
    }

    fn update(&mut self, written: u64) {
        let Some(progress) = self.progress.as_ref() else {
            return;
        };
        let mark = self.mark(written);
        if mark > self.last {
            self.last = mark;
            progress(written, self.total);
        }
    }

    fn finish(&self, written: u64) {
        if let Some(progress) = self.progress.as_ref() {
            progress(written, self.total);
        }
    }
}

/// Human-readable byte count (`1.5 MB`)
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
