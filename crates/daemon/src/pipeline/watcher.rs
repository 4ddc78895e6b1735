use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::bus::Bus;
use common::cache::KeyCache;
use common::cas::{CasClient, CasError};
use common::ledger::{Bucket, ContentKey, TrustLedger};
use tokio::sync::{watch, OnceCell};
use walkdir::WalkDir;

use super::{files_window, UploadInfo, UPLOAD_INFO_FILE};

/// Path components that mark a subtree as scratch space, never content
const CACHE_COMPONENT: &str = "cache";

#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Cas(#[from] CasError),
    #[error("failed to encode side-car: {0}")]
    SideCar(#[from] toml::ser::Error),
    #[error("{0} has no file name")]
    NoFileName(PathBuf),
    #[error("failed to announce: {0}")]
    Bus(String),
}

/// Outcome of one pass over the watch directory
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    /// Unseen files found this pass
    pub found: usize,
    pub imported: Vec<ContentKey>,
    pub failed: usize,
}

/// Imports new files from a directory and announces them in `files`
pub struct Watcher<L: TrustLedger> {
    bus: Bus<L>,
    cas: Arc<dyn CasClient>,
    watch_dir: PathBuf,
    staging_dir: PathBuf,
    seen: KeyCache<PathBuf>,
    poll_interval: Duration,
    node_id: OnceCell<String>,
}

impl<L: TrustLedger> Watcher<L> {
    pub fn new(
        bus: Bus<L>,
        cas: Arc<dyn CasClient>,
        watch_dir: PathBuf,
        staging_dir: PathBuf,
        seen: KeyCache<PathBuf>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            bus,
            cas,
            watch_dir,
            staging_dir,
            seen,
            poll_interval,
            node_id: OnceCell::new(),
        }
    }

    /// Scan until shutdown, idling `poll_interval` between passes
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<()>) {
        tracing::info!(
            watch_dir = %self.watch_dir.display(),
            poll_interval = ?self.poll_interval,
            "directory watcher started"
        );
        loop {
            if shutdown_rx.has_changed().unwrap_or(true) {
                break;
            }

            let report = self.scan_once().await;
            if report.found > 0 {
                tracing::info!(
                    found = report.found,
                    imported = report.imported.len(),
                    failed = report.failed,
                    "scan finished"
                );
            }

            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        tracing::info!("directory watcher stopped");
    }

    /// One pass: import and announce every file not seen before
    ///
    /// A failure on one file is logged and counted; the pass carries on.
    pub async fn scan_once(&self) -> ScanReport {
        let mut report = ScanReport::default();

        for path in self.candidates().await {
            if self.seen.contains(&path) {
                continue;
            }
            report.found += 1;

            match self.import(&path).await {
                Ok(key) => {
                    tracing::info!(path = %path.display(), %key, "vouched for new file");
                    report.imported.push(key);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to import file");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Regular files under the watch directory, minus cache and staging trees
    async fn candidates(&self) -> Vec<PathBuf> {
        let watch_dir = self.watch_dir.clone();
        let staging_dir = self.staging_dir.clone();

        let walk = tokio::task::spawn_blocking(move || {
            WalkDir::new(&watch_dir)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|entry| {
                    !is_cache(entry.path().strip_prefix(&watch_dir).unwrap_or(entry.path()))
                        && !entry.path().starts_with(&staging_dir)
                })
                .filter_map(|entry| match entry {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping unreadable path");
                        None
                    }
                })
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| entry.into_path())
                .collect::<Vec<_>>()
        });

        match walk.await {
            Ok(paths) => paths,
            Err(e) => {
                tracing::error!(error = %e, "directory walk panicked");
                Vec::new()
            }
        }
    }

    async fn node_id(&self) -> Result<&str, CasError> {
        self.node_id
            .get_or_try_init(|| self.cas.node_id())
            .await
            .map(String::as_str)
    }

    async fn import(&self, path: &Path) -> Result<ContentKey, WatcherError> {
        let filename = path
            .file_name()
            .ok_or_else(|| WatcherError::NoFileName(path.to_path_buf()))?;
        let (stage, reused) = self.stage_dir_for(path, filename).await?;
        if reused {
            tracing::debug!(stage = %stage.display(), "reusing staging directory");
        }

        let key = match self.stage_and_add(path, filename, &stage, !reused).await {
            Ok(key) => key,
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_dir_all(&stage).await {
                    tracing::debug!(error = %cleanup, "failed to remove staging directory");
                }
                return Err(e);
            }
        };
        self.seen.insert(path.to_path_buf());

        self.bus
            .propose(Bucket::Files, key.clone(), files_window(Utc::now()), true)
            .await
            .map_err(|e| WatcherError::Bus(e.to_string()))?;
        Ok(key)
    }

    async fn stage_and_add(
        &self,
        path: &Path,
        filename: &OsStr,
        stage: &Path,
        link: bool,
    ) -> Result<ContentKey, WatcherError> {
        let modified = tokio::fs::metadata(path).await?.modified()?;
        let staged_file = stage.join(filename);
        if link {
            if let Err(e) = tokio::fs::hard_link(path, &staged_file).await {
                tracing::debug!(error = %e, "hard link failed, copying instead");
                tokio::fs::copy(path, &staged_file).await?;
                // lets a later pass recognise the copy
                tokio::fs::OpenOptions::new()
                    .write(true)
                    .open(&staged_file)
                    .await?
                    .into_std()
                    .await
                    .set_modified(modified)?;
            }
        }

        let info = UploadInfo {
            filename: filename.to_string_lossy().to_string(),
            ctime: DateTime::<Utc>::from(modified),
            upload_node: self.node_id().await?.to_string(),
        };
        tokio::fs::write(stage.join(UPLOAD_INFO_FILE), toml::to_string(&info)?).await?;

        Ok(self.cas.add(stage).await?)
    }

    /// Find the staging directory already holding `path`, or create one
    ///
    /// Candidates are `<staging>/<name>`, then `<name>.<n>`. The first one
    /// whose staged file is `path` is reused, otherwise the first free name
    /// is created. Returns the directory and whether it was reused.
    async fn stage_dir_for(
        &self,
        path: &Path,
        filename: &OsStr,
    ) -> Result<(PathBuf, bool), WatcherError> {
        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let source = tokio::fs::metadata(path).await?;

        let base = filename.to_string_lossy();
        let mut n = 0u32;
        loop {
            let candidate = if n == 0 {
                self.staging_dir.join(filename)
            } else {
                self.staging_dir.join(format!("{}.{}", base, n))
            };
            match tokio::fs::create_dir(&candidate).await {
                Ok(()) => return Ok((candidate, false)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if let Ok(staged) = tokio::fs::metadata(candidate.join(filename)).await {
                        if is_staged_copy_of(&staged, &source) {
                            return Ok((candidate, true));
                        }
                    }
                    n += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Whether `staged` is the staging link or copy of the file `source`
#[cfg(unix)]
fn is_staged_copy_of(staged: &std::fs::Metadata, source: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;

    if staged.dev() == source.dev() && staged.ino() == source.ino() {
        return true;
    }
    // a hard link to some other source is never a copy of this one
    staged.nlink() == 1 && same_length_and_mtime(staged, source)
}

#[cfg(not(unix))]
fn is_staged_copy_of(staged: &std::fs::Metadata, source: &std::fs::Metadata) -> bool {
    same_length_and_mtime(staged, source)
}

fn same_length_and_mtime(a: &std::fs::Metadata, b: &std::fs::Metadata) -> bool {
    a.len() == b.len()
        && matches!((a.modified(), b.modified()), (Ok(a), Ok(b)) if a == b)
}

fn is_cache(relative: &Path) -> bool {
    relative
        .components()
        .any(|c| matches!(c, Component::Normal(name) if name == CACHE_COMPONENT))
}
