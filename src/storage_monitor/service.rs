//! Storage Monitor service
//!
//! Deletion order is fixed: files whose data reached the collector go first,
//! oldest first; unsent files are only touched once no sent candidate remains.
//! Free space is re-checked after every batch so a pass never deletes more
//! than the condition requires.

use super::space::SpaceProbe;
use super::types::{
    CaptureFile, CleanupSummary, CleanupTrigger, FileError, StorageMonitorConfig, StorageStatus,
};
use crate::error::{Error, Result};
use crate::record_store::RecordStore;
use crate::worker::Workers;
use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::fs;
use tokio::sync::{Mutex, RwLock};

/// Recursive listing of regular files; a missing directory is an empty listing
pub async fn scan_capture_dir(dir: &Path) -> Result<Vec<CaptureFile>> {
    let mut files = Vec::new();
    if !fs::try_exists(dir).await.unwrap_or(false) {
        return Ok(files);
    }

    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = match fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(path = %current.display(), error = %e, "Cannot read capture directory");
                continue;
            }
        };

        while let Some(entry) = entries.next_entry().await? {
            let file_type = match entry.file_type().await {
                Ok(t) => t,
                Err(_) => continue,
            };
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                // vanished between listing and stat: skip
                if let Ok(meta) = entry.metadata().await {
                    files.push(CaptureFile {
                        path: entry.path(),
                        size: meta.len(),
                        modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                        sent: true,
                    });
                }
            }
        }
    }

    Ok(files)
}

/// `.` and `..` resolved without touching the filesystem
fn lexical_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Spell a recorded image path the way a scan of the canonical `root` does.
///
/// Relative paths are tried as given, then against `root`. A path that no
/// longer resolves is cleaned lexically; it cannot match a scanned file anyway.
fn normalize_recorded_path(raw: &str, root: &Path) -> PathBuf {
    let path = Path::new(raw);
    if let Ok(real) = std::fs::canonicalize(path) {
        return real;
    }
    if path.is_relative() {
        let joined = root.join(path);
        return std::fs::canonicalize(&joined).unwrap_or_else(|_| lexical_clean(&joined));
    }
    lexical_clean(path)
}

/// Sent before unsent, oldest first within each partition
pub fn order_candidates(files: &mut [CaptureFile]) {
    files.sort_by_key(|f| (!f.sent, f.modified));
}

fn to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

/// Reconcile logic shared by on-demand calls and the periodic loop
#[derive(Clone)]
struct Reconciler {
    config: Arc<StorageMonitorConfig>,
    store: RecordStore,
    space: Arc<dyn SpaceProbe>,
    status: Arc<RwLock<Option<StorageStatus>>>,
    last_summary: Arc<RwLock<Option<CleanupSummary>>>,
}

impl Reconciler {
    /// Scan the capture directory and mark files still referenced by unsent records.
    ///
    /// Both sides are compared in canonical form, so a capture dir configured
    /// with `.`, `..` or a symlink still matches what the pipeline recorded.
    async fn joined_files(&self) -> Result<Vec<CaptureFile>> {
        let configured = &self.config.capture_dir;
        let root = fs::canonicalize(configured)
            .await
            .unwrap_or_else(|_| configured.clone());
        let mut files = scan_capture_dir(&root).await?;

        let recorded = self.store.unsent_image_paths().await?;
        let base = root.clone();
        let unsent: HashSet<PathBuf> = tokio::task::spawn_blocking(move || {
            recorded
                .iter()
                .map(|raw| normalize_recorded_path(raw, &base))
                .collect()
        })
        .await
        .map_err(|e| Error::Internal(format!("path normalization task failed: {}", e)))?;

        for file in files.iter_mut() {
            file.sent = !unsent.contains(&file.path);
        }
        tracing::debug!(
            root = %root.display(),
            files = files.len(),
            unsent_paths = unsent.len(),
            "Capture files joined with records"
        );
        Ok(files)
    }

    fn is_low(&self) -> Result<bool> {
        let space = self.space.space(&self.config.capture_dir)?;
        Ok(space.free_bytes < self.config.min_free_bytes())
    }

    async fn refresh_status(&self) -> Result<StorageStatus> {
        let files = self.joined_files().await?;
        let space = self.space.space(&self.config.capture_dir)?;

        let sent_files = files.iter().filter(|f| f.sent).count();
        let status = StorageStatus {
            capture_dir: self.config.capture_dir.display().to_string(),
            total_bytes: space.total_bytes,
            used_bytes: space.used_bytes(),
            free_bytes: space.free_bytes,
            min_free_bytes: self.config.min_free_bytes(),
            capture_bytes: files.iter().map(|f| f.size).sum(),
            file_count: files.len(),
            sent_files,
            unsent_files: files.len() - sent_files,
            oldest_file_at: files.iter().map(|f| f.modified).min().map(to_utc),
            newest_file_at: files.iter().map(|f| f.modified).max().map(to_utc),
            computed_at: Utc::now(),
        };

        *self.status.write().await = Some(status.clone());
        Ok(status)
    }

    async fn delete_one(&self, file: &CaptureFile, now: SystemTime, summary: &mut CleanupSummary) {
        let age = now.duration_since(file.modified).unwrap_or(Duration::ZERO);
        if age < self.config.in_use_grace {
            summary.skipped_in_use += 1;
            return;
        }

        match fs::remove_file(&file.path).await {
            Ok(()) => {
                summary.record_deleted(file);
                tracing::debug!(path = %file.path.display(), sent = file.sent, "Deleted capture");
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                summary.already_missing += 1;
            }
            Err(e) => {
                tracing::warn!(
                    path = %file.path.display(),
                    error = %e,
                    "Failed to delete capture, will retry next cycle"
                );
                summary.errors.push(FileError {
                    path: file.key(),
                    error: e.to_string(),
                });
            }
        }
    }

    async fn reconcile(&self) -> Result<CleanupSummary> {
        let started = Instant::now();
        let now = SystemTime::now();
        let cutoff = now.checked_sub(self.config.retention()).unwrap_or(SystemTime::UNIX_EPOCH);
        let is_expired = |f: &CaptureFile| f.modified < cutoff;

        let mut low_space = self.is_low()?;
        let files = self.joined_files().await?;
        let any_expired = files.iter().any(|f| is_expired(f));

        let trigger = CleanupTrigger::from_conditions(low_space, any_expired);
        let mut summary = CleanupSummary::new(trigger);

        if trigger != CleanupTrigger::None {
            let mut candidates: Vec<CaptureFile> = if low_space {
                files
            } else {
                files.into_iter().filter(|f| is_expired(f)).collect()
            };
            order_candidates(&mut candidates);
            let mut queue: VecDeque<CaptureFile> = candidates.into();

            let batch_size = self.config.batch_size.max(1);
            loop {
                if !low_space {
                    queue.retain(|f| is_expired(f));
                }
                if queue.is_empty() {
                    break;
                }

                let take = batch_size.min(queue.len());
                for file in queue.drain(..take).collect::<Vec<_>>() {
                    self.delete_one(&file, now, &mut summary).await;
                }

                if low_space {
                    low_space = match self.is_low() {
                        Ok(low) => low,
                        Err(e) => {
                            tracing::warn!(error = %e, "Free space re-check failed, ending pass");
                            break;
                        }
                    };
                }
            }
            summary.still_low_on_space = low_space;
        }

        summary.duration_ms = started.elapsed().as_millis() as u64;

        if summary.files_deleted > 0 || !summary.errors.is_empty() || summary.still_low_on_space {
            tracing::info!(
                trigger = ?summary.trigger,
                deleted = summary.files_deleted,
                bytes_freed = summary.bytes_freed,
                sent_deleted = summary.sent_deleted,
                unsent_deleted = summary.unsent_deleted,
                already_missing = summary.already_missing,
                skipped_in_use = summary.skipped_in_use,
                errors = summary.errors.len(),
                still_low = summary.still_low_on_space,
                duration_ms = summary.duration_ms,
                "Storage reconcile finished"
            );
        }
        if summary.unsent_deleted > 0 {
            tracing::warn!(
                unsent_deleted = summary.unsent_deleted,
                "Deleted captures whose records were not yet delivered"
            );
        }

        if let Err(e) = self.refresh_status().await {
            tracing::warn!(error = %e, "Failed to refresh storage status");
        }
        *self.last_summary.write().await = Some(summary.clone());
        Ok(summary)
    }
}

pub struct StorageMonitor {
    reconciler: Reconciler,
    workers: Mutex<Option<Workers>>,
}

impl StorageMonitor {
    pub fn new(config: StorageMonitorConfig, store: RecordStore, space: Arc<dyn SpaceProbe>) -> Self {
        Self {
            reconciler: Reconciler {
                config: Arc::new(config),
                store,
                space,
                status: Arc::new(RwLock::new(None)),
                last_summary: Arc::new(RwLock::new(None)),
            },
            workers: Mutex::new(None),
        }
    }

    /// One reconcile pass
    pub async fn reconcile(&self) -> Result<CleanupSummary> {
        self.reconciler.reconcile().await
    }

    /// Recompute the storage status now
    pub async fn refresh_status(&self) -> Result<StorageStatus> {
        self.reconciler.refresh_status().await
    }

    /// Last computed status (no I/O)
    pub async fn status(&self) -> Option<StorageStatus> {
        self.reconciler.status.read().await.clone()
    }

    pub async fn last_summary(&self) -> Option<CleanupSummary> {
        self.reconciler.last_summary.read().await.clone()
    }

    /// Reconcile every `interval` (config default when None). False if already running.
    pub async fn start(&self, interval: Option<Duration>) -> bool {
        let mut slot = self.workers.lock().await;
        if slot.is_some() {
            tracing::warn!("Storage monitor already running");
            return false;
        }

        let interval = interval.unwrap_or(self.reconciler.config.interval);
        let reconciler = self.reconciler.clone();
        let mut workers = Workers::new();
        let mut signal = workers.signal();

        workers.spawn("storage-monitor", async move {
            loop {
                if signal.is_stopped() {
                    break;
                }
                if let Err(e) = reconciler.reconcile().await {
                    tracing::error!(error = %e, "Storage reconcile failed");
                }
                if signal.sleep(interval).await {
                    break;
                }
            }
            tracing::info!("Storage monitor stopped");
        });

        *slot = Some(workers);
        tracing::info!(
            capture_dir = %self.reconciler.config.capture_dir.display(),
            interval_secs = interval.as_secs(),
            "Storage monitor started"
        );
        true
    }

    pub async fn stop(&self) {
        let workers = self.workers.lock().await.take();
        if let Some(workers) = workers {
            workers.shutdown(Duration::from_secs(30)).await;
        }
    }

    pub async fn is_running(&self) -> bool {
        self.workers.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, secs: u64, sent: bool) -> CaptureFile {
        CaptureFile {
            path: format!("/c/{}", name).into(),
            size: 1,
            modified: SystemTime::UNIX_EPOCH + Duration::from_secs(secs),
            sent,
        }
    }

    #[test]
    fn test_order_sent_first_then_oldest() {
        let mut files = vec![
            file("u-old", 1, false),
            file("s-new", 30, true),
            file("s-old", 10, true),
            file("u-new", 40, false),
        ];
        order_candidates(&mut files);
        let names: Vec<String> = files
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["s-old", "s-new", "u-old", "u-new"]);
    }

    #[tokio::test]
    async fn test_scan_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let files = scan_capture_dir(&dir.path().join("absent")).await.unwrap();
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn test_scan_is_recursive() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("2026/01/02")).unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"aa").unwrap();
        std::fs::write(dir.path().join("2026/01/02/b.jpg"), b"bbb").unwrap();

        let files = scan_capture_dir(dir.path()).await.unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files.iter().map(|f| f.size).sum::<u64>(), 5);
    }

    #[test]
    fn test_normalize_recorded_path_variants() {
        let dir = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        std::fs::create_dir_all(root.join("day")).unwrap();
        std::fs::write(root.join("day/a.jpg"), b"a").unwrap();
        let expected = root.join("day/a.jpg");

        let dotted = format!("{}/./day/../day/a.jpg", dir.path().display());
        assert_eq!(normalize_recorded_path(&dotted, &root), expected);
        assert_eq!(normalize_recorded_path("day/a.jpg", &root), expected);
        assert_eq!(
            normalize_recorded_path("/gone/./x/../b.jpg", &root),
            PathBuf::from("/gone/b.jpg")
        );
    }
}
