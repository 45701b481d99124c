//! Deferred removal of playlist workspaces and archives, plus the tree
//! removal shared with single-item job directories.
//!
//! A job is queued once its response body has been handed off. A spawned task
//! waits out the configured delay on a [`Timer`] and then removes both paths.
//! On shutdown [`CleanupScheduler::flush_pending`] runs whatever is still
//! queued. Each job is claimed from the registry exactly once, so it runs at
//! most once whichever path gets there first.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Source of delays; swapped out in tests so nothing really waits.
#[async_trait]
pub trait Timer: Send + Sync + 'static {
    async fn sleep(&self, delay: Duration);
}

pub struct TokioTimer;

#[async_trait]
impl Timer for TokioTimer {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

/// Filesystem footprint of one finished playlist job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupJob {
    pub workspace: PathBuf,
    pub archive: PathBuf,
}

#[derive(Clone)]
pub struct CleanupScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    delay: Duration,
    timer: Arc<dyn Timer>,
    pending: Mutex<HashMap<u64, CleanupJob>>,
    next_id: AtomicU64,
}

impl SchedulerInner {
    fn claim(&self, id: u64) -> Option<CleanupJob> {
        self.pending.lock().remove(&id)
    }
}

impl CleanupScheduler {
    pub fn new(delay: Duration) -> Self {
        Self::with_timer(delay, Arc::new(TokioTimer))
    }

    pub fn with_timer(delay: Duration, timer: Arc<dyn Timer>) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                delay,
                timer,
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn delay(&self) -> Duration {
        self.inner.delay
    }

    /// Number of jobs queued but not yet run.
    pub fn pending(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Queues `job` and spawns its delayed run. Must be called from within a
    /// tokio runtime.
    pub fn schedule(&self, job: CleanupJob) -> JoinHandle<()> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        info!(
            id,
            workspace = %job.workspace.display(),
            archive = %job.archive.display(),
            delay_secs = self.inner.delay.as_secs(),
            "cleanup scheduled"
        );
        self.inner.pending.lock().insert(id, job);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.timer.sleep(inner.delay).await;
            match inner.claim(id) {
                Some(job) => run_cleanup(job).await,
                None => debug!(id, "cleanup already ran"),
            }
        })
    }

    /// Runs every queued job now. Returns how many ran.
    pub async fn flush_pending(&self) -> usize {
        let jobs = self
            .inner
            .pending
            .lock()
            .drain()
            .map(|(_, job)| job)
            .collect::<Vec<_>>();
        let count = jobs.len();
        for job in jobs {
            run_cleanup(job).await;
        }
        if count > 0 {
            info!(count, "flushed pending cleanups");
        }
        count
    }
}

/// Removes the job's workspace and archive on the blocking pool.
pub async fn run_cleanup(job: CleanupJob) {
    let fallback = job.clone();
    if let Err(err) = tokio::task::spawn_blocking(move || remove_job_files(&job)).await {
        warn!(error = %err, "cleanup worker failed, removing inline");
        remove_job_files(&fallback);
    }
}

/// Never fails; anything that cannot be removed is logged.
pub fn remove_job_files(job: &CleanupJob) {
    remove_tree(&job.workspace, "workspace");
    report_removal(&job.archive, "archive", fs::remove_file(&job.archive));
}

/// Removes `path` and everything below it, deepest entries first. An entry
/// that cannot be removed is logged and skipped; its siblings still go.
pub fn remove_tree(path: &Path, what: &str) {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => return report_removal(path, what, fs::remove_file(path)),
        Err(err) => return report_removal(path, what, Err(err)),
    }

    let mut failures = 0usize;
    for entry in WalkDir::new(path).contents_first(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                failures += 1;
                warn!(error = %err, "failed to walk {what}");
                continue;
            }
        };
        let result = if entry.file_type().is_dir() {
            fs::remove_dir(entry.path())
        } else {
            fs::remove_file(entry.path())
        };
        match result {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                failures += 1;
                warn!(path = %entry.path().display(), error = %err, "failed to remove {what} entry");
            }
        }
    }

    if failures == 0 {
        info!(path = %path.display(), "removed {what}");
    } else {
        warn!(path = %path.display(), failures, "{what} only partly removed");
    }
}

fn report_removal(path: &Path, what: &str, result: io::Result<()>) {
    match result {
        Ok(()) => info!(path = %path.display(), "removed {what}"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "{what} already gone")
        }
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove {what}"),
    }
}

/// Schedules its job when dropped. Carried by a response body so cleanup is
/// queued only once the body is finished or abandoned.
pub struct CleanupGuard {
    scheduler: CleanupScheduler,
    job: Option<CleanupJob>,
}

impl CleanupGuard {
    pub fn new(scheduler: CleanupScheduler, job: CleanupJob) -> Self {
        Self {
            scheduler,
            job: Some(job),
        }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let Some(job) = self.job.take() else {
            return;
        };
        if tokio::runtime::Handle::try_current().is_ok() {
            self.scheduler.schedule(job);
        } else {
            warn!("no runtime available, removing job files immediately");
            remove_job_files(&job);
        }
    }
}
