//! Playlist bulk download: one engine call fills a fresh workspace, the
//! workspace is zipped into the download root, the zip is verified, and the
//! caller gets an open archive plus a guard that queues deferred cleanup.
//!
//! A job moves through [`JobState`] strictly in declaration order. Until it
//! reaches [`JobState::Done`] the workspace is a [`TempDir`], so any failure
//! removes it on the spot; a half-written archive is removed as well.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use tempfile::{Builder, TempDir};
use tracing::{debug, error, info, warn};

use crate::{
    archive::{build_archive, verify_archive},
    cleanup::{CleanupGuard, CleanupJob, CleanupScheduler},
    engine::{ContentKind, PlaylistMode, YtDlp, title_template},
    error::{ServiceError, ServiceResult},
    metadata::extract_playlist,
    sanitize::sanitize_filename,
};

/// Archive base name used when the playlist has no usable title.
pub const FALLBACK_NAME: &str = "playlist";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    MetadataResolved,
    Downloading,
    Archiving,
    Verifying,
    Done,
    Error,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Created => "created",
            Self::MetadataResolved => "metadata_resolved",
            Self::Downloading => "downloading",
            Self::Archiving => "archiving",
            Self::Verifying => "verifying",
            Self::Done => "done",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

/// On-disk footprint of a finished job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadJob {
    pub workspace_dir: PathBuf,
    pub archive_path: PathBuf,
    pub expected_file_count: usize,
}

/// A verified archive, open and ready to stream.
pub struct PlaylistArchive {
    pub job: DownloadJob,
    pub file: tokio::fs::File,
    pub len: u64,
    /// Client-facing name, e.g. `Road Trip_videos.zip`.
    pub filename: String,
    pub cleanup: CleanupGuard,
}

/// One pipeline for both content kinds; the kind picks the engine options,
/// workspace prefix and archive suffix.
#[derive(Clone)]
pub struct PlaylistPipeline {
    engine: YtDlp,
    download_root: PathBuf,
    temp_root: PathBuf,
    scheduler: CleanupScheduler,
}

struct Tracker<'a> {
    url: &'a str,
    token: String,
    state: JobState,
}

impl Tracker<'_> {
    fn advance(&mut self, next: JobState) {
        debug!(url = %self.url, job = %self.token, from = %self.state, to = %next, "playlist job state");
        self.state = next;
    }
}

impl PlaylistPipeline {
    pub fn new(engine: YtDlp, download_root: impl Into<PathBuf>, scheduler: CleanupScheduler) -> Self {
        Self {
            engine,
            download_root: download_root.into(),
            temp_root: std::env::temp_dir(),
            scheduler,
        }
    }

    /// Parent directory for job workspaces; the system temp dir by default.
    pub fn with_temp_root(mut self, temp_root: impl Into<PathBuf>) -> Self {
        self.temp_root = temp_root.into();
        self
    }

    pub async fn run(&self, url: &str, kind: ContentKind) -> ServiceResult<PlaylistArchive> {
        let workspace = Builder::new()
            .prefix(kind.workspace_prefix())
            .tempdir_in(&self.temp_root)?;
        let token = workspace_token(workspace.path(), kind.workspace_prefix());
        let mut tracker = Tracker {
            url,
            token,
            state: JobState::Created,
        };
        info!(%url, job = %tracker.token, workspace = %workspace.path().display(), "playlist job created");

        match self.drive(&mut tracker, workspace, kind).await {
            Ok(archive) => Ok(archive),
            Err(err) => {
                error!(
                    %url,
                    job = %tracker.token,
                    failed_in = %tracker.state,
                    kind = err.kind(),
                    error = %err,
                    "playlist job failed"
                );
                tracker.advance(JobState::Error);
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        tracker: &mut Tracker<'_>,
        workspace: TempDir,
        kind: ContentKind,
    ) -> ServiceResult<PlaylistArchive> {
        let summary = extract_playlist(&self.engine, tracker.url).await?;
        let name = archive_base_name(summary.name.as_deref());
        tracker.advance(JobState::MetadataResolved);

        tracker.advance(JobState::Downloading);
        let options = kind
            .engine_options()
            .with_playlist(PlaylistMode::Whole)
            .with_output_template(title_template(workspace.path()));
        self.engine
            .run(tracker.url, &options)
            .await
            .map_err(ServiceError::from_download)?;

        tracker.advance(JobState::Archiving);
        let archive_path = self.download_root.join(format!(
            "{name}_{}_{}.zip",
            tracker.token,
            kind.archive_suffix()
        ));
        let file_count = match self.assemble(tracker, workspace.path(), &archive_path).await {
            Ok(count) => count,
            Err(err) => {
                discard_archive(&archive_path);
                return Err(err);
            }
        };

        let job = DownloadJob {
            workspace_dir: workspace.keep(),
            archive_path,
            expected_file_count: file_count,
        };
        let cleanup = CleanupGuard::new(
            self.scheduler.clone(),
            CleanupJob {
                workspace: job.workspace_dir.clone(),
                archive: job.archive_path.clone(),
            },
        );
        tracker.advance(JobState::Done);

        let file = tokio::fs::File::open(&job.archive_path).await?;
        let len = file.metadata().await?.len();
        let filename = format!("{name}_{}.zip", kind.archive_suffix());
        info!(
            url = %tracker.url,
            job = %tracker.token,
            files = job.expected_file_count,
            bytes = len,
            %filename,
            "playlist archive ready"
        );

        Ok(PlaylistArchive {
            job,
            file,
            len,
            filename,
            cleanup,
        })
    }

    async fn assemble(
        &self,
        tracker: &mut Tracker<'_>,
        workspace: &Path,
        archive_path: &Path,
    ) -> ServiceResult<usize> {
        let (source, target) = (workspace.to_path_buf(), archive_path.to_path_buf());
        let count = tokio::task::spawn_blocking(move || build_archive(&source, &target))
            .await
            .map_err(|err| ServiceError::Unexpected(format!("archive worker failed: {err}")))??;

        tracker.advance(JobState::Verifying);
        let target = archive_path.to_path_buf();
        tokio::task::spawn_blocking(move || verify_archive(&target))
            .await
            .map_err(|err| ServiceError::Unexpected(format!("verify worker failed: {err}")))??;
        Ok(count)
    }
}

/// Sanitized playlist title, or [`FALLBACK_NAME`] when nothing usable is left.
pub fn archive_base_name(reported: Option<&str>) -> String {
    let cleaned = sanitize_filename(reported.unwrap_or(FALLBACK_NAME));
    if cleaned.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        cleaned
    }
}

/// Random suffix `tempfile` appended to the workspace prefix.
fn workspace_token(workspace: &Path, prefix: &str) -> String {
    let Some(name) = workspace.file_name() else {
        return String::new();
    };
    let name = name.to_string_lossy();
    name.strip_prefix(prefix).unwrap_or(name.as_ref()).to_string()
}

fn discard_archive(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed unusable archive"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove unusable archive"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{engine::stub, quality::QualitySpec};
    use std::{fs, time::Duration};
    use tempfile::tempdir;
    use zip::ZipArchive;

    struct Fixture {
        bin: TempDir,
        root: TempDir,
        temp: TempDir,
        scheduler: CleanupScheduler,
        pipeline: PlaylistPipeline,
    }

    fn fixture() -> Fixture {
        let bin = tempdir().unwrap();
        let root = tempdir().unwrap();
        let temp = tempdir().unwrap();
        let engine = YtDlp::new(stub::install(bin.path()), None, 2);
        let scheduler = CleanupScheduler::new(Duration::from_secs(300));
        let pipeline = PlaylistPipeline::new(engine, root.path(), scheduler.clone())
            .with_temp_root(temp.path());
        Fixture {
            bin,
            root,
            temp,
            scheduler,
            pipeline,
        }
    }

    fn archive_entries(path: &Path) -> Vec<String> {
        let archive = ZipArchive::new(fs::File::open(path).unwrap()).unwrap();
        let mut names = archive.file_names().map(str::to_string).collect::<Vec<_>>();
        names.sort();
        names
    }

    fn dir_is_empty(path: &Path) -> bool {
        fs::read_dir(path).unwrap().next().is_none()
    }

    #[test]
    fn base_name_falls_back_to_playlist() {
        assert_eq!(archive_base_name(Some("Road: Trip?")), "Road Trip");
        assert_eq!(archive_base_name(None), "playlist");
        assert_eq!(archive_base_name(Some(" ?*: ")), "playlist");
    }

    #[test]
    fn token_is_the_suffix_after_prefix() {
        let path = Path::new("/tmp/playlist_video_Ab3xYz");
        assert_eq!(workspace_token(path, "playlist_video_"), "Ab3xYz");
    }

    #[tokio::test]
    async fn video_playlist_reaches_done_with_every_item_archived() {
        let fx = fixture();
        let archive = fx
            .pipeline
            .run(
                "https://example.com/playlist?list=PLxyz",
                ContentKind::Video(QualitySpec::parse("1080p")),
            )
            .await
            .unwrap();

        assert_eq!(archive.filename, "Road Trip_videos.zip");
        assert_eq!(archive.job.expected_file_count, 2);
        assert_eq!(archive.job.archive_path.parent(), Some(fx.root.path()));
        assert!(archive.job.workspace_dir.starts_with(fx.temp.path()));
        assert_eq!(
            archive_entries(&archive.job.archive_path),
            vec!["First Song.mp4".to_string(), "Third Song.mp4".to_string()]
        );
        assert_eq!(archive.len, fs::metadata(&archive.job.archive_path).unwrap().len());

        let calls = stub::calls(fx.bin.path());
        assert_eq!(calls.len(), 2);
        assert!(calls[0].contains("--flat-playlist"));
        assert!(calls[1].contains("--yes-playlist"));
        assert!(calls[1].contains("height<=1080"));
    }

    #[tokio::test]
    async fn audio_playlist_uses_audio_suffix() {
        let fx = fixture();
        let archive = fx
            .pipeline
            .run("https://example.com/playlist?list=PLxyz", ContentKind::Audio)
            .await
            .unwrap();

        assert_eq!(archive.filename, "Road Trip_audio.zip");
        assert!(
            archive
                .job
                .workspace_dir
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("playlist_audio_")
        );
        assert_eq!(
            archive_entries(&archive.job.archive_path),
            vec!["First Song.mp3".to_string(), "Third Song.mp3".to_string()]
        );
    }

    #[tokio::test]
    async fn empty_workspace_still_produces_valid_archive() {
        let fx = fixture();
        let archive = fx
            .pipeline
            .run("https://example.com/playlist?list=EMPTY", ContentKind::Audio)
            .await
            .unwrap();
        assert_eq!(archive.job.expected_file_count, 0);
        assert!(archive_entries(&archive.job.archive_path).is_empty());
    }

    #[tokio::test]
    async fn untitled_playlist_is_named_playlist() {
        let fx = fixture();
        let archive = fx
            .pipeline
            .run(
                "https://example.com/playlist?list=NONAME",
                ContentKind::Video(QualitySpec::default()),
            )
            .await
            .unwrap();
        assert_eq!(archive.filename, "playlist_videos.zip");
    }

    #[tokio::test]
    async fn dropping_archive_queues_cleanup() {
        let fx = fixture();
        let archive = fx
            .pipeline
            .run("https://example.com/playlist?list=PLxyz", ContentKind::Audio)
            .await
            .unwrap();
        let job = archive.job.clone();
        assert_eq!(fx.scheduler.pending(), 0);

        drop(archive);
        assert_eq!(fx.scheduler.pending(), 1);
        assert!(job.workspace_dir.exists());

        assert_eq!(fx.scheduler.flush_pending().await, 1);
        assert!(!job.workspace_dir.exists());
        assert!(!job.archive_path.exists());
    }

    #[tokio::test]
    async fn download_failure_removes_workspace_and_queues_nothing() {
        let fx = fixture();
        let err = fx
            .pipeline
            .run("https://example.com/playlist?list=BROKEN", ContentKind::Audio)
            .await
            .err()
            .unwrap();

        assert!(matches!(err, ServiceError::Download(_)));
        assert_eq!(err.status_code(), 400);
        assert!(dir_is_empty(fx.temp.path()));
        assert!(dir_is_empty(fx.root.path()));
        assert_eq!(fx.scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn metadata_failure_is_an_extraction_error() {
        let fx = fixture();
        let err = fx
            .pipeline
            .run("https://example.com/playlist?list=FAIL", ContentKind::Audio)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ServiceError::Extraction(_)));
        assert!(dir_is_empty(fx.temp.path()));
        assert_eq!(stub::calls(fx.bin.path()).len(), 1);
    }
}
